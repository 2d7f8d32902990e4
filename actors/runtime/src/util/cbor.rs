// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{to_vec, CborStore, DAG_CBOR};
use multihash_codetable::{Code, MultihashDigest};
use serde::{de::DeserializeOwned, ser};

use crate::{actor_error, ActorError};

/// Serializes a structure as a CBOR vector of bytes, returning a serialization error on failure.
/// `desc` is a noun phrase for the object being serialized, included in any error message.
pub fn serialize_vec<T>(value: &T, desc: &str) -> Result<Vec<u8>, ActorError>
where
    T: ser::Serialize + ?Sized,
{
    to_vec(value).map_err(|e| actor_error!(serialization; "failed to serialize {}: {}", desc, e))
}

/// Writes a single object to the store as a DAG-CBOR block addressed by its Blake2b-256 hash.
pub fn put_cbor<BS, T>(store: &BS, value: &T, desc: &str) -> anyhow::Result<Cid>
where
    BS: Blockstore,
    T: ser::Serialize + ?Sized,
{
    let bytes = serialize_vec(value, desc)?;
    let cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes));
    store.put_keyed(&cid, &bytes)?;
    Ok(cid)
}

/// Loads an object that must exist under `root`. A missing block is an illegal state.
pub fn get_cbor<BS, T>(store: &BS, root: &Cid, desc: &str) -> anyhow::Result<T>
where
    BS: Blockstore,
    T: DeserializeOwned,
{
    store
        .get_cbor(root)?
        .ok_or_else(|| actor_error!(illegal_state; "failed to load {} at {}", desc, root).into())
}
