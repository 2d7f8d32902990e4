// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_shared::commcid::FIL_COMMITMENT_SEALED;
use multihash_codetable::{Code, MultihashDigest};

/// A stand-in replica commitment derived from arbitrary bytes.
pub fn make_sealed_cid(input: &[u8]) -> Cid {
    Cid::new_v1(FIL_COMMITMENT_SEALED, Code::Blake2b256.digest(input))
}

pub fn bitfield_from_slice(sector_numbers: &[u64]) -> BitField {
    BitField::try_from_bits(sector_numbers.iter().copied()).unwrap()
}

#[track_caller]
pub fn assert_bitfield_equals(bf: &BitField, bits: &[u64]) {
    let expected = bitfield_from_slice(bits);
    assert!(
        bf == &expected,
        "bitfield {:?} != expected {:?}",
        bf.iter().collect::<Vec<_>>(),
        bits
    );
}
