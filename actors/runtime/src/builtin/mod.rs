// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::network::*;
pub use self::shared::*;

pub mod network;
pub mod shared;
