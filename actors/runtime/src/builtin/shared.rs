// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::sector::SectorNumber;

/// Bit width of every HAMT persisted by the miner state.
pub const HAMT_BIT_WIDTH: u32 = 5;

/// Quality multiplier for committed capacity (no deals) in a sector.
pub const QUALITY_BASE_MULTIPLIER: i64 = 10;

/// Quality multiplier for unverified deals in a sector.
pub const DEAL_WEIGHT_MULTIPLIER: i64 = 10;

/// Quality multiplier for verified deals in a sector.
pub const VERIFIED_DEAL_WEIGHT_MULTIPLIER: i64 = 100;

/// Precision used for making QA power calculations.
pub const SECTOR_QUALITY_PRECISION: i64 = 20;

/// Largest sector number a miner may allocate.
pub const MAX_SECTOR_NUMBER: SectorNumber = i64::MAX as u64;
