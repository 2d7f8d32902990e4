// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::{anyhow, Context};
use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

use crate::builtin::{EPOCHS_IN_DAY, EPOCHS_IN_HOUR};

/// Network parameters consumed by the miner state machine.
///
/// A policy is handed to every operation that depends on a network constant, so that
/// differently parameterized networks can be driven from the same process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Maximum number of sectors that may be aggregated in a single proof.
    pub max_aggregated_sectors: u64,
    /// Minimum number of sectors that may be aggregated in a single proof.
    pub min_aggregated_sectors: u64,
    /// Maximum number of sectors a single batch pre-commit may contain.
    pub pre_commit_sector_batch_max_size: usize,
    /// Number of epochs after a pre-commit expires before its expiry entry is cleaned up.
    pub expired_pre_commit_clean_up_delay: ChainEpoch,

    /// The period over which all a miner's active sectors will be challenged.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the
    /// challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// Lookback from the deadline's challenge window opening from which to sample chain randomness
    /// for the challenge seed.
    pub wpost_challenge_lookback: ChainEpoch,

    /// Minimum period before a deadline's challenge window opens that a fault must be declared for
    /// that deadline.
    pub fault_declaration_cutoff: ChainEpoch,
    /// The maximum age of a fault before the sector is terminated.
    pub fault_max_age: ChainEpoch,

    /// The maximum number of sector infos that may be required to be loaded in a single
    /// invocation.
    pub sectors_max: usize,
    /// The maximum number of partitions that may be required to be loaded in a single
    /// invocation.
    pub max_partitions_per_deadline: u64,
    /// The maximum number of partitions that can be loaded in a single invocation.
    pub addressed_partitions_max: u64,
    /// Maximum number of unique "declarations" in batch operations.
    pub declarations_max: u64,
    /// The maximum number of sector numbers addressable in a single invocation.
    pub addressed_sectors_max: u64,

    /// Epochs after which chain state is final with overwhelming probability.
    pub chain_finality: ChainEpoch,
    /// Number of epochs between publishing a pre-commit and when the challenge for interactive
    /// PoRep is drawn.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: ChainEpoch,
    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: ChainEpoch,
}

impl Default for Policy {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Policy {
    pub fn mainnet() -> Self {
        Self {
            max_aggregated_sectors: 819,
            min_aggregated_sectors: 4,
            pre_commit_sector_batch_max_size: 256,
            expired_pre_commit_clean_up_delay: 8 * EPOCHS_IN_HOUR,
            wpost_proving_period: EPOCHS_IN_DAY,
            wpost_challenge_window: 30 * 60 / 30,
            wpost_period_deadlines: 48,
            wpost_challenge_lookback: 20,
            fault_declaration_cutoff: 20 + 50,
            fault_max_age: EPOCHS_IN_DAY * 14,
            sectors_max: 32 << 20,
            max_partitions_per_deadline: 3000,
            addressed_partitions_max: 3000,
            declarations_max: 3000,
            addressed_sectors_max: 10_000,
            chain_finality: 900,
            pre_commit_challenge_delay: 150,
            min_sector_expiration: 180 * EPOCHS_IN_DAY,
            max_sector_expiration_extension: 540 * EPOCHS_IN_DAY,
        }
    }

    /// A short proving period for local networks and tests: 48 deadlines of ten epochs each.
    pub fn devnet() -> Self {
        let wpost_challenge_window = 10;
        let wpost_proving_period = wpost_challenge_window * 48;
        Self {
            wpost_proving_period,
            wpost_challenge_window,
            wpost_challenge_lookback: 5,
            fault_declaration_cutoff: 7,
            fault_max_age: wpost_proving_period * 14,
            pre_commit_challenge_delay: 10,
            ..Self::mainnet()
        }
    }

    /// Parses a policy from TOML. Fields missing from the document keep their mainnet value.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let policy: Policy = toml::from_str(s).context("failed to parse policy")?;
        policy.validate()?;
        Ok(policy)
    }

    /// Checks that the proving period is tiled exactly by the deadline windows.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.wpost_challenge_window <= 0 || self.wpost_period_deadlines == 0 {
            return Err(anyhow!("challenge window and deadline count must be positive"));
        }
        if self.wpost_proving_period % self.wpost_challenge_window != 0 {
            return Err(anyhow!(
                "incompatible proving period {} and challenge window {}",
                self.wpost_proving_period,
                self.wpost_challenge_window
            ));
        }
        if self.wpost_period_deadlines as ChainEpoch * self.wpost_challenge_window
            != self.wpost_proving_period
        {
            return Err(anyhow!(
                "incompatible proving period {} and deadline count {}",
                self.wpost_proving_period,
                self.wpost_period_deadlines
            ));
        }
        Ok(())
    }
}
