// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{actor_error, Array};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;

use super::{DeadlineInfo, Deadlines, Partition, QuantSpec};

pub fn new_deadline_info(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    DeadlineInfo::new(
        proving_period_start,
        deadline_idx,
        current_epoch,
        policy.wpost_period_deadlines,
        policy.wpost_proving_period,
        policy.wpost_challenge_window,
        policy.wpost_challenge_lookback,
        policy.fault_declaration_cutoff,
    )
}

impl Deadlines {
    /// Returns the deadline and partition index for a sector number.
    /// Returns an error if the sector number is not tracked by `self`.
    pub fn find_sector<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<(u64, u64)> {
        for i in 0..self.due.len() {
            let deadline_idx = i as u64;
            let deadline = self.load_deadline(policy, store, deadline_idx)?;
            let partitions = Array::<Partition, _>::load(&deadline.partitions, store)?;

            let mut partition_idx = None;

            partitions.for_each_while(|i, partition| {
                if partition.sectors.get(sector_number) {
                    partition_idx = Some(i);
                    Ok(false)
                } else {
                    Ok(true)
                }
            })?;

            if let Some(partition_idx) = partition_idx {
                return Ok((deadline_idx, partition_idx));
            }
        }

        Err(actor_error!(not_found; "sector {} not due at any deadline", sector_number).into())
    }
}

/// Computes the deadline that is current at `current_epoch` for a proving period
/// starting at `period_start`. Epochs before the period start map to deadline zero.
pub fn compute_proving_period_deadline(
    policy: &Policy,
    period_start: ChainEpoch,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    let mut period_progress = current_epoch - period_start;
    if period_progress >= policy.wpost_proving_period {
        // Proving period has completely elapsed.
        period_progress %= policy.wpost_proving_period;
    }
    let deadline_idx = if period_progress < 0 {
        0
    } else {
        (period_progress / policy.wpost_challenge_window) as u64
    };
    new_deadline_info(policy, period_start, deadline_idx, current_epoch)
}

/// Returns true if the deadline at the given index is currently mutable.
pub fn deadline_is_mutable(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    // Get the next non-elapsed deadline (i.e., the next time we care about
    // mutations to the deadline).
    let deadline_info =
        new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
            .next_not_elapsed();

    // Ensure that the current epoch is at least one challenge window before
    // that deadline opens.
    current_epoch < deadline_info.open - policy.wpost_challenge_window
}

pub fn quant_spec_for_deadline(policy: &Policy, di: &DeadlineInfo) -> QuantSpec {
    QuantSpec {
        unit: policy.wpost_proving_period,
        offset: di.last(),
    }
}

// Returns true if the given deadline may compacted in the current epoch.
// Deadlines may not be compacted when:
//
// 1. The deadline is currently being challenged.
// 2. The deadline is to be challenged next.
pub fn deadline_available_for_compaction(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    deadline_is_mutable(policy, proving_period_start, deadline_idx, current_epoch)
}

// Determine current period start and deadline index directly from current epoch and
// the offset implied by the proving period. This works correctly even for the state
// of a miner actor without an active deadline cron
pub fn new_deadline_info_from_offset_and_epoch(
    policy: &Policy,
    period_start_seed: ChainEpoch,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    let q = QuantSpec {
        unit: policy.wpost_proving_period,
        offset: period_start_seed,
    };
    let current_period_start = q.quantize_down(current_epoch);
    let current_deadline_idx = ((current_epoch - current_period_start)
        / policy.wpost_challenge_window) as u64
        % policy.wpost_period_deadlines;
    new_deadline_info(
        policy,
        current_period_start,
        current_deadline_idx,
        current_epoch,
    )
}

/// Returns the start of the proving period that contains `current_epoch`, for a miner whose
/// periods begin at `offset` modulo the proving period length.
pub fn current_proving_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    let curr_modulus = current_epoch.rem_euclid(policy.wpost_proving_period);

    // How far ahead the current epoch is from the previous offset boundary.
    let period_progress = if curr_modulus >= offset {
        curr_modulus - offset
    } else {
        policy.wpost_proving_period - (offset - curr_modulus)
    };

    current_epoch - period_progress
}

/// Index of the deadline that is open at `current_epoch` in the period starting at `period_start`.
pub fn current_deadline_index(
    policy: &Policy,
    current_epoch: ChainEpoch,
    period_start: ChainEpoch,
) -> u64 {
    ((current_epoch - period_start) / policy.wpost_challenge_window) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proving_period_start_follows_offset() {
        let policy = Policy::default();
        assert_eq!(100, current_proving_period_start(&policy, 100, 100));
        assert_eq!(100, current_proving_period_start(&policy, 2979, 100));
        assert_eq!(2980, current_proving_period_start(&policy, 2980, 100));
        assert_eq!(-2780, current_proving_period_start(&policy, 99, 100));
    }

    #[test]
    fn deadline_index_and_info_agree() {
        let policy = Policy::default();
        assert_eq!(0, current_deadline_index(&policy, 59, 0));
        assert_eq!(1, current_deadline_index(&policy, 60, 0));

        let di = new_deadline_info_from_offset_and_epoch(&policy, 100, 2880 * 3 + 100 + 125);
        assert_eq!(2880 * 3 + 100, di.period_start);
        assert_eq!(2, di.index);
        assert!(di.is_open());

        let di = compute_proving_period_deadline(&policy, 0, 2880 + 61);
        assert_eq!(1, di.index);
        let di = compute_proving_period_deadline(&policy, 100, 50);
        assert_eq!(0, di.index);
    }

    #[test]
    fn mutability_excludes_open_and_next_deadlines() {
        let policy = Policy::default();
        let window = policy.wpost_challenge_window;

        // Deadline 2 opens at 120; it is immutable once within one window of opening.
        assert!(deadline_is_mutable(&policy, 0, 2, window - 1));
        assert!(!deadline_is_mutable(&policy, 0, 2, window));
        assert!(!deadline_is_mutable(&policy, 0, 2, 2 * window + 1));
        // After it closes, the next instance is far away again.
        assert!(deadline_is_mutable(&policy, 0, 2, 3 * window));
        assert!(deadline_available_for_compaction(&policy, 0, 2, 3 * window));

        let di = new_deadline_info(&policy, 0, 2, 0);
        assert_eq!(
            QuantSpec {
                unit: policy.wpost_proving_period,
                offset: 3 * window - 1
            },
            quant_spec_for_deadline(&policy, &di)
        );
    }
}
