// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

use super::QuantSpec;

/// Deadline calculations with respect to a current epoch.
/// "Deadline" refers to the window during which proofs may be submitted.
/// Windows are the disjoint ranges `[open, close)`. A window's challenge epoch falls
/// before it opens.
#[derive(Default, Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
pub struct DeadlineInfo {
    /// Epoch at which this info was calculated.
    pub current_epoch: ChainEpoch,
    /// First epoch of the proving period (at or before `current_epoch`).
    pub period_start: ChainEpoch,
    /// Current deadline index, below `wpost_period_deadlines`.
    pub index: u64,
    /// First epoch from which a proof may be submitted (may be after `current_epoch`).
    pub open: ChainEpoch,
    /// First epoch from which a proof may no longer be submitted (after `open`).
    pub close: ChainEpoch,
    /// Epoch at which to sample the chain for challenge (< Open).
    pub challenge: ChainEpoch,
    /// First epoch at which a fault declaration is rejected (< Open).
    pub fault_cutoff: ChainEpoch,

    // Protocol parameters
    pub w_post_period_deadlines: u64,
    // the number of epochs in a window post proving period
    pub w_post_proving_period: ChainEpoch,
    pub w_post_challenge_window: ChainEpoch,
    pub w_post_challenge_lookback: ChainEpoch,
    pub fault_declaration_cutoff: ChainEpoch,
}

impl DeadlineInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period_start: ChainEpoch,
        deadline_idx: u64,
        current_epoch: ChainEpoch,
        w_post_period_deadlines: u64,
        w_post_proving_period: ChainEpoch,
        w_post_challenge_window: ChainEpoch,
        w_post_challenge_lookback: ChainEpoch,
        fault_declaration_cutoff: ChainEpoch,
    ) -> Self {
        if deadline_idx < w_post_period_deadlines {
            let deadline_open = period_start + (deadline_idx as i64 * w_post_challenge_window);
            Self {
                current_epoch,
                period_start,
                index: deadline_idx,
                open: deadline_open,
                close: deadline_open + w_post_challenge_window,
                challenge: deadline_open - w_post_challenge_lookback,
                fault_cutoff: deadline_open - fault_declaration_cutoff,
                w_post_period_deadlines,
                w_post_proving_period,
                w_post_challenge_window,
                w_post_challenge_lookback,
                fault_declaration_cutoff,
            }
        } else {
            // Return deadline info for a no-duration deadline immediately after the last real one.
            let after_last_deadline = period_start + w_post_proving_period;
            Self {
                current_epoch,
                period_start,
                index: deadline_idx,
                open: after_last_deadline,
                close: after_last_deadline,
                challenge: after_last_deadline,
                fault_cutoff: 0,
                w_post_period_deadlines,
                w_post_proving_period,
                w_post_challenge_window,
                w_post_challenge_lookback,
                fault_declaration_cutoff,
            }
        }
    }

    /// Whether the proving period has begun.
    pub fn period_started(&self) -> bool {
        self.current_epoch >= self.period_start
    }

    /// Whether the proving period has elapsed.
    pub fn period_elapsed(&self) -> bool {
        self.current_epoch >= self.next_period_start()
    }

    /// The last epoch in the proving period.
    pub fn period_end(&self) -> ChainEpoch {
        self.period_start + self.w_post_proving_period - 1
    }

    /// The first epoch in the next proving period.
    pub fn next_period_start(&self) -> ChainEpoch {
        self.period_start + self.w_post_proving_period
    }

    /// Whether the current deadline is currently open.
    pub fn is_open(&self) -> bool {
        self.current_epoch >= self.open && self.current_epoch < self.close
    }

    /// Whether the current deadline has already closed.
    pub fn has_elapsed(&self) -> bool {
        self.current_epoch >= self.close
    }

    /// The last epoch during which a proof may be submitted.
    pub fn last(&self) -> ChainEpoch {
        self.close - 1
    }

    /// Epoch at which the subsequent deadline opens.
    pub fn next_open(&self) -> ChainEpoch {
        self.close
    }

    /// Whether the deadline's fault cutoff has passed.
    pub fn fault_cutoff_passed(&self) -> bool {
        self.current_epoch >= self.fault_cutoff
    }

    /// Returns the next instance of this deadline that has not yet elapsed.
    pub fn next_not_elapsed(self) -> Self {
        if !self.has_elapsed() {
            return self;
        }

        // has elapsed, advance by some multiples of w_post_proving_period
        let gap = self.current_epoch - self.close;
        let delta_periods = 1 + gap / self.w_post_proving_period;

        Self::new(
            self.period_start + self.w_post_proving_period * delta_periods,
            self.index,
            self.current_epoch,
            self.w_post_period_deadlines,
            self.w_post_proving_period,
            self.w_post_challenge_window,
            self.w_post_challenge_lookback,
            self.fault_declaration_cutoff,
        )
    }

    /// Quantization of epochs keyed to the last epoch of this deadline.
    pub fn quant_spec(&self) -> QuantSpec {
        QuantSpec {
            unit: self.w_post_proving_period,
            offset: self.last(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(period_start: ChainEpoch, index: u64, current_epoch: ChainEpoch) -> DeadlineInfo {
        DeadlineInfo::new(period_start, index, current_epoch, 48, 2880, 60, 20, 70)
    }

    #[test]
    fn computes_window_boundaries() {
        let di = info(1000, 2, 1100);
        assert_eq!(1120, di.open);
        assert_eq!(1180, di.close);
        assert_eq!(1100, di.challenge);
        assert_eq!(1050, di.fault_cutoff);
        assert_eq!(1179, di.last());
        assert_eq!(1180, di.next_open());
        assert_eq!(3880, di.next_period_start());
        assert!(di.period_started());
        assert!(!di.is_open());
        assert!(!di.has_elapsed());
        assert!(di.fault_cutoff_passed());
        assert_eq!(QuantSpec { unit: 2880, offset: 1179 }, di.quant_spec());
    }

    #[test]
    fn index_past_the_end_is_an_empty_window() {
        let di = info(0, 48, 10);
        assert_eq!(2880, di.open);
        assert_eq!(2880, di.close);
        assert_eq!(0, di.fault_cutoff);
    }

    #[test]
    fn next_not_elapsed_skips_whole_periods() {
        let di = info(0, 0, 5770).next_not_elapsed();
        assert_eq!(5760, di.period_start);
        assert_eq!(5760, di.open);
        assert!(di.is_open());

        let di = info(0, 0, 6000).next_not_elapsed();
        assert_eq!(8640, di.period_start);
        assert!(!di.is_open());
        assert!(!di.has_elapsed());

        let open = info(0, 1, 30);
        assert_eq!(open, open.next_not_elapsed());
    }
}
