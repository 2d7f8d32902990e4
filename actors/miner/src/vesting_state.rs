// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::{iter, mem};

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use itertools::{EitherOrBoth, Itertools};
use num_traits::Zero;

use super::{QuantSpec, VestSpec};

// Represents miner funds that will vest at the given epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// Represents the vesting table state for the miner.
/// Entries are sorted by epoch, with at most one per epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct VestingFunds {
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Default::default()
    }

    /// Removes every entry vesting strictly before `current_epoch` and returns their total.
    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        let i = self.funds.partition_point(|fund| fund.epoch < current_epoch);

        self.funds
            .drain(..i)
            .fold(TokenAmount::zero(), |mut total, fund| {
                total += fund.amount;
                total
            })
    }

    /// Schedules `vesting_sum` to vest linearly according to `spec`, merging the new
    /// entries into the table.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        // Entries land on the period's grid so each is released when a deadline closes.
        let vest_begin = current_epoch + spec.initial_delay;
        let quant = QuantSpec {
            unit: spec.quantization,
            offset: proving_period_start,
        };

        let mut vested_so_far = TokenAmount::zero();

        let mut epoch = vest_begin;

        // Create an iterator for the vesting schedule we're going to "join" with the current
        // vesting schedule.
        let new_funds = iter::from_fn(|| {
            if vested_so_far >= *vesting_sum {
                return None;
            }

            epoch += spec.step_duration;

            let vest_epoch = quant.quantize_up(epoch);

            let elapsed = vest_epoch - vest_begin;
            let target_vest = if elapsed < spec.vest_period {
                // Linear vesting
                (vesting_sum * elapsed).div_floor(spec.vest_period)
            } else {
                vesting_sum.clone()
            };

            let vest_this_time = &target_vest - &vested_so_far;
            vested_so_far = target_vest;

            Some(VestingFund {
                epoch: vest_epoch,
                amount: vest_this_time,
            })
        })
        // Several steps may quantize to the same epoch.
        .coalesce(|a, b| {
            if a.epoch == b.epoch {
                Ok(VestingFund {
                    epoch: a.epoch,
                    amount: a.amount + b.amount,
                })
            } else {
                Err((a, b))
            }
        });

        // Take the old funds array and replace it with a new one.
        let funds_len = self.funds.len();
        let old_funds = mem::replace(&mut self.funds, Vec::with_capacity(funds_len));

        // Fill back in the funds array, merging existing and new schedule.
        self.funds.extend(
            old_funds
                .into_iter()
                .merge_join_by(new_funds, |a, b| a.epoch.cmp(&b.epoch))
                .map(|item| match item {
                    EitherOrBoth::Left(a) => a,
                    EitherOrBoth::Right(b) => b,
                    EitherOrBoth::Both(a, b) => VestingFund {
                        epoch: a.epoch,
                        amount: a.amount + b.amount,
                    },
                }),
        );
    }

    /// Unlocks up to `target` from entries that have not vested yet, earliest first.
    /// Returns the amount actually unlocked.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut amount_unlocked = TokenAmount::zero();
        let mut last_index_to_remove = None;
        let mut start_index_for_remove = 0;

        // retain funds that should have vested and find amount unlocked
        for (i, vf) in self.funds.iter_mut().enumerate() {
            if &amount_unlocked >= target {
                break;
            }

            if vf.epoch >= current_epoch {
                let unlock_amount = std::cmp::min(target - &amount_unlocked, vf.amount.clone());
                amount_unlocked += &unlock_amount;
                let new_amount = &vf.amount - &unlock_amount;

                if new_amount.is_zero() {
                    last_index_to_remove = Some(i);
                } else {
                    vf.amount = new_amount;
                }
            } else {
                start_index_for_remove = i + 1;
            }
        }

        // remove all funds that were fully unlocked
        if let Some(end) = last_index_to_remove {
            self.funds.drain(start_index_for_remove..=end);
        }

        amount_unlocked
    }

    /// Sum of all scheduled amounts.
    pub fn total(&self) -> TokenAmount {
        self.funds
            .iter()
            .fold(TokenAmount::zero(), |total, fund| total + &fund.amount)
    }
}
