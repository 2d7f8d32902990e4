// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{
    DealWeight, EPOCHS_IN_DAY, EPOCHS_IN_HOUR, DEAL_WEIGHT_MULTIPLIER, QUALITY_BASE_MULTIPLIER,
    SECTOR_QUALITY_PRECISION, VERIFIED_DEAL_WEIGHT_MULTIPLIER,
};
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::{SectorSize, StoragePower};
use serde::{Deserialize, Serialize};

use super::{PowerPair, SectorOnChainInfo};

/// Ratio of sector size to maximum number of deals per sector.
/// The maximum number of deals is the sector size divided by this number (2^27)
/// which limits 32GiB sectors to 256 deals and 64GiB sectors to 512
pub const DEAL_LIMIT_DENOMINATOR: u64 = 134217728;

/// Quality of a sector: the multipliers for plain space, deal space and verified deal space,
/// averaged by the share of the sector's spacetime (`size * duration`) each occupies.
/// The result is relative to the base multiplier and scaled by `1 << SECTOR_QUALITY_PRECISION`.
pub fn quality_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> BigInt {
    let sector_space_time = BigInt::from(size as u64) * BigInt::from(duration);
    let total_deal_space_time = deal_weight + verified_weight;

    let weighted_base_space_time =
        (&sector_space_time - total_deal_space_time) * QUALITY_BASE_MULTIPLIER;
    let weighted_deal_space_time = deal_weight * DEAL_WEIGHT_MULTIPLIER;
    let weighted_verified_space_time = verified_weight * VERIFIED_DEAL_WEIGHT_MULTIPLIER;
    let weighted_sum_space_time =
        weighted_base_space_time + weighted_deal_space_time + weighted_verified_space_time;
    let scaled_up_weighted_sum_space_time: BigInt =
        weighted_sum_space_time << SECTOR_QUALITY_PRECISION;

    scaled_up_weighted_sum_space_time
        .div_floor(&sector_space_time)
        .div_floor(&BigInt::from(QUALITY_BASE_MULTIPLIER))
}

/// The power for a sector size, committed duration, and weight.
pub fn qa_power_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> StoragePower {
    let quality = quality_for_weight(size, duration, deal_weight, verified_weight);
    (BigInt::from(size as u64) * quality) >> SECTOR_QUALITY_PRECISION
}

/// The quality-adjusted power for a sector.
pub fn qa_power_for_sector(size: SectorSize, sector: &SectorOnChainInfo) -> StoragePower {
    let duration = sector.expiration - sector.activation;
    qa_power_for_weight(
        size,
        duration,
        &sector.deal_weight,
        &sector.verified_deal_weight,
    )
}

/// Raw and quality-adjusted power of a single sector.
pub fn power_for_sector(sector_size: SectorSize, sector: &SectorOnChainInfo) -> PowerPair {
    PowerPair {
        raw: BigInt::from(sector_size as u64),
        qa: qa_power_for_sector(sector_size, sector),
    }
}

/// Returns the sum of the raw byte and quality-adjusted power for sectors.
pub fn power_for_sectors(sector_size: SectorSize, sectors: &[SectorOnChainInfo]) -> PowerPair {
    let qa = sectors
        .iter()
        .map(|s| qa_power_for_sector(sector_size, s))
        .sum();

    PowerPair {
        raw: BigInt::from(sector_size as u64) * BigInt::from(sectors.len()),
        qa,
    }
}

/// Determine maximum number of deal miner's sector can hold
pub fn sector_deals_max(size: SectorSize) -> u64 {
    std::cmp::max(256, size as u64 / DEAL_LIMIT_DENOMINATOR)
}

/// The maximum number of partitions that may be required to be loaded in a single invocation,
/// when all the sector infos for the partitions will be loaded.
pub fn load_partitions_sectors_max(policy: &Policy, partition_sector_count: u64) -> u64 {
    std::cmp::min(
        policy.addressed_sectors_max / partition_sector_count,
        policy.addressed_partitions_max,
    )
}

/// Specification for a linear vesting schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestSpec {
    /// Delay before any amount starts vesting.
    pub initial_delay: ChainEpoch,
    /// Period over which the total should vest, after the initial delay.
    pub vest_period: ChainEpoch,
    /// Duration between successive incremental vests (independent of vesting period).
    pub step_duration: ChainEpoch,
    /// Maximum precision of vesting table (limits cardinality of table).
    pub quantization: ChainEpoch,
}

/// The vesting schedule for total rewards (block reward + gas reward) earned by a block producer.
pub const REWARD_VESTING_SPEC: VestSpec = VestSpec {
    initial_delay: 0,
    vest_period: 180 * EPOCHS_IN_DAY,
    step_duration: EPOCHS_IN_DAY,
    quantization: 12 * EPOCHS_IN_HOUR,
};

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    const SIZE: SectorSize = SectorSize::_32GiB;

    #[test]
    fn committed_capacity_has_unit_quality() {
        let duration = 180 * EPOCHS_IN_DAY;
        let power = qa_power_for_weight(SIZE, duration, &BigInt::zero(), &BigInt::zero());
        assert_eq!(BigInt::from(SIZE as u64), power);
    }

    #[test]
    fn full_deal_sector_has_unit_quality() {
        let duration = 180 * EPOCHS_IN_DAY;
        let weight = BigInt::from(SIZE as u64) * duration;
        let power = qa_power_for_weight(SIZE, duration, &weight, &BigInt::zero());
        assert_eq!(BigInt::from(SIZE as u64), power);
    }

    #[test]
    fn full_verified_sector_has_tenfold_quality() {
        let duration = 180 * EPOCHS_IN_DAY;
        let weight = BigInt::from(SIZE as u64) * duration;
        let power = qa_power_for_weight(SIZE, duration, &BigInt::zero(), &weight);
        assert_eq!(BigInt::from(SIZE as u64) * 10, power);
    }

    #[test]
    fn half_verified_sector_averages_multipliers() {
        let duration = 180 * EPOCHS_IN_DAY;
        let weight = BigInt::from(SIZE as u64) * duration / 2;
        let power = qa_power_for_weight(SIZE, duration, &BigInt::zero(), &weight);
        // (1 + 10) / 2
        assert_eq!(BigInt::from(SIZE as u64) * 11 / 2, power);
    }

    #[test]
    fn sector_power_sums_over_sectors() {
        let sector = SectorOnChainInfo {
            activation: 0,
            expiration: 100,
            ..Default::default()
        };
        let pair = power_for_sectors(SIZE, &[sector.clone(), sector.clone()]);
        let single = power_for_sector(SIZE, &sector);
        assert_eq!(&single.raw * 2, pair.raw);
        assert_eq!(&single.qa * 2, pair.qa);
    }

    #[test]
    fn deal_limit_scales_with_sector_size() {
        assert_eq!(256, sector_deals_max(SectorSize::_32GiB));
        assert_eq!(512, sector_deals_max(SectorSize::_64GiB));
        assert_eq!(256, sector_deals_max(SectorSize::_2KiB));
    }
}
