// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{
    actor_error, get_cbor, make_empty_map, make_map_with_root, put_cbor, u64_key, ActorDowncast,
    ActorError, Array, HAMT_BIT_WIDTH, MAX_SECTOR_NUMBER,
};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::Zero;

use super::{
    assign_deadlines, deadline_is_mutable, new_deadline_info, BitFieldQueue, Deadline,
    DeadlineInfo, DeadlineSectorMap, Deadlines, MinerInfo, PowerPair, QuantSpec,
    SectorOnChainInfo, SectorPreCommitOnChainInfo, Sectors, TerminationResult, VestSpec,
    VestingFunds, ERR_BALANCE_INVARIANTS_BROKEN, SECTORS_AMT_BITWIDTH,
};

pub const PRECOMMIT_EXPIRY_AMT_BITWIDTH: u32 = 6;

/// Sector accounting state of a storage miner.
///
/// The actor balance should cover `pre_commit_deposits + locked_funds`. When it doesn't also
/// cover `initial_pledge` the miner is in pledge debt and has nothing available to withdraw.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct State {
    /// Contains static info about this miner
    pub info: Cid,

    /// Total funds locked as pre_commit_deposit
    pub pre_commit_deposits: TokenAmount,

    /// Total rewards and added funds locked in vesting table
    pub locked_funds: TokenAmount,

    /// Schedule of locked funds still to vest.
    pub vesting_funds: Cid,

    /// Absolute value of debt this miner owes from unpaid fees.
    pub fee_debt: TokenAmount,

    /// Sum of initial pledge requirements of all active sectors.
    pub initial_pledge: TokenAmount,

    /// Sectors that have been pre-committed but not yet proven.
    pub pre_committed_sectors: Cid,

    /// Queue of pre-committed sector numbers by quantized expiry epoch.
    pub pre_committed_sectors_expiry: Cid,

    /// Allocated sector IDs. Sector IDs can never be reused once allocated.
    pub allocated_sectors: Cid, // BitField

    /// Information for all proven and not-yet-garbage-collected sectors.
    ///
    /// Sectors are removed from this AMT when the partition to which the
    /// sector belongs is compacted.
    pub sectors: Cid, // Array, AMT[SectorNumber]SectorOnChainInfo (sparse)

    /// First epoch of the current proving period, when deadline 0 opens. May be in the
    /// future for a new miner, in which case nothing is due until it arrives.
    /// Moves forward one period each time the last deadline closes.
    pub proving_period_start: ChainEpoch,

    /// Index of the next deadline to close within the current proving period.
    pub current_deadline: u64,

    /// Root of the `Deadlines` structure.
    pub deadlines: Cid,

    /// Deadlines with outstanding fees for early sector termination.
    pub early_terminations: BitField,
}

/// Changes to power and pledge produced by closing a deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceDeadlineResult {
    pub pledge_delta: TokenAmount,
    pub power_delta: PowerPair,
    /// Power that was faulty before this advance (including recovering)
    pub previously_faulty_power: PowerPair,
    /// Power of new faults and failed recoveries
    pub detected_faulty_power: PowerPair,
    /// Faulty power after detection, before expirations. Failed recoveries count in both
    /// fields above, so this isn't their sum.
    pub total_faulty_power: PowerPair,
}

impl State {
    pub fn new<BS: Blockstore>(
        policy: &Policy,
        store: &BS,
        info_cid: Cid,
        period_start: ChainEpoch,
        deadline_idx: u64,
    ) -> anyhow::Result<Self> {
        let empty_precommit_map =
            make_empty_map::<_, SectorPreCommitOnChainInfo>(store, HAMT_BIT_WIDTH)
                .flush()
                .map_err(|e| e.downcast_wrap("failed to construct empty precommit map"))?;
        let empty_precommits_expiry_array =
            Array::<BitField, BS>::new_with_bit_width(store, PRECOMMIT_EXPIRY_AMT_BITWIDTH)
                .flush()
                .map_err(|e| e.downcast_wrap("failed to construct empty precommits array"))?;
        let empty_sectors_array =
            Array::<SectorOnChainInfo, BS>::new_with_bit_width(store, SECTORS_AMT_BITWIDTH)
                .flush()
                .map_err(|e| e.downcast_wrap("failed to construct sectors array"))?;
        let empty_bitfield = put_cbor(store, &BitField::new(), "allocated sectors")?;
        let empty_deadline = put_cbor(store, &Deadline::new(store)?, "deadline")?;
        let empty_deadlines = put_cbor(
            store,
            &Deadlines::new(policy, empty_deadline),
            "deadlines",
        )?;
        let empty_vesting_funds = put_cbor(store, &VestingFunds::new(), "vesting funds")?;

        Ok(Self {
            info: info_cid,

            pre_commit_deposits: TokenAmount::default(),
            locked_funds: TokenAmount::default(),

            vesting_funds: empty_vesting_funds,

            initial_pledge: TokenAmount::default(),
            fee_debt: TokenAmount::default(),

            pre_committed_sectors: empty_precommit_map,
            pre_committed_sectors_expiry: empty_precommits_expiry_array,
            allocated_sectors: empty_bitfield,
            sectors: empty_sectors_array,
            proving_period_start: period_start,
            current_deadline: deadline_idx,
            deadlines: empty_deadlines,
            early_terminations: BitField::new(),
        })
    }

    pub fn get_info<BS: Blockstore>(&self, store: &BS) -> anyhow::Result<MinerInfo> {
        get_cbor(store, &self.info, "miner info")
    }

    pub fn save_info<BS: Blockstore>(&mut self, store: &BS, info: &MinerInfo) -> anyhow::Result<()> {
        self.info = put_cbor(store, info, "miner info")?;
        Ok(())
    }

    /// Returns deadline calculations for the current (according to state) proving period.
    pub fn deadline_info(&self, policy: &Policy, current_epoch: ChainEpoch) -> DeadlineInfo {
        new_deadline_info(
            policy,
            self.proving_period_start,
            self.current_deadline,
            current_epoch,
        )
    }

    /// Returns the quantization of expirations for the given deadline in the current proving period.
    pub fn quant_spec_for_deadline(&self, policy: &Policy, deadline_idx: u64) -> QuantSpec {
        new_deadline_info(policy, self.proving_period_start, deadline_idx, 0).quant_spec()
    }

    /// Quantization of pre-commit expirations: the end of every deadline.
    pub fn quant_spec_every_deadline(&self, policy: &Policy) -> QuantSpec {
        QuantSpec {
            unit: policy.wpost_challenge_window,
            offset: self.proving_period_start,
        }
    }

    fn load_allocated_sectors<BS: Blockstore>(&self, store: &BS) -> Result<BitField, ActorError> {
        get_cbor(store, &self.allocated_sectors, "allocated sectors bitfield").map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to load allocated sectors bitfield",
            )
        })
    }

    /// Marks a single sector number as allocated. Sector numbers can never be reused.
    pub fn allocate_sector_number<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> Result<(), ActorError> {
        // This will likely already have been checked, but this is a good place
        // to catch any mistakes.
        if sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument; "sector number out of range: {}", sector_number));
        }

        let mut allocated_sectors = self.load_allocated_sectors(store)?;
        if allocated_sectors.get(sector_number) {
            return Err(actor_error!(illegal_argument;
                "sector number {} has already been allocated", sector_number));
        }
        allocated_sectors.set(sector_number);

        self.allocated_sectors = put_cbor(store, &allocated_sectors, "allocated sectors bitfield")
            .map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_ARGUMENT,
                    format!(
                        "failed to store allocated sectors bitfield after adding sector {}",
                        sector_number
                    ),
                )
            })?;
        Ok(())
    }

    /// Marks every sector number in the mask as allocated, whether or not it was before.
    pub fn mask_sector_numbers<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
    ) -> Result<(), ActorError> {
        let last_sector_number = sector_numbers
            .last()
            .ok_or_else(|| actor_error!(illegal_argument; "invalid mask bitfield"))?;

        if last_sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument;
                "masked sector number {} exceeded max sector number", last_sector_number));
        }

        let allocated_sectors = self.load_allocated_sectors(store)?;
        let merged = &allocated_sectors | sector_numbers;

        self.allocated_sectors =
            put_cbor(store, &merged, "allocated sectors bitfield").map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_ARGUMENT,
                    "failed to mask allocated sectors bitfield",
                )
            })?;
        Ok(())
    }

    /// Stores a pre-commitment. Fails if the sector number is already pre-committed.
    pub fn put_precommitted_sector<BS: Blockstore>(
        &mut self,
        store: &BS,
        info: SectorPreCommitOnChainInfo,
    ) -> anyhow::Result<()> {
        let mut precommitted =
            make_map_with_root::<_, SectorPreCommitOnChainInfo>(&self.pre_committed_sectors, store)
                .map_err(|e| e.downcast_wrap("failed to load precommitted sectors"))?;

        let sector_number = info.info.sector_number;
        let modified = precommitted
            .set_if_absent(u64_key(sector_number), info)
            .map_err(|e| {
                e.downcast_wrap(format!("failed to store precommitment for {}", sector_number))
            })?;
        if !modified {
            return Err(
                actor_error!(illegal_argument; "sector {} already pre-committed", sector_number)
                    .into(),
            );
        }

        self.pre_committed_sectors = precommitted
            .flush()
            .map_err(|e| e.downcast_wrap("failed to flush precommitted sectors"))?;
        Ok(())
    }

    pub fn get_precommitted_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<Option<SectorPreCommitOnChainInfo>> {
        let precommitted =
            make_map_with_root::<_, SectorPreCommitOnChainInfo>(&self.pre_committed_sectors, store)
                .map_err(|e| e.downcast_wrap("failed to load precommitted sectors"))?;
        Ok(precommitted
            .get(&u64_key(sector_number))
            .map_err(|e| {
                e.downcast_wrap(format!("failed to load precommitment for {}", sector_number))
            })?
            .cloned())
    }

    /// Gets and returns the requested pre-committed sectors, skipping missing sectors.
    pub fn find_precommitted_sectors<BS: Blockstore>(
        &self,
        store: &BS,
        sector_numbers: &[SectorNumber],
    ) -> anyhow::Result<Vec<SectorPreCommitOnChainInfo>> {
        let precommitted =
            make_map_with_root::<_, SectorPreCommitOnChainInfo>(&self.pre_committed_sectors, store)
                .map_err(|e| e.downcast_wrap("failed to load precommitted sectors"))?;
        let mut result = Vec::with_capacity(sector_numbers.len());

        for &sector_number in sector_numbers {
            let info = match precommitted.get(&u64_key(sector_number)).map_err(|e| {
                e.downcast_wrap(format!("failed to load precommitment for {}", sector_number))
            })? {
                Some(info) => info.clone(),
                None => {
                    log::warn!(
                        "failed to get precommitted sector {}, dropping from prove commit set",
                        sector_number
                    );
                    continue;
                }
            };

            result.push(info);
        }

        Ok(result)
    }

    pub fn delete_precommitted_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &[SectorNumber],
    ) -> anyhow::Result<()> {
        let mut precommitted =
            make_map_with_root::<_, SectorPreCommitOnChainInfo>(&self.pre_committed_sectors, store)
                .map_err(|e| e.downcast_wrap("failed to load precommitted sectors"))?;

        for &sector_number in sector_numbers {
            let deleted = precommitted.delete(&u64_key(sector_number)).map_err(|e| {
                e.downcast_wrap(format!("failed to delete precommitment for {}", sector_number))
            })?;
            if deleted.is_none() {
                return Err(
                    actor_error!(not_found; "no precommitment for sector {} to delete", sector_number)
                        .into(),
                );
            }
        }

        self.pre_committed_sectors = precommitted
            .flush()
            .map_err(|e| e.downcast_wrap("failed to flush precommitted sectors"))?;
        Ok(())
    }

    pub fn has_sector_number<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<bool> {
        let sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;
        Ok(sectors.get(sector_number)?.is_some())
    }

    pub fn put_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        new_sectors: Vec<SectorOnChainInfo>,
    ) -> anyhow::Result<()> {
        let mut sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;

        sectors.store(new_sectors)?;

        self.sectors = sectors
            .amt
            .flush()
            .map_err(|e| e.downcast_wrap("failed to persist sectors"))?;

        Ok(())
    }

    pub fn get_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<Option<SectorOnChainInfo>> {
        let sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;
        sectors.get(sector_number)
    }

    pub fn delete_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
    ) -> anyhow::Result<()> {
        let mut sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;

        for sector_number in sector_numbers.iter() {
            let deleted = sectors.amt.delete(sector_number).map_err(|e| {
                e.downcast_wrap(format!("failed to delete sector {}", sector_number))
            })?;
            if deleted.is_none() {
                return Err(actor_error!(illegal_state;
                    "sector {} doesn't exist, failed to delete", sector_number)
                .into());
            }
        }

        self.sectors = sectors
            .amt
            .flush()
            .map_err(|e| e.downcast_wrap("failed to persist sectors"))?;
        Ok(())
    }

    /// Visits every sector in ascending sector number order.
    pub fn for_each_sector<BS: Blockstore, F>(&self, store: &BS, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&SectorOnChainInfo) -> anyhow::Result<()>,
    {
        let sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;
        sectors
            .amt
            .for_each(|_, sector| f(sector))
            .map_err(|e| e.downcast_wrap("failed to iterate sectors"))
    }

    /// Returns the deadline and partition index for a sector number.
    pub fn find_sector<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        sector_number: SectorNumber,
    ) -> anyhow::Result<(u64, u64)> {
        let deadlines = self.load_deadlines(store)?;
        deadlines.find_sector(policy, store, sector_number)
    }

    /// Schedules each sector to expire at its next deadline end. If it can't find
    /// any given sector, it skips it.
    ///
    /// This method assumes that each sector's power has not changed, despite the rescheduling.
    ///
    /// Note: this method is used to "upgrade" sectors, rescheduling the now-replaced
    /// sectors to expire at the end of the next deadline. Given the expense of
    /// sealing a sector, this function skips missing/faulty/terminated "upgraded"
    /// sectors instead of failing. That way, the new sectors can still be proved.
    pub fn reschedule_sector_expirations<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
        sector_size: SectorSize,
        deadline_sectors: &DeadlineSectorMap,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        let mut deadlines = self.load_deadlines(store)?;
        let sectors = Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?;

        let mut all_replaced = Vec::new();
        for (deadline_idx, partition_sectors) in deadline_sectors.iter() {
            let deadline_info = new_deadline_info(
                policy,
                self.proving_period_start,
                deadline_idx,
                current_epoch,
            )
            .next_not_elapsed();
            let new_expiration = deadline_info.last();
            let mut deadline = deadlines.load_deadline(policy, store, deadline_idx)?;

            let replaced = deadline.reschedule_sector_expirations(
                store,
                &sectors,
                new_expiration,
                partition_sectors,
                sector_size,
                deadline_info.quant_spec(),
            )?;
            all_replaced.extend(replaced);

            deadlines.update_deadline(policy, store, deadline_idx, &deadline)?;
        }

        self.save_deadlines(store, deadlines)?;

        Ok(all_replaced)
    }

    /// Assign new sectors to deadlines. Returns the power activated by the assignment,
    /// which is zero because new sectors stay unproven until their first PoSt.
    pub fn assign_sectors_to_deadlines<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
        mut sectors: Vec<SectorOnChainInfo>,
        partition_size: u64,
        sector_size: SectorSize,
    ) -> anyhow::Result<PowerPair> {
        let mut deadlines = self.load_deadlines(store)?;

        // Sort sectors by number to get better runs in partition bitfields.
        sectors.sort_by_key(|info| info.sector_number);

        let mut deadline_vec: Vec<Option<Deadline>> =
            (0..policy.wpost_period_deadlines).map(|_| None).collect();

        deadlines.for_each(policy, store, |deadline_idx, deadline| {
            // Skip deadlines that aren't currently mutable.
            if deadline_is_mutable(policy, self.proving_period_start, deadline_idx, current_epoch) {
                deadline_vec[deadline_idx as usize] = Some(deadline);
            }

            Ok(())
        })?;

        let deadline_to_sectors = assign_deadlines(
            policy,
            policy.max_partitions_per_deadline,
            partition_size,
            &deadline_vec,
            sectors,
        )
        .map_err(|e| e.downcast_wrap("failed to assign sectors to deadlines"))?;

        let mut activated_power = PowerPair::zero();
        for (deadline_idx, deadline_sectors) in deadline_to_sectors.into_iter().enumerate() {
            if deadline_sectors.is_empty() {
                continue;
            }

            let quant = self.quant_spec_for_deadline(policy, deadline_idx as u64);
            let deadline = deadline_vec[deadline_idx]
                .as_mut()
                .ok_or_else(|| anyhow!("sectors assigned to immutable deadline {}", deadline_idx))?;

            let deadline_activated_power = deadline.add_sectors(
                store,
                partition_size,
                false,
                &deadline_sectors,
                sector_size,
                quant,
            )?;
            activated_power += &deadline_activated_power;

            deadlines.update_deadline(policy, store, deadline_idx as u64, deadline)?;
        }

        self.save_deadlines(store, deadlines)?;

        Ok(activated_power)
    }

    /// Pops up to `max_sectors` early terminated sectors from all deadlines.
    ///
    /// Returns `true` if we still have more early terminations to process.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        max_partitions: u64,
        max_sectors: u64,
    ) -> anyhow::Result<(TerminationResult, /* has more */ bool)> {
        // Anything to do? This lets us avoid loading the deadlines if there's nothing to do.
        if self.early_terminations.is_empty() {
            return Ok((Default::default(), false));
        }

        // Load deadlines
        let mut deadlines = self.load_deadlines(store)?;

        let mut result = TerminationResult::new();
        let mut to_unset = Vec::new();

        // Process early terminations.
        for deadline_idx in self.early_terminations.iter() {
            // Load deadline + partitions.
            let mut deadline = deadlines.load_deadline(policy, store, deadline_idx)?;

            let (deadline_result, more) = deadline
                .pop_early_terminations(
                    store,
                    max_partitions - result.partitions_processed,
                    max_sectors - result.sectors_processed,
                )
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to pop early terminations for deadline {}",
                        deadline_idx
                    ))
                })?;

            result += deadline_result;

            if !more {
                to_unset.push(deadline_idx);
            }

            // Save the deadline
            deadlines.update_deadline(policy, store, deadline_idx, &deadline)?;

            if !result.below_limit(max_partitions, max_sectors) {
                break;
            }
        }

        for deadline_idx in to_unset {
            self.early_terminations.unset(deadline_idx);
        }

        // Save back the deadlines.
        self.save_deadlines(store, deadlines)?;

        // Ok, check to see if we've handled all early terminations.
        let no_early_terminations = self.early_terminations.is_empty();

        Ok((result, !no_early_terminations))
    }

    /// Returns an error if the target sector cannot be found, or some other bad state is reached.
    pub fn check_sector_health<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        deadline_idx: u64,
        partition_idx: u64,
        sector_number: SectorNumber,
    ) -> anyhow::Result<()> {
        let deadlines = self.load_deadlines(store)?;
        let deadline = deadlines.load_deadline(policy, store, deadline_idx)?;
        let partition = deadline.load_partition(store, partition_idx)?;

        if !partition.sectors.get(sector_number) {
            return Err(actor_error!(
                not_found;
                "sector {} not a member of partition {}, deadline {}",
                sector_number, partition_idx, deadline_idx
            )
            .into());
        }

        if partition.faults.get(sector_number) {
            return Err(actor_error!(
                forbidden;
                "sector {} of partition {}, deadline {} is faulty",
                sector_number, partition_idx, deadline_idx
            )
            .into());
        }

        if partition.terminated.get(sector_number) {
            return Err(actor_error!(
                not_found;
                "sector {} of partition {}, deadline {} is terminated",
                sector_number, partition_idx, deadline_idx
            )
            .into());
        }

        Ok(())
    }

    /// Loads sector info for a sequence of sectors.
    pub fn load_sector_infos<BS: Blockstore>(
        &self,
        store: &BS,
        sectors: &BitField,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        Ok(Sectors::load(store, &self.sectors)
            .map_err(|e| e.downcast_wrap("failed to load sectors"))?
            .load_sector(sectors)?)
    }

    pub fn load_deadlines<BS: Blockstore>(&self, store: &BS) -> Result<Deadlines, ActorError> {
        get_cbor(store, &self.deadlines, "deadlines").map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load deadlines")
        })
    }

    pub fn save_deadlines<BS: Blockstore>(
        &mut self,
        store: &BS,
        deadlines: Deadlines,
    ) -> anyhow::Result<()> {
        self.deadlines = put_cbor(store, &deadlines, "deadlines")?;
        Ok(())
    }

    /// Loads the vesting funds table from the store.
    pub fn load_vesting_funds<BS: Blockstore>(&self, store: &BS) -> anyhow::Result<VestingFunds> {
        get_cbor(store, &self.vesting_funds, "vesting funds")
    }

    /// Saves the vesting table to the store.
    pub fn save_vesting_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        funds: &VestingFunds,
    ) -> anyhow::Result<()> {
        self.vesting_funds = put_cbor(store, funds, "vesting funds")?;
        Ok(())
    }

    //
    // Funds and vesting
    //

    pub fn add_pre_commit_deposit(&mut self, amount: &TokenAmount) -> anyhow::Result<()> {
        let new_total = &self.pre_commit_deposits + amount;
        if new_total.is_negative() {
            return Err(anyhow!(
                "negative pre-commit deposit {} after adding {} to prior {}",
                new_total,
                amount,
                self.pre_commit_deposits
            ));
        }
        self.pre_commit_deposits = new_total;
        Ok(())
    }

    pub fn add_initial_pledge(&mut self, amount: &TokenAmount) -> anyhow::Result<()> {
        let new_total = &self.initial_pledge + amount;
        if new_total.is_negative() {
            return Err(anyhow!(
                "negative initial pledge requirement {} after adding {} to prior {}",
                new_total,
                amount,
                self.initial_pledge
            ));
        }
        self.initial_pledge = new_total;
        Ok(())
    }

    /// First vests and unlocks the vested funds AND then locks the given funds in the vesting table.
    /// Returns the amount that vested.
    pub fn add_locked_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        spec: &VestSpec,
    ) -> anyhow::Result<TokenAmount> {
        if vesting_sum.is_negative() {
            return Err(anyhow!("negative vesting sum {}", vesting_sum));
        }

        let mut vesting_funds = self.load_vesting_funds(store)?;

        // unlock vested funds first
        let amount_unlocked = vesting_funds.unlock_vested_funds(current_epoch);
        self.locked_funds -= &amount_unlocked;
        if self.locked_funds.is_negative() {
            return Err(anyhow!(
                "negative locked funds {} after unlocking {}",
                self.locked_funds,
                amount_unlocked
            ));
        }

        // add locked funds now
        vesting_funds.add_locked_funds(current_epoch, vesting_sum, self.proving_period_start, spec);
        self.locked_funds += vesting_sum;

        // save the updated vesting table state
        self.save_vesting_funds(store, &vesting_funds)?;

        Ok(amount_unlocked)
    }

    /// Adds the provided penalty to fee debt.
    pub fn apply_penalty(&mut self, penalty: &TokenAmount) -> anyhow::Result<()> {
        if penalty.is_negative() {
            Err(anyhow!("applying negative penalty {} not allowed", penalty))
        } else {
            self.fee_debt += penalty;
            Ok(())
        }
    }

    /// Draws from vesting table and unlocked funds to repay up to the fee debt.
    /// Returns the amount unlocked from the vesting table and the amount taken from
    /// current balance. If the fee debt exceeds the total amount available for repayment
    /// the fee debt field is updated to track the remaining debt. Otherwise it is set to zero.
    pub fn repay_partial_debt_in_priority_order<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        curr_balance: &TokenAmount,
    ) -> anyhow::Result<(
        TokenAmount, // from vesting
        TokenAmount, // from balance
    )> {
        let unlocked_balance = self.get_unlocked_balance(curr_balance)?;

        let fee_debt = self.fee_debt.clone();
        let from_vesting = self.unlock_unvested_funds(store, current_epoch, &fee_debt)?;

        if from_vesting > self.fee_debt {
            return Err(anyhow!(
                "should never unlock more than the debt we need to repay"
            ));
        }
        self.fee_debt -= &from_vesting;

        let from_balance = cmp::min(&unlocked_balance, &self.fee_debt).clone();
        self.fee_debt -= &from_balance;

        Ok((from_vesting, from_balance))
    }

    /// Repays the full miner actor fee debt. Returns the amount that must be
    /// burnt and an error if there are not sufficient funds to cover repayment.
    /// On success `fee_debt` is zero.
    pub fn repay_debts(&mut self, curr_balance: &TokenAmount) -> anyhow::Result<TokenAmount> {
        let unlocked_balance = self.get_unlocked_balance(curr_balance)?;
        if unlocked_balance < self.fee_debt {
            return Err(actor_error!(
                insufficient_funds;
                "unlocked balance can not repay fee debt ({} < {})",
                unlocked_balance, self.fee_debt
            )
            .into());
        }

        Ok(std::mem::take(&mut self.fee_debt))
    }

    /// Unlocks an amount of funds that have *not yet vested*, if possible.
    /// The soonest-vesting entries are unlocked first.
    /// Returns the amount actually unlocked.
    pub fn unlock_unvested_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        // Nothing to unlock, don't bother loading any state.
        if target.is_zero() || self.locked_funds.is_zero() {
            return Ok(TokenAmount::zero());
        }

        let mut vesting_funds = self.load_vesting_funds(store)?;
        let amount_unlocked = vesting_funds.unlock_unvested_funds(current_epoch, target);
        self.locked_funds -= &amount_unlocked;
        if self.locked_funds.is_negative() {
            return Err(anyhow!(
                "negative locked funds {} after unlocking {}",
                self.locked_funds,
                amount_unlocked
            ));
        }

        self.save_vesting_funds(store, &vesting_funds)?;
        Ok(amount_unlocked)
    }

    /// Unlocks all vesting funds that have vested before the provided epoch.
    /// Returns the amount unlocked.
    pub fn unlock_vested_funds<BS: Blockstore>(
        &mut self,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        // Short-circuit to avoid loading vesting funds if we don't have any.
        if self.locked_funds.is_zero() {
            return Ok(TokenAmount::zero());
        }

        let mut vesting_funds = self.load_vesting_funds(store)?;
        let amount_unlocked = vesting_funds.unlock_vested_funds(current_epoch);
        self.locked_funds -= &amount_unlocked;
        if self.locked_funds.is_negative() {
            return Err(anyhow!(
                "vesting cause locked funds to become negative: {}",
                self.locked_funds,
            ));
        }

        self.save_vesting_funds(store, &vesting_funds)?;
        Ok(amount_unlocked)
    }

    /// Returns the amount of funds that have vested before the provided epoch, without unlocking them.
    pub fn check_vested_funds<BS: Blockstore>(
        &self,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        let vesting_funds = self.load_vesting_funds(store)?;
        Ok(vesting_funds
            .funds
            .iter()
            .take_while(|fund| fund.epoch < current_epoch)
            .fold(TokenAmount::zero(), |acc, fund| acc + &fund.amount))
    }

    /// Unclaimed funds that are not locked -- includes free funds and does not
    /// account for fee debt. Always greater than or equal to zero
    pub fn get_unlocked_balance(&self, actor_balance: &TokenAmount) -> anyhow::Result<TokenAmount> {
        let unlocked_balance =
            actor_balance - &self.locked_funds - &self.pre_commit_deposits - &self.initial_pledge;
        if unlocked_balance.is_negative() {
            return Err(anyhow!("negative unlocked balance {}", unlocked_balance));
        }
        Ok(unlocked_balance)
    }

    /// Unclaimed funds. Actor balance - (locked funds, precommit deposit, initial pledge, fee debt)
    /// Can go negative if the miner is in IP debt.
    pub fn get_available_balance(
        &self,
        actor_balance: &TokenAmount,
    ) -> anyhow::Result<TokenAmount> {
        // (actor_balance - &self.locked_funds) - &self.pre_commit_deposit - &self.initial_pledge
        Ok(self.get_unlocked_balance(actor_balance)? - &self.fee_debt)
    }

    /// Checks that no tracked amount is negative and that the balance covers everything locked.
    pub fn check_balance_invariants(&self, balance: &TokenAmount) -> Result<(), ActorError> {
        let broken = |msg: String| -> Result<(), ActorError> {
            Err(ActorError::unchecked(ERR_BALANCE_INVARIANTS_BROKEN, msg))
        };

        if self.pre_commit_deposits.is_negative() {
            return broken(format!(
                "pre-commit deposit is negative: {}",
                self.pre_commit_deposits
            ));
        }
        if self.locked_funds.is_negative() {
            return broken(format!("locked funds is negative: {}", self.locked_funds));
        }
        if self.initial_pledge.is_negative() {
            return broken(format!("initial pledge is negative: {}", self.initial_pledge));
        }
        if self.fee_debt.is_negative() {
            return broken(format!("fee debt is negative: {}", self.fee_debt));
        }

        let min_balance = &self.pre_commit_deposits + &self.locked_funds + &self.initial_pledge;
        if balance < &min_balance {
            return broken(format!("balance {} below required {}", balance, min_balance));
        }

        Ok(())
    }

    pub fn is_debt_free(&self) -> bool {
        !self.fee_debt.is_positive()
    }

    /// Schedules a pre-committed sector for expiry at the first deadline end at or after `expire_epoch`.
    pub fn add_pre_commit_expiry<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        expire_epoch: ChainEpoch,
        sector_number: SectorNumber,
    ) -> anyhow::Result<()> {
        // Load BitField Queue for sector expiry
        let quant = self.quant_spec_every_deadline(policy);
        let mut queue = BitFieldQueue::new(store, &self.pre_committed_sectors_expiry, quant)
            .map_err(|e| e.downcast_wrap("failed to load pre-commit expiry queue"))?;

        // add entry for this sector to the queue
        queue
            .add_to_queue_values(expire_epoch, [sector_number])
            .map_err(|e| e.downcast_wrap("failed to add pre-commit sector expiry to queue"))?;
        self.pre_committed_sectors_expiry = queue.root()?;

        Ok(())
    }

    /// Removes pre-commitments whose expiry has passed and releases their deposits.
    /// Returns the deposit to burn. Sectors already proven or removed are skipped.
    pub fn expire_pre_commits<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<TokenAmount> {
        let mut deposit_to_burn = TokenAmount::zero();

        // expire pre-committed sectors
        let quant = self.quant_spec_every_deadline(policy);
        let mut expiry_queue =
            BitFieldQueue::new(store, &self.pre_committed_sectors_expiry, quant)
                .map_err(|e| e.downcast_wrap("failed to load sector expiry queue"))?;

        let (sectors, modified) = expiry_queue.pop_until(current_epoch)?;

        if modified {
            self.pre_committed_sectors_expiry = expiry_queue.root()?;
        }

        let mut precommits_to_delete = Vec::new();

        for sector_number in sectors.iter() {
            let sector = match self.get_precommitted_sector(store, sector_number)? {
                Some(sector) => sector,
                // already committed/deleted
                None => continue,
            };

            // mark it for deletion
            precommits_to_delete.push(sector_number);

            // increment deposit to burn
            deposit_to_burn += sector.pre_commit_deposit;
        }

        // Actually delete it.
        if !precommits_to_delete.is_empty() {
            self.delete_precommitted_sectors(store, &precommits_to_delete)?;
            log::debug!(
                "expired {} pre-commitments at epoch {}",
                precommits_to_delete.len(),
                current_epoch
            );
        }

        self.pre_commit_deposits -= &deposit_to_burn;
        if self.pre_commit_deposits.is_negative() {
            return Err(anyhow!(
                "pre-commit expiry caused negative deposits: {}",
                self.pre_commit_deposits
            ));
        }

        // This deposit was locked separately to pledge collateral so there's no pledge change here.
        Ok(deposit_to_burn)
    }

    /// Closes the current deadline: vests funds, advances the deadline pointer,
    /// processes missed proofs and pops expired sectors. Returns the resulting
    /// changes to power and pledge along with the faulty power before and after.
    pub fn advance_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> anyhow::Result<AdvanceDeadlineResult> {
        let mut pledge_delta = TokenAmount::zero();

        // Vest locked funds first so any subsequent penalties are taken from what remains locked.
        let newly_vested = self
            .unlock_vested_funds(store, current_epoch)
            .map_err(|e| e.downcast_wrap("failed to vest funds"))?;
        pledge_delta -= newly_vested;

        let deadline_info = self.deadline_info(policy, current_epoch);

        // Return early if the proving period hasn't started. No proofs have been
        // submitted yet, so there is nothing to check.
        if !deadline_info.period_started() {
            return Ok(AdvanceDeadlineResult {
                pledge_delta,
                ..Default::default()
            });
        }

        // Advance to the next deadline (in case we short-circuit below).
        self.current_deadline = (deadline_info.index + 1) % policy.wpost_period_deadlines;
        if self.current_deadline == 0 {
            self.proving_period_start = deadline_info.period_start + policy.wpost_proving_period;
        }
        log::debug!(
            "closing deadline {} of period starting at {}, next deadline {}",
            deadline_info.index,
            deadline_info.period_start,
            self.current_deadline
        );

        let mut deadlines = self.load_deadlines(store)?;
        let mut deadline = deadlines.load_deadline(policy, store, deadline_info.index)?;

        let previously_faulty_power = deadline.faulty_power.clone();

        // No live sectors in this deadline, nothing to do.
        if deadline.live_sectors == 0 {
            return Ok(AdvanceDeadlineResult {
                pledge_delta,
                power_delta: PowerPair::zero(),
                previously_faulty_power,
                detected_faulty_power: PowerPair::zero(),
                total_faulty_power: deadline.faulty_power,
            });
        }

        let quant = deadline_info.quant_spec();

        // Detect and penalize missing proofs.
        let fault_expiration = deadline_info.last() + policy.fault_max_age;

        // detected_faulty_power is new faults and failed recoveries
        let (mut power_delta, detected_faulty_power) = deadline
            .process_deadline_end(store, quant, fault_expiration)
            .map_err(|e| {
                e.downcast_wrap(format!(
                    "failed to process end of deadline {}",
                    deadline_info.index
                ))
            })?;

        // Capture deadline's faulty power after new faults have been detected, but before it is
        // dropped along with faulty sectors expiring this round.
        let total_faulty_power = deadline.faulty_power.clone();

        // Expire sectors that are due, either for on-time expiration or "early" faulty-for-too-long.
        let expired = deadline
            .pop_expired_sectors(store, deadline_info.last(), quant)
            .map_err(|e| e.downcast_wrap("failed to load expired sectors"))?;

        // Release pledge requirements for the sectors expiring on-time.
        // Pledge for the sectors expiring early is retained to support the termination fee that
        // will be assessed when the early termination is processed.
        pledge_delta -= &expired.on_time_pledge;
        self.add_initial_pledge(&(-expired.on_time_pledge.clone()))?;

        // Record reduction in power of the amount of expiring active power.
        // Faulty power has already been lost, so the amount expiring can be excluded from the delta.
        power_delta -= &expired.active_power;

        // Record deadlines with early terminations. While this
        // bitfield is non-empty, the miner is locked until they
        // pay the fee.
        if !expired.early_sectors.is_empty() {
            self.early_terminations.set(deadline_info.index);
        }

        // Save new deadline state.
        deadlines.update_deadline(policy, store, deadline_info.index, &deadline)?;
        self.save_deadlines(store, deadlines)?;

        Ok(AdvanceDeadlineResult {
            pledge_delta,
            power_delta,
            previously_faulty_power,
            detected_faulty_power,
            total_faulty_power,
        })
    }
}
