// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{
    actor_error, get_cbor, make_empty_array_root, put_cbor, ActorDowncast, ActorError, Array,
};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::SectorSize;
use num_traits::{Signed, Zero};

use super::{
    BitFieldQueue, ExpirationSet, Partition, PartitionSectorMap, PoStPartition, PowerPair,
    QuantSpec, SectorOnChainInfo, Sectors, TerminationResult, PARTITION_EXPIRATION_AMT_BITWIDTH,
};

pub const DEADLINE_PARTITIONS_AMT_BITWIDTH: u32 = 3;
pub const DEADLINE_EXPIRATIONS_AMT_BITWIDTH: u32 = 5;

/// One deadline root per window of the proving period.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Deadlines {
    pub due: Vec<Cid>,
}

impl Deadlines {
    pub fn new(policy: &Policy, empty_deadline_cid: Cid) -> Self {
        Self {
            due: vec![empty_deadline_cid; policy.wpost_period_deadlines as usize],
        }
    }

    pub fn load_deadline<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        deadline_idx: u64,
    ) -> Result<Deadline, ActorError> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(actor_error!(illegal_argument; "invalid deadline {}", deadline_idx));
        }

        get_cbor(store, &self.due[deadline_idx as usize], "deadline").map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to lookup deadline {}", deadline_idx),
            )
        })
    }

    /// Loads and visits every deadline in index order.
    pub fn for_each<BS: Blockstore>(
        &self,
        policy: &Policy,
        store: &BS,
        mut f: impl FnMut(u64, Deadline) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        (0..self.due.len() as u64)
            .try_for_each(|idx| f(idx, self.load_deadline(policy, store, idx)?))
    }

    /// Validates the deadline and stores it in place of the current root at the index.
    pub fn update_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        deadline_idx: u64,
        deadline: &Deadline,
    ) -> anyhow::Result<()> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(anyhow!("invalid deadline {}", deadline_idx));
        }
        deadline.validate_state()?;

        self.due[deadline_idx as usize] = put_cbor(store, deadline, "deadline")?;
        Ok(())
    }
}

/// State of all sectors due at one deadline of the proving period.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Deadline {
    /// AMT of partitions, keyed by sequential index from zero.
    pub partitions: Cid,

    /// Queue from quantized epoch to the partitions that may have sectors expiring
    /// by then, on time or early. Entries are only dropped once their epoch is popped,
    /// so a partition may be listed at an epoch where nothing of it expires any more.
    pub expirations_epochs: Cid,

    /// Partitions proven since the deadline last closed.
    pub partitions_posted: BitField,

    /// Partitions holding early terminations that haven't been processed.
    pub early_terminations: BitField,

    /// Sectors not yet terminated, faulty ones included.
    pub live_sectors: u64,

    /// Every sector assigned here, terminated ones included.
    pub total_sectors: u64,

    /// Sum of the partitions' faulty power.
    pub faulty_power: PowerPair,
}

/// Outcome of recording a Window PoSt against a deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoStResult {
    /// Net power change, positive for activations and recoveries.
    pub power_delta: PowerPair,
    pub new_faulty_power: PowerPair,
    pub retracted_recovery_power: PowerPair,
    pub recovered_power: PowerPair,
    /// Every sector of the proven partitions.
    pub sectors: BitField,
    /// The part of `sectors` excluded from the proof: faulty or terminated.
    pub ignored_sectors: BitField,
}

impl PoStResult {
    /// Power the miner is penalized for: newly skipped faults plus retracted recoveries.
    pub fn penalty_power(&self) -> PowerPair {
        &self.new_faulty_power + &self.retracted_recovery_power
    }
}

fn get_partition<BS: Blockstore>(
    partitions: &Array<'_, Partition, BS>,
    partition_idx: u64,
) -> anyhow::Result<Option<Partition>> {
    Ok(partitions
        .get(partition_idx)
        .map_err(|e| e.downcast_wrap(format!("failed to load partition {}", partition_idx)))?
        .cloned())
}

fn must_get_partition<BS: Blockstore>(
    partitions: &Array<'_, Partition, BS>,
    partition_idx: u64,
    missing: impl FnOnce() -> ActorError,
) -> anyhow::Result<Partition> {
    get_partition(partitions, partition_idx)?.ok_or_else(|| missing().into())
}

fn set_partition<BS: Blockstore>(
    partitions: &mut Array<'_, Partition, BS>,
    partition_idx: u64,
    partition: Partition,
) -> anyhow::Result<()> {
    partitions
        .set(partition_idx, partition)
        .map_err(|e| e.downcast_wrap(format!("failed to store partition {}", partition_idx)))
}

impl Deadline {
    pub fn new<BS: Blockstore>(store: &BS) -> anyhow::Result<Self> {
        let partitions =
            make_empty_array_root::<_, Partition>(store, DEADLINE_PARTITIONS_AMT_BITWIDTH)
                .map_err(|e| e.downcast_wrap("failed to create empty partitions array"))?;
        let expirations_epochs =
            make_empty_array_root::<_, BitField>(store, DEADLINE_EXPIRATIONS_AMT_BITWIDTH)
                .map_err(|e| e.downcast_wrap("failed to create empty expirations array"))?;

        Ok(Self {
            partitions,
            expirations_epochs,
            partitions_posted: BitField::new(),
            early_terminations: BitField::new(),
            live_sectors: 0,
            total_sectors: 0,
            faulty_power: PowerPair::zero(),
        })
    }

    pub fn partitions_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> anyhow::Result<Array<'db, Partition, BS>> {
        Array::load(&self.partitions, store).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load partitions")
                .into()
        })
    }

    pub fn load_partition<BS: Blockstore>(
        &self,
        store: &BS,
        partition_idx: u64,
    ) -> anyhow::Result<Partition> {
        let partitions = self.partitions_amt(store)?;
        must_get_partition(&partitions, partition_idx, || {
            actor_error!(not_found; "no partition {}", partition_idx)
        })
    }

    fn save_partitions<BS: Blockstore>(
        &mut self,
        partitions: &mut Array<'_, Partition, BS>,
    ) -> anyhow::Result<()> {
        self.partitions = partitions
            .flush()
            .map_err(|e| e.downcast_wrap("failed to store partitions"))?;
        Ok(())
    }

    fn expiration_queue<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
        quant: QuantSpec,
    ) -> anyhow::Result<BitFieldQueue<'db, BS>> {
        BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .map_err(|e| e.downcast_wrap("failed to load deadline expiration queue"))
    }

    /// Lists the partitions in the expiration queue at the quantized epoch.
    pub fn add_expiration_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        expiration_epoch: ChainEpoch,
        partitions: &[u64],
        quant: QuantSpec,
    ) -> anyhow::Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }

        let mut queue = self.expiration_queue(store, quant)?;
        queue
            .add_to_queue_values(expiration_epoch, partitions.iter().copied())
            .map_err(|e| e.downcast_wrap("failed to mutate expiration queue"))?;
        self.expirations_epochs = queue.root()?;
        Ok(())
    }

    /// Pops the partitions queued at or before `until`, reporting whether the queue changed.
    pub fn pop_expired_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<(BitField, bool)> {
        let mut queue = self.expiration_queue(store, quant)?;
        let (popped, modified) = queue
            .pop_until(until)
            .map_err(|e| e.downcast_wrap("failed to pop expiring partitions"))?;

        if modified {
            self.expirations_epochs = queue.root()?;
        }
        Ok((popped, modified))
    }

    /// Terminates every sector due to expire by `until` in the partitions queued for it,
    /// and returns the aggregate of what expired.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> anyhow::Result<ExpirationSet> {
        let (expired_partitions, modified) = self.pop_expired_partitions(store, until, quant)?;
        if !modified {
            return Ok(ExpirationSet::empty());
        }

        let mut partitions = self.partitions_amt(store)?;
        let mut expired = ExpirationSet::empty();

        for partition_idx in expired_partitions.iter() {
            let mut partition = must_get_partition(&partitions, partition_idx, || {
                actor_error!(illegal_state; "missing expected partition {}", partition_idx)
            })?;

            let popped = partition
                .pop_expired_sectors(store, until, quant)
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to pop expired sectors from partition {}",
                        partition_idx
                    ))
                })?;

            if !popped.early_sectors.is_empty() {
                self.early_terminations.set(partition_idx);
            }
            expired.add(
                &popped.on_time_sectors,
                &popped.early_sectors,
                &popped.on_time_pledge,
                &popped.active_power,
                &popped.faulty_power,
            )?;

            set_partition(&mut partitions, partition_idx, partition)?;
        }

        self.save_partitions(&mut partitions)?;

        self.live_sectors -= expired.len();
        self.faulty_power -= &expired.faulty_power;

        Ok(expired)
    }

    /// Appends sectors to the deadline, topping up the last partition before opening new
    /// ones. The deadline must not be open for proving and the sectors must be non-faulty.
    /// Returns the power activated, which is zero unless `proven`.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        partition_size: u64,
        proven: bool,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        let mut activated = PowerPair::zero();
        if sectors.is_empty() {
            return Ok(activated);
        }
        if partition_size == 0 {
            return Err(actor_error!(illegal_argument; "partition size must be positive").into());
        }

        let mut partitions = self.partitions_amt(store)?;
        let mut queued_expirations = Vec::<(ChainEpoch, u64)>::with_capacity(sectors.len());

        let mut remaining = sectors;
        let mut partition_idx = partitions.count().saturating_sub(1);
        while !remaining.is_empty() {
            let mut partition = match get_partition(&partitions, partition_idx)? {
                Some(partition) => partition,
                None => Partition::new(make_empty_array_root::<_, ExpirationSet>(
                    store,
                    PARTITION_EXPIRATION_AMT_BITWIDTH,
                )?),
            };

            let free = partition_size.saturating_sub(partition.sectors.len());
            if free > 0 {
                let take = free.min(remaining.len() as u64) as usize;
                let (batch, rest) = remaining.split_at(take);
                remaining = rest;

                activated +=
                    &partition.add_sectors(store, proven, batch, sector_size, quant)?;
                set_partition(&mut partitions, partition_idx, partition)?;

                queued_expirations
                    .extend(batch.iter().map(|sector| (sector.expiration, partition_idx)));
            }
            partition_idx += 1;
        }

        self.save_partitions(&mut partitions)?;
        self.live_sectors += sectors.len() as u64;
        self.total_sectors += sectors.len() as u64;

        let mut queue = self.expiration_queue(store, quant)?;
        queue
            .add_many_to_queue_values(queued_expirations)
            .map_err(|e| e.downcast_wrap("failed to add expirations for new sectors"))?;
        self.expirations_epochs = queue.root()?;

        Ok(activated)
    }

    /// Drains early terminations from the flagged partitions until either limit is met.
    /// A partition's flag is cleared once it has nothing left to pop. The flag reports
    /// whether any partition still has early terminations.
    pub fn pop_early_terminations<BS: Blockstore>(
        &mut self,
        store: &BS,
        max_partitions: u64,
        max_sectors: u64,
    ) -> anyhow::Result<(TerminationResult, bool)> {
        let mut partitions = self.partitions_amt(store)?;
        let mut result = TerminationResult::new();
        let mut drained = Vec::<u64>::new();

        for partition_idx in self.early_terminations.iter() {
            let Some(mut partition) = get_partition(&partitions, partition_idx)? else {
                log::warn!(
                    "dropping early termination flag for missing partition {}",
                    partition_idx
                );
                drained.push(partition_idx);
                continue;
            };

            let (popped, more) = partition
                .pop_early_terminations(store, max_sectors - result.sectors_processed)
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to pop terminations from partition {}",
                        partition_idx
                    ))
                })?;
            result += popped;
            if !more {
                drained.push(partition_idx);
            }
            set_partition(&mut partitions, partition_idx, partition)?;

            if !result.below_limit(max_partitions, max_sectors) {
                break;
            }
        }

        for partition_idx in drained {
            self.early_terminations.unset(partition_idx);
        }
        self.save_partitions(&mut partitions)?;

        let has_more = !self.early_terminations.is_empty();
        Ok((result, has_more))
    }

    /// Terminates the mapped sectors at `epoch`, flagging each affected partition for
    /// early-termination processing. Returns the active power removed.
    #[allow(clippy::too_many_arguments)]
    pub fn terminate_sectors<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        epoch: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<PowerPair> {
        let mut partitions = self.partitions_amt(store)?;
        let mut power_lost = PowerPair::zero();

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = must_get_partition(&partitions, partition_idx, || {
                actor_error!(not_found; "failed to find partition {}", partition_idx)
            })?;

            let removed = partition
                .terminate_sectors(
                    policy,
                    store,
                    sectors,
                    epoch,
                    sector_numbers,
                    sector_size,
                    quant,
                )
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to terminate sectors in partition {}",
                        partition_idx
                    ))
                })?;
            set_partition(&mut partitions, partition_idx, partition)?;

            if !removed.is_empty() {
                self.early_terminations.set(partition_idx);
                self.live_sectors -= removed.len();
            }
            self.faulty_power -= &removed.faulty_power;
            power_lost += &removed.active_power;
        }

        self.save_partitions(&mut partitions)?;
        Ok(power_lost)
    }

    /// Removes the given partitions, renumbering the rest to stay contiguous.
    /// Returns the live and dead sectors removed and the live power they carried.
    /// Partitions with faults or unproven sectors can't be removed, nor can any partition
    /// while early terminations are pending.
    pub fn remove_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        to_remove: &BitField,
        quant: QuantSpec,
    ) -> anyhow::Result<(BitField, BitField, PowerPair)> {
        if to_remove.is_empty() {
            return Ok((BitField::new(), BitField::new(), PowerPair::zero()));
        }

        let old_partitions = self.partitions_amt(store)?;
        let partition_count = old_partitions.count();
        if let Some(out_of_range) = to_remove.iter().find(|&idx| idx >= partition_count) {
            return Err(actor_error!(
                illegal_argument;
                "partition index {} out of range [0, {})",
                out_of_range,
                partition_count
            )
            .into());
        }

        if !self.early_terminations.is_empty() {
            return Err(anyhow!(
                "cannot remove partitions from deadline with early terminations"
            ));
        }

        let mut kept =
            Array::<Partition, BS>::new_with_bit_width(store, DEADLINE_PARTITIONS_AMT_BITWIDTH);
        let mut live = BitField::new();
        let mut dead = BitField::new();
        let mut removed_power = PowerPair::zero();

        for partition_idx in 0..partition_count {
            let partition = must_get_partition(&old_partitions, partition_idx, || {
                actor_error!(illegal_state; "missing partition {}", partition_idx)
            })?;

            if !to_remove.get(partition_idx) {
                let next = kept.count();
                set_partition(&mut kept, next, partition)?;
                continue;
            }

            if !partition.faults.is_empty() {
                return Err(actor_error!(
                    illegal_argument;
                    "cannot remove partition {}: has faults",
                    partition_idx
                )
                .into());
            }
            if !partition.unproven.is_empty() {
                return Err(actor_error!(
                    illegal_argument;
                    "cannot remove partition {}: has unproven sectors",
                    partition_idx
                )
                .into());
            }

            live |= &partition.live_sectors();
            dead |= &partition.terminated;
            removed_power += &partition.live_power;
        }

        self.save_partitions(&mut kept)?;

        self.live_sectors -= live.len();
        self.total_sectors -= live.len() + dead.len();

        let mut queue = self.expiration_queue(store, quant)?;
        queue
            .cut(to_remove)
            .map_err(|e| e.downcast_wrap("failed to cut removed partitions from expirations"))?;
        self.expirations_epochs = queue.root()?;

        Ok((live, dead, removed_power))
    }

    /// Declares the mapped sectors faulty and queues the affected partitions for expiry
    /// at `fault_expiration_epoch`. Returns the power delta.
    pub fn declare_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
    ) -> anyhow::Result<PowerPair> {
        let mut partitions = self.partitions_amt(store)?;
        let mut power_delta = PowerPair::zero();
        let mut faulted_partitions = Vec::<u64>::with_capacity(partition_sectors.len());

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = must_get_partition(&partitions, partition_idx, || {
                actor_error!(not_found; "no such partition {}", partition_idx)
            })?;

            let (new_faults, delta, new_faulty_power) = partition
                .declare_faults(
                    store,
                    sectors,
                    sector_numbers,
                    fault_expiration_epoch,
                    sector_size,
                    quant,
                )
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to declare faults in partition {}",
                        partition_idx
                    ))
                })?;
            set_partition(&mut partitions, partition_idx, partition)?;

            if !new_faults.is_empty() {
                faulted_partitions.push(partition_idx);
            }
            self.faulty_power += &new_faulty_power;
            power_delta += &delta;
        }

        self.save_partitions(&mut partitions)?;
        self.add_expiration_partitions(store, fault_expiration_epoch, &faulted_partitions, quant)
            .map_err(|e| {
                e.downcast_wrap("failed to update expirations for partitions with faults")
            })?;

        Ok(power_delta)
    }

    /// Marks faulty sectors as recovering. Their power returns only once proven.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        partition_sectors: &PartitionSectorMap,
    ) -> anyhow::Result<()> {
        let mut partitions = self.partitions_amt(store)?;

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let mut partition = must_get_partition(&partitions, partition_idx, || {
                actor_error!(not_found; "no such partition {}", partition_idx)
            })?;

            partition
                .declare_faults_recovered(sectors, sector_size, sector_numbers)
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to add recoveries to partition {}",
                        partition_idx
                    ))
                })?;
            set_partition(&mut partitions, partition_idx, partition)?;
        }

        self.save_partitions(&mut partitions)
    }

    /// Closes the deadline: every partition without a PoSt has its live sectors marked
    /// faulty and its recoveries dropped, then the PoSt record is cleared.
    /// Partitions that are wholly faulty with nothing recovering are left alone.
    /// Returns the power delta and the power to penalize.
    pub fn process_deadline_end<BS: Blockstore>(
        &mut self,
        store: &BS,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
    ) -> anyhow::Result<(PowerPair, PowerPair)> {
        let mut partitions = self.partitions_amt(store)?;
        let mut power_delta = PowerPair::zero();
        let mut penalized_power = PowerPair::zero();
        let mut faulted_partitions = Vec::<u64>::new();
        let mut modified = false;

        for partition_idx in 0..partitions.count() {
            if self.partitions_posted.get(partition_idx) {
                continue;
            }

            let mut partition = must_get_partition(&partitions, partition_idx, || {
                actor_error!(illegal_state; "no partition {}", partition_idx)
            })?;
            if partition.recovering_power.is_zero()
                && partition.faulty_power == partition.live_power
            {
                continue;
            }

            let (delta, penalized, new_faulty_power) = partition
                .record_missed_post(store, fault_expiration_epoch, quant)
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to record missed PoSt for partition {}",
                        partition_idx
                    ))
                })?;
            set_partition(&mut partitions, partition_idx, partition)?;
            modified = true;

            // Failed recoveries alone don't move any expirations.
            if !new_faulty_power.is_zero() {
                faulted_partitions.push(partition_idx);
            }
            self.faulty_power += &new_faulty_power;
            power_delta += &delta;
            penalized_power += &penalized;
        }

        if modified {
            self.save_partitions(&mut partitions)?;
        }
        self.add_expiration_partitions(store, fault_expiration_epoch, &faulted_partitions, quant)
            .map_err(|e| e.downcast_wrap("failed to update deadline expiration queue"))?;

        self.partitions_posted = BitField::new();
        Ok((power_delta, penalized_power))
    }

    /// Applies a batch of PoSt submissions. For each partition not yet proven this
    /// deadline, skipped sectors become faults, recoveries are confirmed and unproven
    /// sectors are activated. Partitions already proven are skipped.
    ///
    /// No proof is checked here. The caller verifies the returned `sectors` minus
    /// `ignored_sectors` against the submitted proof.
    pub fn record_proven_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        post_partitions: &[PoStPartition],
    ) -> anyhow::Result<PoStResult> {
        let mut partitions = self.partitions_amt(store)?;
        let mut result = PoStResult::default();
        let mut faulted_partitions = Vec::<u64>::new();

        for post in post_partitions {
            if self.partitions_posted.get(post.index) {
                continue;
            }

            let mut partition = must_get_partition(&partitions, post.index, || {
                actor_error!(not_found; "no such partition {}", post.index)
            })?;

            // Skipped faults go first so the recovery below sees the final fault set.
            let (skipped_delta, new_faulty_power, retracted_recovery_power, has_new_faults) =
                partition
                    .record_skipped_faults(
                        store,
                        sectors,
                        sector_size,
                        quant,
                        fault_expiration,
                        &post.skipped,
                    )
                    .map_err(|e| {
                        e.downcast_wrap(format!(
                            "failed to add skipped faults to partition {}",
                            post.index
                        ))
                    })?;
            if has_new_faults {
                faulted_partitions.push(post.index);
            }

            let recovered_power = partition
                .recover_faults(store, sectors, sector_size, quant)
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to recover faulty sectors for partition {}",
                        post.index
                    ))
                })?;
            let activated_power = partition.activate_unproven();

            result.sectors |= &partition.sectors;
            result.ignored_sectors |= &partition.faults;
            result.ignored_sectors |= &partition.terminated;
            set_partition(&mut partitions, post.index, partition)?;

            result.power_delta += &skipped_delta;
            result.power_delta += &activated_power;
            result.power_delta += &recovered_power;
            result.new_faulty_power += &new_faulty_power;
            result.retracted_recovery_power += &retracted_recovery_power;
            result.recovered_power += &recovered_power;

            self.partitions_posted.set(post.index);
        }

        self.add_expiration_partitions(store, fault_expiration, &faulted_partitions, quant)
            .map_err(|e| {
                e.downcast_wrap("failed to update expirations for partitions with faults")
            })?;

        self.faulty_power -= &result.recovered_power;
        self.faulty_power += &result.new_faulty_power;
        self.save_partitions(&mut partitions)?;

        Ok(result)
    }

    /// Moves the on-time expiration of the mapped sectors to `expiration`, returning the
    /// infos of the sectors moved. Partitions that no longer exist, and sectors that are
    /// faulty, terminated or absent, are skipped.
    pub fn reschedule_sector_expirations<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        expiration: ChainEpoch,
        partition_sectors: &PartitionSectorMap,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        let mut partitions = self.partitions_amt(store)?;
        let mut moved_partitions = Vec::<u64>::new();
        let mut moved = Vec::new();

        for (partition_idx, sector_numbers) in partition_sectors.iter() {
            let Some(mut partition) = get_partition(&partitions, partition_idx)? else {
                log::warn!(
                    "skipping rescheduling of missing partition {}",
                    partition_idx
                );
                continue;
            };

            let replaced = partition
                .reschedule_expirations(
                    store,
                    sectors,
                    expiration,
                    sector_numbers,
                    sector_size,
                    quant,
                )
                .map_err(|e| {
                    e.downcast_wrap(format!(
                        "failed to reschedule expirations in partition {}",
                        partition_idx
                    ))
                })?;
            if replaced.is_empty() {
                continue;
            }

            moved.extend(replaced);
            moved_partitions.push(partition_idx);
            set_partition(&mut partitions, partition_idx, partition)?;
        }

        if !moved_partitions.is_empty() {
            self.save_partitions(&mut partitions)?;
            self.add_expiration_partitions(store, expiration, &moved_partitions, quant)
                .map_err(|e| e.downcast_wrap("failed to reschedule partition expirations"))?;
        }

        Ok(moved)
    }

    pub fn validate_state(&self) -> anyhow::Result<()> {
        if self.live_sectors > self.total_sectors {
            return Err(anyhow!(
                "deadline left with more live sectors than total: {:?}",
                self
            ));
        }
        if self.faulty_power.raw.is_negative() || self.faulty_power.qa.is_negative() {
            return Err(anyhow!(
                "deadline left with negative faulty power: {:?}",
                self
            ));
        }
        Ok(())
    }
}
