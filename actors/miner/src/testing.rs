// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};

use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{get_cbor, make_map_with_root, parse_uint_key, MessageAccumulator};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Protocol;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use num_traits::Zero;

use crate::{
    power_for_sectors, BitFieldQueue, Deadline, ExpirationQueue, MinerInfo, Partition, PowerPair,
    QuantSpec, SectorOnChainInfo, SectorPreCommitOnChainInfo, Sectors, State, ENTRY_SECTORS_MAX,
    NO_QUANTIZATION,
};

#[derive(Clone, Debug)]
pub struct DealSummary {
    pub sector_start: ChainEpoch,
    pub sector_expiration: ChainEpoch,
}

#[derive(Clone, Debug)]
pub struct StateSummary {
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub deals: BTreeMap<DealID, DealSummary>,
    pub seal_proof_type: RegisteredSealProof,
}

impl Default for StateSummary {
    fn default() -> Self {
        StateSummary {
            live_power: PowerPair::zero(),
            active_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
            deals: BTreeMap::new(),
            seal_proof_type: RegisteredSealProof::Invalid(0),
        }
    }
}

/// Checks internal invariants of miner state
pub fn check_state_invariants<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();
    let mut miner_summary = StateSummary::default();

    // load data from linked structures
    let sector_size = match state.get_info(store) {
        Ok(info) => {
            miner_summary.seal_proof_type = info.seal_proof_type;
            check_miner_info(&info, &acc);
            info.sector_size
        }
        Err(e) => {
            acc.add(format!("error loading miner info: {e}"));
            // Stop here, it's too hard to make other useful checks.
            return (miner_summary, acc);
        }
    };

    check_miner_balances(policy, state, store, balance, &acc);

    let allocated_sectors = match get_cbor::<_, BitField>(
        store,
        &state.allocated_sectors,
        "allocated sectors",
    ) {
        Ok(allocated_sectors) => Some(allocated_sectors),
        Err(e) => {
            acc.add(format!("error loading allocated sector bitfield: {e}"));
            None
        }
    };

    check_precommits(policy, state, store, allocated_sectors.as_ref(), &acc);

    let mut all_sectors = BTreeMap::<SectorNumber, SectorOnChainInfo>::new();
    match Sectors::load(store, &state.sectors) {
        Ok(sectors) => {
            let ret = sectors.amt.for_each(|sector_number, sector| {
                all_sectors.insert(sector_number, sector.clone());
                acc.require(
                    allocated_sectors
                        .as_ref()
                        .map_or(true, |allocated| allocated.get(sector_number)),
                    format!(
                        "on chain sector's sector number has not been allocated {sector_number}"
                    ),
                );
                for deal_id in &sector.deal_ids {
                    miner_summary.deals.insert(
                        *deal_id,
                        DealSummary {
                            sector_start: sector.activation,
                            sector_expiration: sector.expiration,
                        },
                    );
                }
                Ok(())
            });
            acc.require_no_error(ret, "error iterating sectors");
        }
        Err(e) => acc.add(format!("error loading sectors: {e}")),
    };

    // check deadlines
    acc.require(
        state.current_deadline < policy.wpost_period_deadlines,
        format!(
            "current deadline index is greater than deadlines per period({}): {}",
            policy.wpost_period_deadlines, state.current_deadline
        ),
    );

    match state.load_deadlines(store) {
        Ok(deadlines) => {
            let ret = deadlines.for_each(policy, store, |deadline_index, deadline| {
                let acc = acc.with_prefix(format!("deadline {deadline_index}: "));
                let quant = state.quant_spec_for_deadline(policy, deadline_index);
                let deadline_summary = check_deadline_state_invariants(
                    &deadline,
                    store,
                    quant,
                    sector_size,
                    &all_sectors,
                    &acc,
                );

                miner_summary.live_power += &deadline_summary.live_power;
                miner_summary.active_power += &deadline_summary.active_power;
                miner_summary.faulty_power += &deadline_summary.faulty_power;
                Ok(())
            });

            acc.require_no_error(ret, "error iterating deadlines");
        }
        Err(e) => acc.add(format!("error loading deadlines: {e}")),
    };

    (miner_summary, acc)
}

pub fn check_miner_info(info: &MinerInfo, acc: &MessageAccumulator) {
    acc.require(
        info.owner.protocol() == Protocol::ID,
        format!("owner address {} is not an ID address", info.owner),
    );
    acc.require(
        info.worker.protocol() == Protocol::ID,
        format!("worker address {} is not an ID address", info.worker),
    );
    info.control_addresses.iter().for_each(|address| {
        acc.require(
            address.protocol() == Protocol::ID,
            format!("control address {address} is not an ID address"),
        )
    });

    if let Some(pending_worker_key) = &info.pending_worker_key {
        acc.require(
            pending_worker_key.new_worker.protocol() == Protocol::ID,
            format!(
                "pending worker address {} is not an ID address",
                pending_worker_key.new_worker
            ),
        );
        acc.require(
            pending_worker_key.new_worker != info.worker,
            format!(
                "pending worker key {} is same as existing worker {}",
                pending_worker_key.new_worker, info.worker
            ),
        );
    }

    if let Some(pending_owner_address) = &info.pending_owner_address {
        acc.require(
            pending_owner_address.protocol() == Protocol::ID,
            format!("pending owner address {pending_owner_address} is not an ID address"),
        );
        acc.require(
            pending_owner_address != &info.owner,
            format!(
                "pending owner address {} is same as existing owner {}",
                pending_owner_address, info.owner
            ),
        );
    }

    match info.seal_proof_type.sector_size() {
        Ok(sector_size) => acc.require(
            sector_size == info.sector_size,
            format!(
                "sector size {:?} is wrong for seal proof type {:?}: {:?}",
                info.sector_size, info.seal_proof_type, sector_size
            ),
        ),
        Err(e) => acc.add(format!(
            "miner has unrecognized seal proof type {:?}: {e}",
            info.seal_proof_type
        )),
    }

    match info.seal_proof_type.window_post_partition_sectors() {
        Ok(partition_sectors) => acc.require(
            partition_sectors == info.window_post_partition_sectors,
            format!(
                "miner partition sectors {} does not match partition sectors {} for seal proof type {:?}",
                info.window_post_partition_sectors, partition_sectors, info.seal_proof_type
            ),
        ),
        Err(e) => acc.add(format!(
            "no seal proof policy exists for proof type {:?}: {e}",
            info.seal_proof_type
        )),
    }
}

pub fn check_miner_balances<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
    acc: &MessageAccumulator,
) {
    acc.require(
        !balance.is_negative(),
        format!("miner actor balance is less than zero: {balance}"),
    );
    acc.require(
        !state.locked_funds.is_negative(),
        format!("miner locked funds is less than zero: {}", state.locked_funds),
    );
    acc.require(
        !state.pre_commit_deposits.is_negative(),
        format!(
            "miner precommit deposit is less than zero: {}",
            state.pre_commit_deposits
        ),
    );
    acc.require(
        !state.initial_pledge.is_negative(),
        format!(
            "miner initial pledge is less than zero: {}",
            state.initial_pledge
        ),
    );
    acc.require(
        !state.fee_debt.is_negative(),
        format!("miner fee debt is less than zero: {}", state.fee_debt),
    );

    acc.require(
        !(balance - &state.locked_funds - &state.pre_commit_deposits - &state.initial_pledge)
            .is_negative(),
        format!(
            "miner balance {balance} is less than sum of locked funds ({}), precommit deposit ({}) and initial pledge ({})",
            state.locked_funds, state.pre_commit_deposits, state.initial_pledge
        ),
    );

    // locked funds must be sum of vesting table and vesting table payments must be quantized
    let mut vesting_sum = TokenAmount::zero();
    match state.load_vesting_funds(store) {
        Ok(funds) => {
            let quant = state.quant_spec_every_deadline(policy);
            funds.funds.iter().for_each(|entry| {
                acc.require(
                    entry.amount.is_positive(),
                    format!("non-positive amount in miner vesting table entry {entry:?}"),
                );
                vesting_sum += &entry.amount;

                let quantized = quant.quantize_up(entry.epoch);
                acc.require(
                    entry.epoch == quantized,
                    format!(
                        "vesting table entry has non-quantized epoch {} (should be {quantized})",
                        entry.epoch
                    ),
                );
            });
        }
        Err(e) => {
            acc.add(format!("error loading vesting funds: {e}"));
        }
    };

    acc.require(
        state.locked_funds == vesting_sum,
        format!(
            "locked funds {} is not sum of vesting table entries {vesting_sum}",
            state.locked_funds
        ),
    );
}

pub fn check_precommits<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    allocated_sectors: Option<&BitField>,
    acc: &MessageAccumulator,
) {
    let quant = state.quant_spec_every_deadline(policy);

    // invert pre-commit expiry queue into a lookup by sector number
    let mut expire_epochs = BTreeMap::<SectorNumber, ChainEpoch>::new();
    match BitFieldQueue::new(store, &state.pre_committed_sectors_expiry, quant) {
        Ok(queue) => {
            let ret = queue.for_each(|epoch, expiration| {
                let quantized = quant.quantize_up(epoch);
                acc.require(
                    quantized == epoch,
                    format!("precommit expiration {epoch} is not quantized"),
                );
                expiration.iter().for_each(|sector_number| {
                    expire_epochs.insert(sector_number, epoch);
                });
                Ok(())
            });
            acc.require_no_error(ret, "error iterating pre-commit expiry queue");
        }
        Err(e) => acc.add(format!("error loading pre-commit expiry queue: {e}")),
    };

    let mut precommit_total = TokenAmount::zero();
    match make_map_with_root::<_, SectorPreCommitOnChainInfo>(&state.pre_committed_sectors, store)
    {
        Ok(precommitted) => {
            let ret = precommitted.for_each(|key, precommit| {
                let sector_number = match parse_uint_key(key) {
                    Ok(sector_number) => sector_number,
                    Err(e) => {
                        acc.add(format!("error parsing pre-commit key as uint: {e}"));
                        return Ok(());
                    }
                };

                acc.require(
                    allocated_sectors.map_or(false, |allocated| allocated.get(sector_number)),
                    format!("pre-committed sector number has not been allocated {sector_number}"),
                );
                acc.require(
                    expire_epochs.contains_key(&sector_number),
                    format!(
                        "no expiry epoch for pre-commit at {}",
                        precommit.pre_commit_epoch
                    ),
                );

                precommit_total += &precommit.pre_commit_deposit;
                Ok(())
            });
            acc.require_no_error(ret, "error iterating pre-committed sectors");
        }
        Err(e) => acc.add(format!("error loading precommitted sectors: {e}")),
    };

    acc.require(
        state.pre_commit_deposits == precommit_total,
        format!(
            "sum of precommit deposits {precommit_total} does not equal recorded precommit deposit {}",
            state.pre_commit_deposits
        ),
    );
}

#[derive(Clone, Debug)]
pub struct DeadlineStateSummary {
    pub all_sectors: BitField,
    pub live_sectors: BitField,
    pub faulty_sectors: BitField,
    pub recovering_sectors: BitField,
    pub unproven_sectors: BitField,
    pub terminated_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
}

impl Default for DeadlineStateSummary {
    fn default() -> Self {
        DeadlineStateSummary {
            all_sectors: BitField::new(),
            live_sectors: BitField::new(),
            faulty_sectors: BitField::new(),
            recovering_sectors: BitField::new(),
            unproven_sectors: BitField::new(),
            terminated_sectors: BitField::new(),
            live_power: PowerPair::zero(),
            active_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
        }
    }
}

pub fn check_deadline_state_invariants<BS: Blockstore>(
    deadline: &Deadline,
    store: &BS,
    quant: QuantSpec,
    sector_size: SectorSize,
    sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    acc: &MessageAccumulator,
) -> DeadlineStateSummary {
    // load linked structures
    let partitions = match deadline.partitions_amt(store) {
        Ok(partitions) => partitions,
        Err(e) => {
            // Hard to do any useful checks.
            acc.add(format!("error loading partitions: {e}"));
            return DeadlineStateSummary::default();
        }
    };

    let mut all_sectors = BitField::new();
    let mut all_live_sectors = Vec::<BitField>::new();
    let mut all_faulty_sectors = Vec::<BitField>::new();
    let mut all_recovering_sectors = Vec::<BitField>::new();
    let mut all_unproven_sectors = Vec::<BitField>::new();
    let mut all_terminated_sectors = Vec::<BitField>::new();
    let mut all_live_power = PowerPair::zero();
    let mut all_active_power = PowerPair::zero();
    let mut all_faulty_power = PowerPair::zero();

    let mut partition_count = 0;

    // check partitions
    let mut partitions_with_expirations = BTreeMap::<ChainEpoch, Vec<u64>>::new();
    let mut partitions_with_early_terminations = BitField::new();
    let ret = partitions.for_each(|index, partition| {
        // check sequential partitions
        acc.require(
            index == partition_count,
            format!(
                "Non-sequential partitions, expected index {partition_count}, found {index}"
            ),
        );
        partition_count += 1;

        let acc = acc.with_prefix(format!("partition {index}: "));
        let summary = check_partition_state_invariants(
            partition,
            store,
            quant,
            sector_size,
            sectors,
            &acc,
        );

        acc.require(
            !all_sectors.contains_any(&summary.all_sectors),
            format!("duplicate sector in partition {index}"),
        );

        summary.expiration_epochs.iter().for_each(|&epoch| {
            partitions_with_expirations
                .entry(epoch)
                .or_default()
                .push(index);
        });

        if summary.early_termination_count > 0 {
            partitions_with_early_terminations.set(index);
        }

        all_sectors |= &summary.all_sectors;
        all_live_sectors.push(summary.live_sectors);
        all_faulty_sectors.push(summary.faulty_sectors);
        all_recovering_sectors.push(summary.recovering_sectors);
        all_unproven_sectors.push(summary.unproven_sectors);
        all_terminated_sectors.push(summary.terminated_sectors);
        all_live_power += &summary.live_power;
        all_active_power += &summary.active_power;
        all_faulty_power += &summary.faulty_power;
        Ok(())
    });
    acc.require_no_error(ret, "error iterating partitions");

    // check PoSt submissions
    for partition_index in deadline.partitions_posted.iter() {
        acc.require(
            partition_index <= partition_count,
            format!(
                "invalid PoSt submission for partition {partition_index} of {partition_count}"
            ),
        );
    }

    // check memoized sector and power values
    let live_sectors = BitField::union(&all_live_sectors);
    acc.require(
        deadline.live_sectors == live_sectors.len(),
        format!(
            "deadline live sectors {} != partitions count {}",
            deadline.live_sectors,
            live_sectors.len()
        ),
    );

    acc.require(
        deadline.total_sectors == all_sectors.len(),
        format!(
            "deadline total sectors {} != partitions count {}",
            deadline.total_sectors,
            all_sectors.len()
        ),
    );

    let faulty_sectors = BitField::union(&all_faulty_sectors);
    let recovering_sectors = BitField::union(&all_recovering_sectors);
    let unproven_sectors = BitField::union(&all_unproven_sectors);
    let terminated_sectors = BitField::union(&all_terminated_sectors);

    acc.require(
        deadline.faulty_power == all_faulty_power,
        format!(
            "deadline faulty power {:?} != partitions total {all_faulty_power:?}",
            deadline.faulty_power
        ),
    );

    // Validate partition expiration queue contains an entry for each partition and epoch with an expiration.
    // The queue may be a superset of the partitions that have expirations because we never remove from it.
    match BitFieldQueue::new(store, &deadline.expirations_epochs, quant) {
        Ok(expiration_queue) => {
            for (epoch, expiring_partition_indices) in partitions_with_expirations {
                match expiration_queue.amt.get(epoch as u64) {
                    Ok(Some(queued)) => {
                        for partition_index in expiring_partition_indices {
                            acc.require(
                                queued.get(partition_index),
                                format!("expected partition {partition_index} to be present in deadline expiration queue at epoch {epoch}"),
                            );
                        }
                    }
                    Ok(None) => acc.add(format!(
                        "expected to find partition expiration entry at epoch {epoch}"
                    )),
                    Err(e) => acc.add(format!("error fetching expiration bitfield: {e}")),
                }
            }
        }
        Err(e) => acc.add(format!("error loading expiration queue: {e}")),
    }

    // Validate the early termination queue contains exactly the partitions with early terminations.
    require_equal(
        &partitions_with_early_terminations,
        &deadline.early_terminations,
        acc,
        "deadline early terminations doesn't match expected partitions",
    );

    DeadlineStateSummary {
        all_sectors,
        live_sectors,
        faulty_sectors,
        recovering_sectors,
        unproven_sectors,
        terminated_sectors,
        live_power: all_live_power,
        active_power: all_active_power,
        faulty_power: all_faulty_power,
    }
}

#[derive(Clone, Debug)]
pub struct PartitionStateSummary {
    pub all_sectors: BitField,
    pub live_sectors: BitField,
    pub faulty_sectors: BitField,
    pub recovering_sectors: BitField,
    pub unproven_sectors: BitField,
    pub terminated_sectors: BitField,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub recovering_power: PowerPair,
    // Epochs at which some sector is scheduled to expire.
    pub expiration_epochs: Vec<ChainEpoch>,
    pub early_termination_count: usize,
}

pub fn check_partition_state_invariants<BS: Blockstore>(
    partition: &Partition,
    store: &BS,
    quant: QuantSpec,
    sector_size: SectorSize,
    sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    acc: &MessageAccumulator,
) -> PartitionStateSummary {
    let live = partition.live_sectors();
    let active = partition.active_sectors();

    // live contains all active sectors
    require_contains_all(&live, &active, acc, "live does not contain active");

    // live contains all faults
    require_contains_all(&live, &partition.faults, acc, "live does not contain faults");

    // live contains all unproven
    require_contains_all(&live, &partition.unproven, acc, "live does not contain unproven");

    // active contains no faults
    require_contains_none(&active, &partition.faults, acc, "active includes faults");

    // active contains no unproven
    require_contains_none(&active, &partition.unproven, acc, "active includes unproven");

    // faults contain all recoveries
    require_contains_all(
        &partition.faults,
        &partition.recoveries,
        acc,
        "faults do not contain recoveries",
    );

    // live contains no terminated sectors
    require_contains_none(&live, &partition.terminated, acc, "live includes terminations");

    // unproven contains no faults
    require_contains_none(
        &partition.faults,
        &partition.unproven,
        acc,
        "unproven includes faults",
    );

    // all terminated sectors are part of the partition
    require_contains_all(
        &partition.sectors,
        &partition.terminated,
        acc,
        "sectors do not contain terminations",
    );

    // validate power
    let mut live_sectors = None;
    let mut live_power = PowerPair::zero();
    let mut unproven_power = PowerPair::zero();
    let mut faulty_power = PowerPair::zero();

    let (selected, missing) = select_sectors_map(sectors, &live);
    if missing.is_empty() {
        live_power = power_for_sectors(sector_size, &selected);
        acc.require(
            partition.live_power == live_power,
            format!(
                "live power was {:?}, expected {live_power:?}",
                partition.live_power
            ),
        );
        live_sectors = Some(
            selected
                .into_iter()
                .map(|sector| (sector.sector_number, sector))
                .collect::<BTreeMap<_, _>>(),
        );
    } else {
        acc.add(format!("live sectors missing from all sectors: {missing:?}"));
    }

    let (selected, missing) = select_sectors_map(sectors, &partition.unproven);
    if missing.is_empty() {
        unproven_power = power_for_sectors(sector_size, &selected);
        acc.require(
            partition.unproven_power == unproven_power,
            format!(
                "unproven power was {:?}, expected {unproven_power:?}",
                partition.unproven_power
            ),
        );
    } else {
        acc.add(format!(
            "unproven sectors missing from all sectors: {missing:?}"
        ));
    }

    let (selected, missing) = select_sectors_map(sectors, &partition.faults);
    if missing.is_empty() {
        faulty_power = power_for_sectors(sector_size, &selected);
        acc.require(
            partition.faulty_power == faulty_power,
            format!(
                "faulty power was {:?}, expected {faulty_power:?}",
                partition.faulty_power
            ),
        );
    } else {
        acc.add(format!("faulty sectors missing from all sectors: {missing:?}"));
    }

    let (selected, missing) = select_sectors_map(sectors, &partition.recoveries);
    if missing.is_empty() {
        let recovering_power = power_for_sectors(sector_size, &selected);
        acc.require(
            partition.recovering_power == recovering_power,
            format!(
                "recovering power was {:?}, expected {recovering_power:?}",
                partition.recovering_power
            ),
        );
    } else {
        acc.add(format!(
            "recovering sectors missing from all sectors: {missing:?}"
        ));
    }

    let active_power = &(&live_power - &faulty_power) - &unproven_power;
    let partition_active_power = partition.active_power();
    acc.require(
        partition_active_power == active_power,
        format!("active power was {partition_active_power:?}, expected {active_power:?}"),
    );

    // validate the expiration queue
    let mut expiration_epochs = Vec::<ChainEpoch>::new();
    match ExpirationQueue::new(store, &partition.expirations_epochs, quant) {
        Ok(expiration_queue) => {
            if let Some(live_sectors) = &live_sectors {
                let queue_summary = check_expiration_queue(
                    &expiration_queue,
                    live_sectors,
                    &partition.faults,
                    quant,
                    sector_size,
                    acc,
                );

                expiration_epochs = queue_summary.expiration_epochs;
                // check the queue is compatible with partition fields
                let queue_sectors = &queue_summary.on_time_sectors | &queue_summary.early_sectors;
                require_equal(
                    &live,
                    &queue_sectors,
                    acc,
                    "live does not equal all expirations",
                );
            }
        }
        Err(e) => acc.add(format!("error loading expiration queue: {e}")),
    }

    // validate the early termination queue
    let early_termination_count =
        match BitFieldQueue::new(store, &partition.early_terminated, NO_QUANTIZATION) {
            Ok(queue) => check_early_termination_queue(&queue, &partition.terminated, acc),
            Err(e) => {
                acc.add(format!("error loading early termination queue: {e}"));
                0
            }
        };

    PartitionStateSummary {
        all_sectors: partition.sectors.clone(),
        live_sectors: live,
        faulty_sectors: partition.faults.clone(),
        recovering_sectors: partition.recoveries.clone(),
        unproven_sectors: partition.unproven.clone(),
        terminated_sectors: partition.terminated.clone(),
        live_power,
        active_power,
        faulty_power: partition.faulty_power.clone(),
        recovering_power: partition.recovering_power.clone(),
        expiration_epochs,
        early_termination_count,
    }
}

#[derive(Clone, Debug)]
pub struct ExpirationQueueStateSummary {
    pub on_time_sectors: BitField,
    pub early_sectors: BitField,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub on_time_pledge: TokenAmount,
    pub expiration_epochs: Vec<ChainEpoch>,
}

/// Checks the expiration queue for consistency.
pub fn check_expiration_queue<BS: Blockstore>(
    expiration_queue: &ExpirationQueue<'_, BS>,
    live_sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    partition_faults: &BitField,
    quant: QuantSpec,
    sector_size: SectorSize,
    acc: &MessageAccumulator,
) -> ExpirationQueueStateSummary {
    let mut seen_sectors = BTreeSet::<SectorNumber>::new();
    let mut all_on_time = Vec::<BitField>::new();
    let mut all_early = Vec::<BitField>::new();
    let mut expiration_epochs = Vec::<ChainEpoch>::new();
    let mut all_active_power = PowerPair::zero();
    let mut all_faulty_power = PowerPair::zero();
    let mut all_on_time_pledge = TokenAmount::zero();
    let mut first_queue_epoch = None;

    let ret = expiration_queue.for_each(|epoch, expiration_set| {
        let acc = acc.with_prefix(format!("expiration epoch {epoch}: "));
        let quantized = quant.quantize_up(epoch);
        acc.require(
            quantized == epoch,
            format!("expiration queue key {epoch} is not quantized, expected {quantized}"),
        );

        let first_epoch = *first_queue_epoch.get_or_insert(epoch);
        expiration_epochs.push(epoch);

        acc.require(
            expiration_set.len() <= ENTRY_SECTORS_MAX,
            format!(
                "expiration set has {} sectors, more than the limit {ENTRY_SECTORS_MAX}",
                expiration_set.len()
            ),
        );

        let mut on_time_sectors_pledge = TokenAmount::zero();
        for sector_number in expiration_set.on_time_sectors.iter() {
            // check sectors are present only once
            acc.require(
                seen_sectors.insert(sector_number),
                format!("sector {sector_number} in expiration queue twice"),
            );

            // check expiring sectors are still alive
            if let Some(sector) = live_sectors.get(&sector_number) {
                // The sector can be "on time" either at its target expiration epoch, or in the first queue entry
                // (a CC-replaced sector moved forward).
                let target = quant.quantize_up(sector.expiration);
                acc.require(
                    epoch == target || epoch == first_epoch,
                    format!("invalid expiration {epoch} for sector {sector_number}, expected {first_epoch} or {target}"),
                );

                on_time_sectors_pledge += &sector.initial_pledge;
            } else {
                acc.add(format!(
                    "on-time expiration sector {sector_number} isn't live"
                ));
            }
        }

        for sector_number in expiration_set.early_sectors.iter() {
            // check sectors are present only once
            acc.require(
                seen_sectors.insert(sector_number),
                format!("sector {sector_number} in expiration queue twice"),
            );

            // check early sectors are faulty
            acc.require(
                partition_faults.get(sector_number),
                format!("sector {sector_number} expiring early but not faulty"),
            );

            // check expiring sectors are still alive
            if let Some(sector) = live_sectors.get(&sector_number) {
                let target = quant.quantize_up(sector.expiration);
                acc.require(
                    epoch < target,
                    format!("invalid early expiration {epoch} for sector {sector_number}, expected < {target}"),
                );
            } else {
                acc.add(format!(
                    "on-time expiration sector {sector_number} isn't live"
                ));
            }
        }

        // validate power and pledge
        let all = &expiration_set.on_time_sectors | &expiration_set.early_sectors;
        let all_active = &all - partition_faults;
        let (active_sectors, missing) = select_sectors_map(live_sectors, &all_active);
        acc.require(
            missing.is_empty(),
            format!("active sectors missing from live: {missing:?}"),
        );

        let all_faulty = &all & partition_faults;
        let (faulty_sectors, missing) = select_sectors_map(live_sectors, &all_faulty);
        acc.require(
            missing.is_empty(),
            format!("faulty sectors missing from live: {missing:?}"),
        );

        let active_sectors_power = power_for_sectors(sector_size, &active_sectors);
        acc.require(
            expiration_set.active_power == active_sectors_power,
            format!(
                "active power recorded {:?} doesn't match computed {active_sectors_power:?}",
                expiration_set.active_power
            ),
        );

        let faulty_sectors_power = power_for_sectors(sector_size, &faulty_sectors);
        acc.require(
            expiration_set.faulty_power == faulty_sectors_power,
            format!(
                "faulty power recorded {:?} doesn't match computed {faulty_sectors_power:?}",
                expiration_set.faulty_power
            ),
        );

        acc.require(
            expiration_set.on_time_pledge == on_time_sectors_pledge,
            format!(
                "on time pledge recorded {} doesn't match computed {on_time_sectors_pledge}",
                expiration_set.on_time_pledge
            ),
        );

        all_on_time.push(expiration_set.on_time_sectors.clone());
        all_early.push(expiration_set.early_sectors.clone());
        all_active_power += &expiration_set.active_power;
        all_faulty_power += &expiration_set.faulty_power;
        all_on_time_pledge += &expiration_set.on_time_pledge;

        Ok(())
    });
    acc.require_no_error(ret, "error iterating expiration queue");

    ExpirationQueueStateSummary {
        on_time_sectors: BitField::union(&all_on_time),
        early_sectors: BitField::union(&all_early),
        active_power: all_active_power,
        faulty_power: all_faulty_power,
        on_time_pledge: all_on_time_pledge,
        expiration_epochs,
    }
}

/// Checks the early termination queue for consistency.
/// Returns the number of sectors in the queue.
pub fn check_early_termination_queue<BS: Blockstore>(
    early_queue: &BitFieldQueue<'_, BS>,
    terminated: &BitField,
    acc: &MessageAccumulator,
) -> usize {
    let mut seen = BitField::new();

    let ret = early_queue.for_each(|epoch, bitfield| {
        let acc = acc.with_prefix(format!("early termination epoch {epoch}: "));
        for sector_number in bitfield.iter() {
            acc.require(
                !seen.get(sector_number),
                format!("sector {sector_number} in early termination queue twice"),
            );
            seen.set(sector_number);
        }
        Ok(())
    });
    acc.require_no_error(ret, "error iterating early termination queue");

    require_contains_all(
        terminated,
        &seen,
        acc,
        "terminated sectors missing early termination entry",
    );

    seen.len() as usize
}

/// Selects a subset of sectors by number, returning the selected sectors and
/// any numbers that weren't found.
fn select_sectors_map(
    sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    include: &BitField,
) -> (Vec<SectorOnChainInfo>, Vec<SectorNumber>) {
    let mut included = Vec::new();
    let mut missing = Vec::new();

    for sector_number in include.iter() {
        match sectors.get(&sector_number) {
            Some(sector) => included.push(sector.clone()),
            None => missing.push(sector_number),
        }
    }

    (included, missing)
}

fn require_contains_all(
    superset: &BitField,
    subset: &BitField,
    acc: &MessageAccumulator,
    error_msg: &str,
) {
    if !superset.contains_all(subset) {
        acc.add(format!(
            "{error_msg}: {:?}, {:?}",
            superset.iter().collect::<Vec<_>>(),
            subset.iter().collect::<Vec<_>>()
        ));
    }
}

fn require_contains_none(
    superset: &BitField,
    subset: &BitField,
    acc: &MessageAccumulator,
    error_msg: &str,
) {
    if superset.contains_any(subset) {
        acc.add(format!(
            "{error_msg}: {:?}, {:?}",
            superset.iter().collect::<Vec<_>>(),
            subset.iter().collect::<Vec<_>>()
        ));
    }
}

fn require_equal(a: &BitField, b: &BitField, acc: &MessageAccumulator, error_msg: &str) {
    require_contains_all(a, b, acc, error_msg);
    // Only check second direction if first direction passed
    if a.contains_all(b) {
        require_contains_all(b, a, acc, error_msg);
    }
}
