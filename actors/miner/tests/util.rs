// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use fil_actor_miner::testing::check_deadline_state_invariants;
use fil_actor_miner::{
    power_for_sectors, Deadline, PowerPair, QuantSpec, SectorOnChainInfo, Sectors,
    SECTORS_AMT_BITWIDTH,
};
use fil_actors_runtime::test_utils::{bitfield_from_slice, make_sealed_cid};
use fil_actors_runtime::{make_empty_array_root, DealWeight, MessageAccumulator};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};

pub const SECTOR_SIZE: SectorSize = SectorSize::_32GiB;
pub const QUANT_SPEC: QuantSpec = QuantSpec { unit: 4, offset: 1 };

pub fn new_bitfield(sector_numbers: &[u64]) -> BitField {
    bitfield_from_slice(sector_numbers)
}

pub fn test_sector(
    expiration: ChainEpoch,
    sector_number: SectorNumber,
    deal_weight: u64,
    verified_deal_weight: u64,
    pledge: u64,
) -> SectorOnChainInfo {
    SectorOnChainInfo {
        expiration,
        sector_number,
        deal_weight: DealWeight::from(deal_weight),
        verified_deal_weight: DealWeight::from(verified_deal_weight),
        initial_pledge: TokenAmount::from_atto(pledge),
        sealed_cid: make_sealed_cid(format!("commR-{sector_number}").as_bytes()),
        ..Default::default()
    }
}

/// Stores the infos in a fresh sectors array.
pub fn sectors_array<BS: Blockstore>(
    store: &BS,
    infos: Vec<SectorOnChainInfo>,
) -> Sectors<'_, BS> {
    let root =
        make_empty_array_root::<_, SectorOnChainInfo>(store, SECTORS_AMT_BITWIDTH).unwrap();
    let mut sectors = Sectors::load(store, &root).unwrap();
    sectors.store(infos).unwrap();
    sectors
}

pub fn select_sectors(sectors: &[SectorOnChainInfo], field: &BitField) -> Vec<SectorOnChainInfo> {
    let mut to_include: BTreeSet<_> = field.iter().collect();
    let included = sectors
        .iter()
        .filter(|sector| to_include.remove(&sector.sector_number))
        .cloned()
        .collect();

    assert!(
        to_include.is_empty(),
        "failed to find {} expected sectors",
        to_include.len()
    );

    included
}

pub fn power_of(sectors: &[SectorOnChainInfo], sector_numbers: &[u64]) -> PowerPair {
    power_for_sectors(
        SECTOR_SIZE,
        &select_sectors(sectors, &new_bitfield(sector_numbers)),
    )
}

/// Expected shape of a deadline, checked bitfield by bitfield and against the
/// full set of state invariants.
pub struct ExpectedDeadlineState {
    pub quant: QuantSpec,
    pub partition_size: u64,
    pub sector_size: SectorSize,
    pub sectors: Vec<SectorOnChainInfo>,
    pub faults: BitField,
    pub recovering: BitField,
    pub terminations: BitField,
    pub unproven: BitField,
    pub posts: BitField,
    pub partition_sectors: Vec<BitField>,
}

impl ExpectedDeadlineState {
    pub fn new(
        quant: QuantSpec,
        partition_size: u64,
        sector_size: SectorSize,
        sectors: Vec<SectorOnChainInfo>,
    ) -> Self {
        Self {
            quant,
            partition_size,
            sector_size,
            sectors,
            faults: BitField::new(),
            recovering: BitField::new(),
            terminations: BitField::new(),
            unproven: BitField::new(),
            posts: BitField::new(),
            partition_sectors: Vec::new(),
        }
    }

    pub fn with_quant_spec(mut self, quant: QuantSpec) -> Self {
        self.quant = quant;
        self
    }

    pub fn with_faults(mut self, faults: &[u64]) -> Self {
        self.faults = new_bitfield(faults);
        self
    }

    pub fn with_recovering(mut self, recovering: &[u64]) -> Self {
        self.recovering = new_bitfield(recovering);
        self
    }

    pub fn with_terminations(mut self, terminations: &[u64]) -> Self {
        self.terminations = new_bitfield(terminations);
        self
    }

    pub fn with_unproven(mut self, unproven: &[u64]) -> Self {
        self.unproven = new_bitfield(unproven);
        self
    }

    pub fn with_posts(mut self, posts: &[u64]) -> Self {
        self.posts = new_bitfield(posts);
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<BitField>) -> Self {
        self.partition_sectors = partitions;
        self
    }

    /// Asserts that the deadline matches the expectation and satisfies every invariant.
    #[track_caller]
    pub fn assert<BS: Blockstore>(self, store: &BS, deadline: &Deadline) -> Self {
        let sectors: BTreeMap<SectorNumber, SectorOnChainInfo> = self
            .sectors
            .iter()
            .map(|info| (info.sector_number, info.clone()))
            .collect();

        let acc = MessageAccumulator::default();
        let summary = check_deadline_state_invariants(
            deadline,
            store,
            self.quant,
            self.sector_size,
            &sectors,
            &acc,
        );
        acc.assert_empty();

        assert_eq!(self.faults, summary.faulty_sectors, "faults");
        assert_eq!(self.recovering, summary.recovering_sectors, "recoveries");
        assert_eq!(self.terminations, summary.terminated_sectors, "terminations");
        assert_eq!(self.unproven, summary.unproven_sectors, "unproven");
        assert_eq!(self.posts, deadline.partitions_posted, "posts");

        let partitions = deadline.partitions_amt(store).unwrap();
        assert_eq!(
            self.partition_sectors.len() as u64,
            partitions.count(),
            "partition count"
        );
        for (i, expected) in self.partition_sectors.iter().enumerate() {
            let partition = partitions.get(i as u64).unwrap().unwrap();
            assert_eq!(expected, &partition.sectors, "sectors of partition {i}");
            assert!(
                partition.sectors.len() <= self.partition_size,
                "partition {i} over capacity"
            );
        }

        self
    }
}
