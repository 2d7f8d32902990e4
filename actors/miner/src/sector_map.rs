// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use fil_actors_runtime::runtime::Policy;
use fvm_ipld_bitfield::BitField;

/// Sector numbers grouped by deadline, then by partition.
#[derive(Default, Debug)]
pub struct DeadlineSectorMap(BTreeMap<u64, PartitionSectorMap>);

/// Sector numbers grouped by partition.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PartitionSectorMap(BTreeMap<u64, BitField>);

fn checked_total(counts: impl IntoIterator<Item = u64>, what: &str) -> anyhow::Result<u64> {
    counts.into_iter().try_fold(0_u64, |total, n| {
        total
            .checked_add(n)
            .ok_or_else(|| anyhow!("integer overflow when counting {}", what))
    })
}

impl DeadlineSectorMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Fails if the map spans more than `max_partitions` partitions or `max_sectors` sectors.
    pub fn check(&self, max_partitions: u64, max_sectors: u64) -> anyhow::Result<()> {
        let (partitions, sectors) = self.count().context("failed to count sectors")?;
        anyhow::ensure!(
            partitions <= max_partitions,
            "too many partitions {}, max {}",
            partitions,
            max_partitions
        );
        anyhow::ensure!(
            sectors <= max_sectors,
            "too many sectors {}, max {}",
            sectors,
            max_sectors
        );
        Ok(())
    }

    /// Total partitions and sectors across every deadline.
    pub fn count(&self) -> anyhow::Result<(u64, u64)> {
        let per_deadline = self
            .0
            .iter()
            .map(|(deadline_idx, partitions)| {
                partitions
                    .count()
                    .with_context(|| format!("when counting deadline {}", deadline_idx))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok((
            checked_total(per_deadline.iter().map(|&(p, _)| p), "partitions")?,
            checked_total(per_deadline.iter().map(|&(_, s)| s), "sectors")?,
        ))
    }

    /// Merges `sector_numbers` into the entry for the deadline and partition.
    pub fn add(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: BitField,
    ) -> anyhow::Result<()> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(anyhow!("invalid deadline {}", deadline_idx));
        }
        self.0
            .entry(deadline_idx)
            .or_default()
            .add(partition_idx, sector_numbers)
    }

    pub fn add_values(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: &[u64],
    ) -> anyhow::Result<()> {
        let bits = BitField::try_from_bits(sector_numbers.iter().copied())?;
        self.add(policy, deadline_idx, partition_idx, bits)
    }

    /// Deadline indices present, ascending.
    pub fn deadlines(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &PartitionSectorMap)> + '_ {
        self.0.iter().map(|(&idx, partitions)| (idx, partitions))
    }
}

impl PartitionSectorMap {
    /// Merges `sector_numbers` into the partition's entry.
    pub fn add(&mut self, partition_idx: u64, sector_numbers: BitField) -> anyhow::Result<()> {
        match self.0.entry(partition_idx) {
            Entry::Occupied(mut existing) => *existing.get_mut() |= &sector_numbers,
            Entry::Vacant(slot) => {
                slot.insert(sector_numbers);
            }
        }
        Ok(())
    }

    /// Number of partitions and total sectors in the map.
    pub fn count(&self) -> anyhow::Result<(u64, u64)> {
        let sectors = checked_total(self.0.values().map(BitField::len), "sectors")?;
        Ok((self.0.len() as u64, sectors))
    }

    /// Partition indices present, ascending.
    pub fn partitions(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &BitField)> + '_ {
        self.0.iter().map(|(&idx, sectors)| (idx, sectors))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
