// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::ops::AddAssign;

use fvm_ipld_bitfield::BitField;
use fvm_shared::clock::ChainEpoch;

/// Sectors popped from early-termination queues, by termination epoch.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TerminationResult {
    /// Sectors maps epochs at which sectors expired, to bitfields of sector numbers.
    pub sectors: BTreeMap<ChainEpoch, BitField>,
    pub partitions_processed: u64,
    pub sectors_processed: u64,
}

impl AddAssign for TerminationResult {
    fn add_assign(&mut self, rhs: Self) {
        self.partitions_processed += rhs.partitions_processed;
        self.sectors_processed += rhs.sectors_processed;

        for (epoch, new_sectors) in rhs.sectors {
            self.sectors
                .entry(epoch)
                .and_modify(|sectors| *sectors |= &new_sectors)
                .or_insert(new_sectors);
        }
    }
}

impl TerminationResult {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns true if we're below the partition and sector limit.
    pub fn below_limit(&self, partition_limit: u64, sector_limit: u64) -> bool {
        self.partitions_processed < partition_limit && self.sectors_processed < sector_limit
    }

    /// Returns true if no sectors were processed.
    pub fn is_empty(&self) -> bool {
        self.sectors_processed == 0
    }

    /// Returns an iterator over all epochs and their sectors, in ascending epoch order.
    pub fn iter(&self) -> impl Iterator<Item = (ChainEpoch, &BitField)> {
        self.sectors.iter().map(|(&epoch, bf)| (epoch, bf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fil_actors_runtime::test_utils::bitfield_from_slice;

    fn result(partitions: u64, entries: &[(ChainEpoch, &[u64])]) -> TerminationResult {
        let sectors: BTreeMap<_, _> = entries
            .iter()
            .map(|&(epoch, nos)| (epoch, bitfield_from_slice(nos)))
            .collect();
        let sectors_processed = sectors.values().map(|bf| bf.len()).sum();
        TerminationResult {
            sectors,
            partitions_processed: partitions,
            sectors_processed,
        }
    }

    #[test]
    fn adding_merges_epochs_and_counts() {
        let mut acc = result(1, &[(10, &[1, 2]), (20, &[5])]);
        acc += result(2, &[(10, &[3]), (15, &[9])]);

        assert_eq!(3, acc.partitions_processed);
        assert_eq!(5, acc.sectors_processed);

        let epochs: Vec<_> = acc.iter().map(|(e, bf)| (e, bf.iter().collect::<Vec<_>>())).collect();
        assert_eq!(
            vec![(10, vec![1, 2, 3]), (15, vec![9]), (20, vec![5])],
            epochs
        );
    }

    #[test]
    fn limits_are_exclusive() {
        let r = result(2, &[(1, &[1, 2, 3])]);
        assert!(r.below_limit(3, 4));
        assert!(!r.below_limit(2, 4));
        assert!(!r.below_limit(3, 3));
        assert!(TerminationResult::new().is_empty());
        assert!(!r.is_empty());
    }
}
