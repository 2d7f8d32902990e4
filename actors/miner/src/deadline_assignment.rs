// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::anyhow;
use fil_actors_runtime::runtime::Policy;

use super::{Deadline, SectorOnChainInfo};

fn div_rounding_up(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + u64::from(dividend % divisor > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadlineAssignmentInfo {
    index: usize,
    live_sectors: u64,
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    fn partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.total_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn compact_partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.live_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn is_full_now(&self, partition_size: u64) -> bool {
        self.total_sectors % partition_size == 0
    }

    fn max_partitions_reached(&self, partition_size: u64, max_partitions: u64) -> bool {
        self.total_sectors >= partition_size * max_partitions
    }
}

/// Orders two candidate deadlines; `Ordering::Less` means `a` should receive the next sector.
fn compare_assignment(
    a: &DeadlineAssignmentInfo,
    b: &DeadlineAssignmentInfo,
    partition_size: u64,
    max_partitions: u64,
) -> Ordering {
    // If one of the deadlines has already reached it's limit for the maximum number of partitions and
    // the other hasn't, we directly pick the deadline that hasn't reached it's limit.
    let a_max_partitions_reached = a.max_partitions_reached(partition_size, max_partitions);
    let b_max_partitions_reached = b.max_partitions_reached(partition_size, max_partitions);
    if a_max_partitions_reached != b_max_partitions_reached {
        return a_max_partitions_reached.cmp(&b_max_partitions_reached);
    }

    // Otherwise:-
    // When assigning partitions to deadlines, we're trying to optimize the
    // following:
    //
    // First, avoid increasing the maximum number of partitions in any
    // deadline, across all deadlines, after compaction. This would
    // necessitate buying a new GPU.
    //
    // Second, avoid forcing the miner to repeatedly compact partitions. A
    // miner would be "forced" to compact a partition when a the number of
    // partitions in any given deadline goes above the current maximum
    // number of partitions across all deadlines, and compacting that
    // deadline would then reduce the number of partitions, reducing the
    // maximum.
    //
    // At the moment, the only "forced" compaction happens when either:
    //
    // 1. Assignment of the sector into any deadline would force a
    //    compaction.
    // 2. The chosen deadline has at least one full partition's worth of
    //    terminated sectors and at least one fewer partition (after
    //    compaction) than any other deadline.
    //
    // Third, we attempt to assign "runs" of sectors to the same partition
    // to reduce the size of the bitfields.
    //
    // Finally, we try to balance the number of sectors (thus partitions)
    // assigned to any given deadline over time.

    // Summary:
    //
    // 1. Assign to the deadline that will have the _least_ number of
    //    post-compaction partitions (after sector assignment).
    // 2. Assign to the deadline that will have the _least_ number of
    //    pre-compaction partitions (after sector assignment).
    // 3. Assign to a deadline with a non-full partition.
    //    - If both have non-full partitions, assign to the most full one (stable assortment).
    // 4. Assign to the deadline with the least number of live sectors.
    // 5. Assign sectors to the deadline with the lowest index first.

    // If one deadline would end up with fewer partitions (after
    // compacting), assign to that one. This ensures we keep the maximum
    // number of partitions in any given deadline to a minimum.
    //
    // Technically, this could increase the maximum number of partitions
    // before compaction. However, that can only happen if the deadline in
    // question could save an entire partition by compacting. At that point,
    // the miner should compact the deadline.
    a.compact_partitions_after_assignment(partition_size)
        .cmp(&b.compact_partitions_after_assignment(partition_size))
        .then_with(|| {
            // If, after assignment, neither deadline would have fewer
            // post-compaction partitions, assign to the deadline with the fewest
            // pre-compaction partitions (after assignment). This will put off
            // compaction as long as possible.
            a.partitions_after_assignment(partition_size)
                .cmp(&b.partitions_after_assignment(partition_size))
        })
        .then_with(|| {
            // Ok, we'll end up with the same number of partitions any which way we
            // go. Try to fill up a partition instead of opening a new one.
            a.is_full_now(partition_size)
                .cmp(&b.is_full_now(partition_size))
        })
        .then_with(|| {
            // Either we have two open partitions, or neither deadline has an open
            // partition.

            // If we have two open partitions, fill the deadline with the most-full
            // open partition. This helps us assign runs of sequential sectors into
            // the same partition.
            if !a.is_full_now(partition_size) && !b.is_full_now(partition_size) {
                b.total_sectors.cmp(&a.total_sectors)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| {
            // Otherwise, assign to the deadline with the least live sectors. This
            // will break the tie in one of the two immediately preceding
            // conditions.
            a.live_sectors.cmp(&b.live_sectors)
        })
        // Finally, fallback on the deadline index.
        .then_with(|| a.index.cmp(&b.index))
}

// Heap entry carrying the assignment parameters, since `Ord` can't take extra arguments.
struct DeadlineAssignmentEntry {
    info: DeadlineAssignmentInfo,
    partition_size: u64,
    max_partitions: u64,
}

impl PartialEq for DeadlineAssignmentEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DeadlineAssignmentEntry {}

impl PartialOrd for DeadlineAssignmentEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineAssignmentEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the preferred deadline is on top.
        compare_assignment(
            &other.info,
            &self.info,
            self.partition_size,
            self.max_partitions,
        )
    }
}

/// Assigns partitions to deadlines, first filling partial partitions, then
/// adding new partitions to deadlines with the fewest live sectors.
///
/// `deadlines` holds one slot per deadline; `None` marks a deadline that may not receive sectors.
/// The result holds the sectors assigned to each deadline, in input order.
pub fn assign_deadlines(
    policy: &Policy,
    max_partitions: u64,
    partition_size: u64,
    deadlines: &[Option<Deadline>],
    sectors: Vec<SectorOnChainInfo>,
) -> anyhow::Result<Vec<Vec<SectorOnChainInfo>>> {
    if partition_size == 0 {
        return Err(anyhow!("partition size must be positive"));
    }

    let mut heap: BinaryHeap<DeadlineAssignmentEntry> = deadlines
        .iter()
        .enumerate()
        .filter_map(|(index, deadline)| deadline.as_ref().map(|dl| (index, dl)))
        .map(|(index, deadline)| DeadlineAssignmentEntry {
            info: DeadlineAssignmentInfo {
                index,
                live_sectors: deadline.live_sectors,
                total_sectors: deadline.total_sectors,
            },
            partition_size,
            max_partitions,
        })
        .collect();

    let mut changes = vec![Vec::new(); policy.wpost_period_deadlines as usize];

    for sector in sectors {
        let mut entry = heap
            .peek_mut()
            .ok_or_else(|| anyhow!("no deadlines available for assignment"))?;
        let info = &mut entry.info;

        if info.max_partitions_reached(partition_size, max_partitions) {
            return Err(anyhow!(
                "max partitions limit {} reached for all deadlines",
                max_partitions
            ));
        }

        changes[info.index].push(sector);
        info.live_sectors += 1;
        info.total_sectors += 1;
        // Dropping the PeekMut re-heapifies.
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: usize, live_sectors: u64, total_sectors: u64) -> DeadlineAssignmentInfo {
        DeadlineAssignmentInfo {
            index,
            live_sectors,
            total_sectors,
        }
    }

    #[test]
    fn deadline_below_partition_limit_wins() {
        // Deadline 0 is at its limit of 2 partitions of 4 sectors.
        let a = info(0, 0, 8);
        let b = info(1, 5, 5);
        assert_eq!(Ordering::Greater, compare_assignment(&a, &b, 4, 2));
        assert_eq!(Ordering::Less, compare_assignment(&b, &a, 4, 2));
    }

    #[test]
    fn fewer_partitions_after_compaction_wins() {
        let a = info(0, 1, 8);
        let b = info(1, 5, 5);
        assert_eq!(Ordering::Less, compare_assignment(&a, &b, 4, 100));
    }

    #[test]
    fn open_partitions_prefer_the_fuller_one() {
        let a = info(0, 2, 2);
        let b = info(1, 3, 3);
        assert_eq!(Ordering::Greater, compare_assignment(&a, &b, 4, 100));
    }

    #[test]
    fn index_breaks_ties() {
        let a = info(3, 4, 4);
        let b = info(5, 4, 4);
        assert_eq!(Ordering::Less, compare_assignment(&a, &b, 4, 100));
        assert_eq!(Ordering::Equal, compare_assignment(&a, &a, 4, 100));
    }
}
