// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::{ActorDowncast, Array};
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;

use crate::QuantSpec;

/// Sets of sector numbers filed under the epoch they fall due.
///
/// Epochs are rounded up with the queue's `QuantSpec` before they become keys.
pub struct BitFieldQueue<'db, BS> {
    pub amt: Array<'db, BitField, BS>,
    quant: QuantSpec,
}

impl<'db, BS: Blockstore> BitFieldQueue<'db, BS> {
    pub fn new(store: &'db BS, root: &Cid, quant: QuantSpec) -> Result<Self, AmtError> {
        let amt = Array::load(root, store)?;
        Ok(Self { amt, quant })
    }

    fn key_for(&self, raw_epoch: ChainEpoch) -> anyhow::Result<u64> {
        let epoch = self.quant.quantize_up(raw_epoch);
        u64::try_from(epoch).map_err(|_| anyhow!("bitfield queue cannot hold epoch {}", epoch))
    }

    fn merge_at(&mut self, key: u64, values: &BitField) -> anyhow::Result<()> {
        let merged = match self
            .amt
            .get(key)
            .map_err(|e| e.downcast_wrap(format!("failed to read queue entry at {}", key)))?
        {
            Some(existing) => existing | values,
            None => values.clone(),
        };
        self.amt
            .set(key, merged)
            .map_err(|e| e.downcast_wrap(format!("failed to write queue entry at {}", key)))
    }

    /// Merges `values` into the entry for `raw_epoch`. Empty input leaves the queue untouched.
    pub fn add_to_queue(&mut self, raw_epoch: ChainEpoch, values: &BitField) -> anyhow::Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let key = self.key_for(raw_epoch)?;
        self.merge_at(key, values)
    }

    pub fn add_to_queue_values(
        &mut self,
        epoch: ChainEpoch,
        values: impl IntoIterator<Item = u64>,
    ) -> anyhow::Result<()> {
        self.add_to_queue(epoch, &BitField::try_from_bits(values)?)
    }

    /// Applies `BitField::cut` to every entry, so later sector numbers shift down to close
    /// the gaps. Entries left empty are deleted.
    pub fn cut(&mut self, to_cut: &BitField) -> anyhow::Result<()> {
        let mut remaining = Vec::new();
        self.amt
            .for_each(|key, entry| {
                remaining.push((key, entry.cut(to_cut)));
                Ok(())
            })
            .map_err(|e| e.downcast_wrap("failed to scan queue for cut"))?;

        let mut emptied = Vec::new();
        for (key, entry) in remaining {
            if entry.is_empty() {
                emptied.push(key);
                continue;
            }
            self.amt
                .set(key, entry)
                .map_err(|e| e.downcast_wrap(format!("failed to write queue entry at {}", key)))?;
        }
        self.amt
            .batch_delete(emptied, true)
            .map_err(|e| e.downcast_wrap("failed to delete emptied queue entries"))?;
        Ok(())
    }

    /// Adds every `(epoch, value)` pair to the queue.
    ///
    /// Pairs are grouped by quantized epoch and each group is written once, lowest epoch
    /// first, so the resulting root does not depend on the order of the input.
    pub fn add_many_to_queue_values(
        &mut self,
        values: impl IntoIterator<Item = (ChainEpoch, u64)>,
    ) -> anyhow::Result<()> {
        let mut groups = BTreeMap::<u64, BTreeSet<u64>>::new();
        for (raw_epoch, value) in values {
            groups
                .entry(self.key_for(raw_epoch)?)
                .or_default()
                .insert(value);
        }

        for (key, group) in groups {
            self.merge_at(key, &BitField::try_from_bits(group)?)?;
        }
        Ok(())
    }

    /// Removes every entry at or before `until` and returns the union of their values.
    /// The flag is false when no entry was due.
    pub fn pop_until(&mut self, until: ChainEpoch) -> anyhow::Result<(BitField, bool)> {
        let mut due_keys = Vec::new();
        let mut popped = BitField::new();

        self.amt
            .for_each_while(|key, entry| {
                let due = key as ChainEpoch <= until;
                if due {
                    due_keys.push(key);
                    popped |= entry;
                }
                Ok(due)
            })
            .map_err(|e| e.downcast_wrap("failed to scan queue for due entries"))?;

        if due_keys.is_empty() {
            return Ok((popped, false));
        }
        self.amt
            .batch_delete(due_keys, true)
            .map_err(|e| e.downcast_wrap("failed to delete due queue entries"))?;
        Ok((popped, true))
    }

    /// Visits each entry in ascending epoch order.
    pub fn for_each(
        &self,
        mut f: impl FnMut(ChainEpoch, &BitField) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.amt
            .for_each(|key, entry| f(key as ChainEpoch, entry))
            .map_err(|e| e.downcast_wrap("failed to iterate bitfield queue"))
    }

    /// Flushes pending writes and returns the new root.
    pub fn root(&mut self) -> anyhow::Result<Cid> {
        self.amt
            .flush()
            .map_err(|e| e.downcast_wrap("failed to flush bitfield queue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NO_QUANTIZATION;
    use fil_actors_runtime::test_utils::{assert_bitfield_equals, bitfield_from_slice};
    use fvm_ipld_blockstore::MemoryBlockstore;

    fn empty_queue(
        store: &MemoryBlockstore,
        quant: QuantSpec,
    ) -> BitFieldQueue<'_, MemoryBlockstore> {
        let root = Array::<BitField, _>::new(store).flush().unwrap();
        BitFieldQueue::new(store, &root, quant).unwrap()
    }

    fn entries(queue: &BitFieldQueue<'_, MemoryBlockstore>) -> Vec<(ChainEpoch, Vec<u64>)> {
        let mut out = Vec::new();
        queue
            .for_each(|epoch, bf| {
                out.push((epoch, bf.iter().collect()));
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn adds_values_to_quantized_epochs() {
        let store = MemoryBlockstore::default();
        let mut queue = empty_queue(&store, QuantSpec { unit: 5, offset: 3 });

        queue.add_to_queue_values(0, [1, 3]).unwrap();
        queue.add_to_queue_values(2, [3, 4]).unwrap();
        queue.add_to_queue_values(4, [9]).unwrap();
        queue.add_to_queue_values(12, [7]).unwrap();

        assert_eq!(
            vec![(3, vec![1, 3, 4]), (8, vec![9]), (13, vec![7])],
            entries(&queue)
        );
    }

    #[test]
    fn adding_nothing_leaves_queue_untouched() {
        let store = MemoryBlockstore::default();
        let mut queue = empty_queue(&store, NO_QUANTIZATION);
        let before = queue.root().unwrap();

        queue.add_to_queue(7, &BitField::new()).unwrap();
        assert_eq!(before, queue.root().unwrap());
    }

    #[test]
    fn rejects_epochs_before_genesis() {
        let store = MemoryBlockstore::default();
        let mut queue = empty_queue(&store, NO_QUANTIZATION);

        let err = queue.add_to_queue_values(-5, [1]).unwrap_err();
        assert_eq!("bitfield queue cannot hold epoch -5", err.to_string());
        assert_eq!(0, queue.amt.count());
    }

    #[test]
    fn add_many_is_independent_of_input_order() {
        let store = MemoryBlockstore::default();
        let quant = QuantSpec { unit: 4, offset: 1 };

        let mut forward = empty_queue(&store, quant);
        forward
            .add_many_to_queue_values([(3, 1), (9, 2), (4, 3), (3, 4), (9, 2)])
            .unwrap();

        let mut backward = empty_queue(&store, quant);
        backward
            .add_many_to_queue_values([(9, 2), (3, 4), (4, 3), (9, 2), (3, 1)])
            .unwrap();

        assert_eq!(forward.root().unwrap(), backward.root().unwrap());
        assert_eq!(vec![(5, vec![1, 3, 4]), (9, vec![2])], entries(&forward));
    }

    #[test]
    fn cut_shifts_remaining_values_and_drops_empty_epochs() {
        let store = MemoryBlockstore::default();
        let mut queue = empty_queue(&store, NO_QUANTIZATION);

        queue.add_to_queue_values(1, [1, 2, 3, 4]).unwrap();
        queue.add_to_queue_values(2, [5]).unwrap();
        queue.add_to_queue_values(3, [2]).unwrap();

        queue.cut(&bitfield_from_slice(&[2, 5])).unwrap();

        assert_eq!(vec![(1, vec![1, 2, 3])], entries(&queue));
    }

    #[test]
    fn pop_until_merges_due_entries() {
        let store = MemoryBlockstore::default();
        let mut queue = empty_queue(&store, NO_QUANTIZATION);

        queue.add_to_queue_values(1, [1, 2]).unwrap();
        queue.add_to_queue_values(2, [4]).unwrap();
        queue.add_to_queue_values(5, [3]).unwrap();

        let (popped, modified) = queue.pop_until(0).unwrap();
        assert!(!modified);
        assert!(popped.is_empty());

        let (popped, modified) = queue.pop_until(4).unwrap();
        assert!(modified);
        assert_bitfield_equals(&popped, &[1, 2, 4]);
        assert_eq!(vec![(5, vec![3])], entries(&queue));
    }
}
