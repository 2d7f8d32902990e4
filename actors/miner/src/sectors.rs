// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::{ActorDowncast, ActorError, Array, AsActorError, MAX_SECTOR_NUMBER};
use fvm_ipld_amt::Error as AmtError;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::SectorNumber;

use super::SectorOnChainInfo;

/// Bit width of the sectors AMT.
pub const SECTORS_AMT_BITWIDTH: u32 = 5;

/// Wrapper for the AMT of sector infos, indexed by sector number.
pub struct Sectors<'db, BS> {
    pub amt: Array<'db, SectorOnChainInfo, BS>,
}

impl<'db, BS: Blockstore> Sectors<'db, BS> {
    pub fn load(store: &'db BS, root: &Cid) -> Result<Self, AmtError> {
        Ok(Self {
            amt: Array::load(root, store)?,
        })
    }

    /// Loads the infos for every sector number in the set, in ascending order.
    /// Fails with not-found if any of them is missing.
    pub fn load_sector(
        &self,
        sector_numbers: &BitField,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        let mut sector_infos: Vec<SectorOnChainInfo> = Vec::new();
        for sector_number in sector_numbers.iter() {
            let sector_on_chain = self
                .amt
                .get(sector_number)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to load sector {}", sector_number),
                    )
                })?
                .cloned()
                .with_context_code(ExitCode::USR_NOT_FOUND, || {
                    format!("sector not found: {}", sector_number)
                })?;
            sector_infos.push(sector_on_chain);
        }
        Ok(sector_infos)
    }

    pub fn get(&self, sector_number: SectorNumber) -> anyhow::Result<Option<SectorOnChainInfo>> {
        Ok(self
            .amt
            .get(sector_number)
            .map_err(|e| e.downcast_wrap(format!("failed to get sector {}", sector_number)))?
            .cloned())
    }

    pub fn store(&mut self, infos: Vec<SectorOnChainInfo>) -> anyhow::Result<()> {
        for info in infos {
            let sector_number = info.sector_number;

            if sector_number > MAX_SECTOR_NUMBER {
                return Err(anyhow!("sector number {} out of range", info.sector_number));
            }

            self.amt.set(sector_number, info).map_err(|e| {
                e.downcast_wrap(format!("failed to store sector {}", sector_number))
            })?;
        }

        Ok(())
    }

    pub fn must_get(&self, sector_number: SectorNumber) -> anyhow::Result<SectorOnChainInfo> {
        Ok(self.get(sector_number)?.with_context_code(ExitCode::USR_NOT_FOUND, || {
            format!("sector {} not found", sector_number)
        })?)
    }

    /// Loads info for a set of sectors to be proven.
    /// If any of the sectors are declared faulty and not to be recovered, info for the first non-faulty sector is substituted instead.
    /// If any of the sectors are declared recovered, they are returned from this method.
    pub fn load_for_proof(
        &self,
        proven_sectors: &BitField,
        expected_faults: &BitField,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        let non_faults = proven_sectors - expected_faults;

        let good_sector_number = match non_faults.first() {
            Some(sector_number) => sector_number,
            None => return Ok(Vec::new()),
        };

        self.load_with_fault_mask(proven_sectors, expected_faults, good_sector_number)
    }

    /// Loads sector info for a sequence of sectors, substituting info for a stand-in sector for any that are faulty.
    pub fn load_with_fault_mask(
        &self,
        sectors: &BitField,
        faults: &BitField,
        fault_stand_in: SectorNumber,
    ) -> anyhow::Result<Vec<SectorOnChainInfo>> {
        let stand_in_info = self.must_get(fault_stand_in)?;

        // Expand faults into a set for quick lookups.
        // The faults bitfield should already be a subset of the sectors bitfield.
        let fault_set: BTreeSet<u64> = faults.iter().collect();

        let mut sector_infos = Vec::with_capacity(sectors.len() as usize);
        for i in sectors.iter() {
            let sector = if fault_set.contains(&i) {
                stand_in_info.clone()
            } else {
                self.must_get(i)?
            };
            sector_infos.push(sector);
        }

        Ok(sector_infos)
    }
}

/// Picks the infos whose numbers are in `field`, keeping the order of `sectors`.
pub fn select_sectors(
    sectors: &[SectorOnChainInfo],
    field: &BitField,
) -> anyhow::Result<Vec<SectorOnChainInfo>> {
    let mut to_include: BTreeSet<_> = field.iter().collect();

    let mut included = Vec::with_capacity(to_include.len());
    for s in sectors {
        if !to_include.remove(&s.sector_number) {
            continue;
        }
        included.push(s.clone());
    }

    if !to_include.is_empty() {
        return Err(anyhow!(
            "failed to find {} expected sectors",
            to_include.len()
        ));
    }

    Ok(included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fil_actors_runtime::test_utils::bitfield_from_slice;
    use fvm_ipld_blockstore::MemoryBlockstore;

    fn info(sector_number: SectorNumber, expiration: i64) -> SectorOnChainInfo {
        SectorOnChainInfo {
            sector_number,
            expiration,
            ..Default::default()
        }
    }

    fn setup<'a>(store: &'a MemoryBlockstore, numbers: &[u64]) -> Sectors<'a, MemoryBlockstore> {
        let root = Array::<SectorOnChainInfo, _>::new_with_bit_width(store, SECTORS_AMT_BITWIDTH)
            .flush()
            .unwrap();
        let mut sectors = Sectors::load(store, &root).unwrap();
        sectors
            .store(numbers.iter().map(|&n| info(n, 100 + n as i64)).collect())
            .unwrap();
        sectors
    }

    #[test]
    fn loads_sectors_in_ascending_order() {
        let store = MemoryBlockstore::default();
        let sectors = setup(&store, &[5, 1, 3]);

        let loaded = sectors.load_sector(&bitfield_from_slice(&[1, 3, 5])).unwrap();
        let numbers: Vec<_> = loaded.iter().map(|s| s.sector_number).collect();
        assert_eq!(vec![1, 3, 5], numbers);
    }

    #[test]
    fn loading_a_missing_sector_is_not_found() {
        let store = MemoryBlockstore::default();
        let sectors = setup(&store, &[1]);

        let err = sectors.load_sector(&bitfield_from_slice(&[1, 2])).unwrap_err();
        assert_eq!(ExitCode::USR_NOT_FOUND, err.exit_code());
        assert!(sectors.get(2).unwrap().is_none());
        assert!(sectors.must_get(2).is_err());
    }

    #[test]
    fn rejects_out_of_range_sector_numbers() {
        let store = MemoryBlockstore::default();
        let mut sectors = setup(&store, &[]);
        assert!(sectors.store(vec![info(MAX_SECTOR_NUMBER + 1, 10)]).is_err());
    }

    #[test]
    fn faulty_sectors_are_substituted_for_proofs() {
        let store = MemoryBlockstore::default();
        let sectors = setup(&store, &[1, 2, 3, 4]);

        let loaded = sectors
            .load_for_proof(&bitfield_from_slice(&[1, 2, 3, 4]), &bitfield_from_slice(&[1, 3]))
            .unwrap();
        let numbers: Vec<_> = loaded.iter().map(|s| s.sector_number).collect();
        assert_eq!(vec![2, 2, 2, 4], numbers);
    }

    #[test]
    fn all_faulty_proof_set_loads_nothing() {
        let store = MemoryBlockstore::default();
        let sectors = setup(&store, &[1, 2]);

        let loaded = sectors
            .load_for_proof(&bitfield_from_slice(&[1, 2]), &bitfield_from_slice(&[1, 2]))
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn select_sectors_keeps_input_order() {
        let infos = vec![info(7, 1), info(2, 1), info(5, 1)];

        let selected = select_sectors(&infos, &bitfield_from_slice(&[5, 7])).unwrap();
        let numbers: Vec<_> = selected.iter().map(|s| s.sector_number).collect();
        assert_eq!(vec![7, 5], numbers);

        let err = select_sectors(&infos, &bitfield_from_slice(&[5, 9])).unwrap_err();
        assert_eq!("failed to find 1 expected sectors", err.to_string());
    }
}
