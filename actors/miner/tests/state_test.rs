// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_actor_miner::testing::check_state_invariants;
use fil_actor_miner::{
    new_deadline_info, power_for_sectors, AdvanceDeadlineResult, DeadlineSectorMap, MinerInfo,
    PartitionSectorMap, PoStPartition, PoStResult, SectorOnChainInfo, SectorPreCommitInfo,
    SectorPreCommitOnChainInfo, Sectors, State, VestSpec, ERR_BALANCE_INVARIANTS_BROKEN,
};
use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::test_utils::{assert_bitfield_equals, make_sealed_cid};
use fil_actors_runtime::{put_cbor, ActorError, DealWeight, MAX_SECTOR_NUMBER};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};
use regex::Regex;

mod util;
use crate::util::*;

const PERIOD_START: ChainEpoch = 100;
const PARTITION_SIZE: u64 = 4;
const SEAL_PROOF: RegisteredSealProof = RegisteredSealProof::StackedDRG32GiBV1P1;

/// Short vesting schedule aligned with the devnet deadline windows.
const VEST_SPEC: VestSpec = VestSpec {
    initial_delay: 0,
    vest_period: 40,
    step_duration: 10,
    quantization: 10,
};

fn tokens(atto: u64) -> TokenAmount {
    TokenAmount::from_atto(atto)
}

struct Harness {
    policy: Policy,
    store: MemoryBlockstore,
    state: State,
}

impl Harness {
    fn new() -> Self {
        let policy = Policy::devnet();
        let store = MemoryBlockstore::default();

        let info = MinerInfo::new(
            Address::new_id(100),
            Address::new_id(101),
            vec![Address::new_id(102)],
            b"peer".to_vec(),
            vec![],
            SEAL_PROOF,
        )
        .unwrap();
        let info_cid = put_cbor(&store, &info, "miner info").unwrap();
        let state = State::new(&policy, &store, info_cid, PERIOD_START, 0).unwrap();

        Self {
            policy,
            store,
            state,
        }
    }

    #[track_caller]
    fn assert_invariants(&self, balance: &TokenAmount) {
        let (_, acc) = check_state_invariants(&self.policy, &self.state, &self.store, balance);
        acc.assert_empty();
    }

    /// Allocates, stores and assigns new sectors at the start of the proving period,
    /// locking their pledge.
    fn add_sectors(
        &mut self,
        numbers: impl IntoIterator<Item = SectorNumber>,
        expiration: ChainEpoch,
    ) -> Vec<SectorOnChainInfo> {
        let infos: Vec<_> = numbers
            .into_iter()
            .map(|n| test_sector(expiration, n, 0, 0, 1000))
            .collect();
        let numbers: Vec<_> = infos.iter().map(|s| s.sector_number).collect();

        self.state
            .mask_sector_numbers(&self.store, &new_bitfield(&numbers))
            .unwrap();
        self.state.put_sectors(&self.store, infos.clone()).unwrap();
        let activated = self
            .state
            .assign_sectors_to_deadlines(
                &self.policy,
                &self.store,
                PERIOD_START,
                infos.clone(),
                PARTITION_SIZE,
                SECTOR_SIZE,
            )
            .unwrap();
        assert!(activated.is_zero());

        let pledge = infos
            .iter()
            .fold(TokenAmount::default(), |acc, s| acc + &s.initial_pledge);
        self.state.add_initial_pledge(&pledge).unwrap();

        infos
    }

    /// Submits a proof for the given partitions of a deadline, skipping nothing.
    fn prove(&mut self, deadline_idx: u64, partitions: &[u64]) -> PoStResult {
        let mut deadlines = self.state.load_deadlines(&self.store).unwrap();
        let mut deadline = deadlines
            .load_deadline(&self.policy, &self.store, deadline_idx)
            .unwrap();

        let info =
            new_deadline_info(&self.policy, self.state.proving_period_start, deadline_idx, 0);
        let fault_expiration = info.last() + self.policy.fault_max_age;
        let sectors = Sectors::load(&self.store, &self.state.sectors).unwrap();
        let posts: Vec<_> = partitions
            .iter()
            .map(|&index| PoStPartition {
                index,
                skipped: BitField::new(),
            })
            .collect();

        let result = deadline
            .record_proven_sectors(
                &self.store,
                &sectors,
                SECTOR_SIZE,
                info.quant_spec(),
                fault_expiration,
                &posts,
            )
            .unwrap();

        deadlines
            .update_deadline(&self.policy, &self.store, deadline_idx, &deadline)
            .unwrap();
        self.state.save_deadlines(&self.store, deadlines).unwrap();
        result
    }

    /// Closes deadlines at their last epoch until the given one becomes current,
    /// wrapping into the next proving period if needed.
    fn advance_to(&mut self, deadline_idx: u64) {
        while self.state.current_deadline != deadline_idx {
            let last = self.state.deadline_info(&self.policy, 0).last();
            self.state
                .advance_deadline(&self.policy, &self.store, last)
                .unwrap();
        }
    }

    fn precommit(&mut self, sector_number: SectorNumber, deposit: u64, expiry: ChainEpoch) {
        self.state
            .allocate_sector_number(&self.store, sector_number)
            .unwrap();
        self.state
            .put_precommitted_sector(&self.store, precommit_info(sector_number, deposit))
            .unwrap();
        self.state
            .add_pre_commit_expiry(&self.policy, &self.store, expiry, sector_number)
            .unwrap();
        self.state.add_pre_commit_deposit(&tokens(deposit)).unwrap();
    }
}

fn precommit_info(sector_number: SectorNumber, deposit: u64) -> SectorPreCommitOnChainInfo {
    SectorPreCommitOnChainInfo {
        info: SectorPreCommitInfo {
            seal_proof: SEAL_PROOF,
            sector_number,
            sealed_cid: make_sealed_cid(format!("commR-{sector_number}").as_bytes()),
            seal_rand_epoch: PERIOD_START - 10,
            expiration: 10_000,
            ..Default::default()
        },
        pre_commit_deposit: tokens(deposit),
        pre_commit_epoch: PERIOD_START,
        deal_weight: DealWeight::from(0),
        verified_deal_weight: DealWeight::from(0),
    }
}

fn actor_error(err: anyhow::Error) -> ActorError {
    err.downcast::<ActorError>().unwrap()
}

#[test]
fn new_state_is_consistent() {
    let h = Harness::new();

    assert_eq!(PERIOD_START, h.state.proving_period_start);
    assert_eq!(0, h.state.current_deadline);
    assert!(h.state.is_debt_free());
    assert!(h.state.early_terminations.is_empty());

    let deadlines = h.state.load_deadlines(&h.store).unwrap();
    assert_eq!(h.policy.wpost_period_deadlines as usize, deadlines.due.len());

    h.assert_invariants(&TokenAmount::default());
}

#[test]
fn stores_miner_info() {
    let mut h = Harness::new();

    let mut info = h.state.get_info(&h.store).unwrap();
    assert_eq!(SECTOR_SIZE, info.sector_size);
    assert_eq!(Address::new_id(100), info.owner);

    info.peer_id = b"other".to_vec();
    h.state.save_info(&h.store, &info).unwrap();
    assert_eq!(b"other".to_vec(), h.state.get_info(&h.store).unwrap().peer_id);
}

mod sector_numbers {
    use super::*;

    #[test]
    fn allocates_each_number_once() {
        let mut h = Harness::new();

        h.state.allocate_sector_number(&h.store, 42).unwrap();
        h.state.allocate_sector_number(&h.store, 43).unwrap();

        let err = h.state.allocate_sector_number(&h.store, 42).unwrap_err();
        assert_eq!(ExitCode::USR_ILLEGAL_ARGUMENT, err.exit_code());
        assert!(err.msg().contains("already been allocated"));
    }

    #[test]
    fn rejects_numbers_out_of_range() {
        let mut h = Harness::new();

        h.state
            .allocate_sector_number(&h.store, MAX_SECTOR_NUMBER)
            .unwrap();
        let err = h
            .state
            .allocate_sector_number(&h.store, MAX_SECTOR_NUMBER + 1)
            .unwrap_err();
        assert_eq!(ExitCode::USR_ILLEGAL_ARGUMENT, err.exit_code());
    }

    #[test]
    fn masks_numbers() {
        let mut h = Harness::new();

        h.state
            .mask_sector_numbers(&h.store, &new_bitfield(&[0, 1, 2, 3, 4]))
            .unwrap();
        // masking overlapping ranges is allowed
        h.state
            .mask_sector_numbers(&h.store, &new_bitfield(&[3, 4, 5]))
            .unwrap();

        for n in 0..=5 {
            assert!(h.state.allocate_sector_number(&h.store, n).is_err());
        }
        h.state.allocate_sector_number(&h.store, 6).unwrap();
    }

    #[test]
    fn rejects_empty_or_oversized_masks() {
        let mut h = Harness::new();

        let err = h
            .state
            .mask_sector_numbers(&h.store, &BitField::new())
            .unwrap_err();
        assert!(err.msg().contains("invalid mask bitfield"));

        let err = h
            .state
            .mask_sector_numbers(&h.store, &new_bitfield(&[MAX_SECTOR_NUMBER + 1]))
            .unwrap_err();
        assert_eq!(ExitCode::USR_ILLEGAL_ARGUMENT, err.exit_code());
    }
}

mod precommits {
    use super::*;

    #[test]
    fn put_get_and_delete() {
        let mut h = Harness::new();
        h.precommit(1, 10, 500);
        h.precommit(2, 20, 500);

        let found = h.state.get_precommitted_sector(&h.store, 1).unwrap();
        assert_eq!(Some(precommit_info(1, 10)), found);
        assert_eq!(None, h.state.get_precommitted_sector(&h.store, 3).unwrap());

        // missing sectors are skipped
        let found = h
            .state
            .find_precommitted_sectors(&h.store, &[1, 3, 2])
            .unwrap();
        let numbers: Vec<_> = found.iter().map(|p| p.info.sector_number).collect();
        assert_eq!(vec![1, 2], numbers);

        h.assert_invariants(&tokens(30));

        h.state.delete_precommitted_sectors(&h.store, &[1]).unwrap();
        assert_eq!(None, h.state.get_precommitted_sector(&h.store, 1).unwrap());
        assert!(h.state.get_precommitted_sector(&h.store, 2).unwrap().is_some());
    }

    #[test]
    fn rejects_duplicate_precommit() {
        let mut h = Harness::new();
        h.precommit(1, 10, 500);

        let err = h
            .state
            .put_precommitted_sector(&h.store, precommit_info(1, 99))
            .unwrap_err();
        let err = actor_error(err);
        assert_eq!(ExitCode::USR_ILLEGAL_ARGUMENT, err.exit_code());
        assert!(err.msg().contains("already pre-committed"));

        // the original is untouched
        let found = h.state.get_precommitted_sector(&h.store, 1).unwrap();
        assert_eq!(Some(precommit_info(1, 10)), found);
    }

    #[test]
    fn deleting_missing_precommit_fails() {
        let mut h = Harness::new();
        h.precommit(1, 10, 500);

        let err = h
            .state
            .delete_precommitted_sectors(&h.store, &[1, 2])
            .unwrap_err();
        assert_eq!(ExitCode::USR_NOT_FOUND, actor_error(err).exit_code());
    }

    #[test]
    fn expires_precommits_at_quantized_epoch() {
        let mut h = Harness::new();

        // expiries quantize up to the end of a deadline window: 205 -> 210
        h.precommit(1, 10, 205);
        h.precommit(2, 20, 205);
        h.precommit(3, 40, 300);
        assert_eq!(tokens(70), h.state.pre_commit_deposits);

        // sector 2 is proven before it expires
        h.state.delete_precommitted_sectors(&h.store, &[2]).unwrap();
        h.state.add_pre_commit_deposit(&-tokens(20)).unwrap();

        let burnt = h
            .state
            .expire_pre_commits(&h.policy, &h.store, 209)
            .unwrap();
        assert!(burnt.is_zero());

        let burnt = h
            .state
            .expire_pre_commits(&h.policy, &h.store, 210)
            .unwrap();
        assert_eq!(tokens(10), burnt);
        assert_eq!(tokens(40), h.state.pre_commit_deposits);
        assert_eq!(None, h.state.get_precommitted_sector(&h.store, 1).unwrap());
        assert!(h.state.get_precommitted_sector(&h.store, 3).unwrap().is_some());

        h.assert_invariants(&tokens(40));

        let burnt = h
            .state
            .expire_pre_commits(&h.policy, &h.store, 1000)
            .unwrap();
        assert_eq!(tokens(40), burnt);
        assert!(h.state.pre_commit_deposits.is_zero());
        h.assert_invariants(&TokenAmount::default());
    }
}

mod sectors {
    use super::*;

    #[test]
    fn put_get_and_delete() {
        let mut h = Harness::new();
        let infos = vec![
            test_sector(1000, 3, 0, 0, 10),
            test_sector(1000, 1, 0, 0, 10),
            test_sector(1000, 7, 0, 0, 10),
        ];
        h.state.put_sectors(&h.store, infos.clone()).unwrap();

        assert!(h.state.has_sector_number(&h.store, 7).unwrap());
        assert!(!h.state.has_sector_number(&h.store, 2).unwrap());
        assert_eq!(Some(infos[0].clone()), h.state.get_sector(&h.store, 3).unwrap());

        let mut visited = Vec::new();
        h.state
            .for_each_sector(&h.store, |sector| {
                visited.push(sector.sector_number);
                Ok(())
            })
            .unwrap();
        assert_eq!(vec![1, 3, 7], visited);

        let loaded = h
            .state
            .load_sector_infos(&h.store, &new_bitfield(&[1, 7]))
            .unwrap();
        assert_eq!(vec![infos[1].clone(), infos[2].clone()], loaded);

        h.state
            .delete_sectors(&h.store, &new_bitfield(&[1, 3]))
            .unwrap();
        assert_eq!(None, h.state.get_sector(&h.store, 1).unwrap());
        assert!(h.state.has_sector_number(&h.store, 7).unwrap());
    }

    #[test]
    fn deleting_missing_sector_fails() {
        let mut h = Harness::new();
        h.state
            .put_sectors(&h.store, vec![test_sector(1000, 1, 0, 0, 10)])
            .unwrap();

        let err = h
            .state
            .delete_sectors(&h.store, &new_bitfield(&[2]))
            .unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn loading_missing_sector_infos_fails() {
        let mut h = Harness::new();
        h.state
            .put_sectors(&h.store, vec![test_sector(1000, 1, 0, 0, 10)])
            .unwrap();

        assert!(h
            .state
            .load_sector_infos(&h.store, &new_bitfield(&[1, 2]))
            .is_err());
    }
}

mod funds {
    use super::*;

    fn harness_with_vesting() -> Harness {
        let mut h = Harness::new();
        let vested = h
            .state
            .add_locked_funds(&h.store, PERIOD_START, &tokens(400), &VEST_SPEC)
            .unwrap();
        assert!(vested.is_zero());
        h
    }

    fn vesting_table(h: &Harness) -> Vec<(ChainEpoch, TokenAmount)> {
        h.state
            .load_vesting_funds(&h.store)
            .unwrap()
            .funds
            .into_iter()
            .map(|fund| (fund.epoch, fund.amount))
            .collect()
    }

    #[test]
    fn locked_funds_vest_linearly() {
        let h = harness_with_vesting();

        assert_eq!(tokens(400), h.state.locked_funds);
        assert_eq!(
            vec![
                (110, tokens(100)),
                (120, tokens(100)),
                (130, tokens(100)),
                (140, tokens(100)),
            ],
            vesting_table(&h)
        );
        h.assert_invariants(&tokens(400));
    }

    #[test]
    fn adding_locked_funds_unlocks_vested_funds_first() {
        let mut h = harness_with_vesting();

        let vested = h
            .state
            .add_locked_funds(&h.store, 121, &tokens(40), &VEST_SPEC)
            .unwrap();
        assert_eq!(tokens(200), vested);
        assert_eq!(tokens(240), h.state.locked_funds);
        h.assert_invariants(&tokens(240));
    }

    #[test]
    fn rejects_negative_vesting_sum() {
        let mut h = Harness::new();
        assert!(h
            .state
            .add_locked_funds(&h.store, PERIOD_START, &-tokens(1), &VEST_SPEC)
            .is_err());
    }

    #[test]
    fn unlocks_vested_funds() {
        let mut h = harness_with_vesting();

        // checking does not unlock anything
        assert_eq!(tokens(200), h.state.check_vested_funds(&h.store, 121).unwrap());
        assert_eq!(tokens(400), h.state.locked_funds);

        let unlocked = h.state.unlock_vested_funds(&h.store, 121).unwrap();
        assert_eq!(tokens(200), unlocked);
        assert_eq!(tokens(200), h.state.locked_funds);
        assert_eq!(vec![(130, tokens(100)), (140, tokens(100))], vesting_table(&h));

        // nothing more has vested
        assert!(h.state.unlock_vested_funds(&h.store, 121).unwrap().is_zero());
        h.assert_invariants(&tokens(200));
    }

    #[test]
    fn unlocks_unvested_funds_earliest_first() {
        let mut h = harness_with_vesting();

        let unlocked = h
            .state
            .unlock_unvested_funds(&h.store, 121, &tokens(150))
            .unwrap();
        assert_eq!(tokens(150), unlocked);
        assert_eq!(tokens(250), h.state.locked_funds);

        // the already vested entries are left alone
        assert_eq!(
            vec![(110, tokens(100)), (120, tokens(100)), (140, tokens(50))],
            vesting_table(&h)
        );
        h.assert_invariants(&tokens(250));
    }

    #[test]
    fn unlocking_more_than_is_locked_takes_everything() {
        let mut h = harness_with_vesting();

        let unlocked = h
            .state
            .unlock_unvested_funds(&h.store, PERIOD_START, &tokens(1000))
            .unwrap();
        assert_eq!(tokens(400), unlocked);
        assert!(h.state.locked_funds.is_zero());
        assert!(vesting_table(&h).is_empty());
    }

    #[test]
    fn penalties_accrue_as_debt() {
        let mut h = Harness::new();

        assert!(h.state.apply_penalty(&-tokens(1)).is_err());

        h.state.apply_penalty(&tokens(100)).unwrap();
        h.state.apply_penalty(&tokens(50)).unwrap();
        assert_eq!(tokens(150), h.state.fee_debt);
        assert!(!h.state.is_debt_free());
    }

    #[test]
    fn repays_debt_from_unlocked_balance() {
        let mut h = Harness::new();
        h.state.apply_penalty(&tokens(100)).unwrap();

        let err = h.state.repay_debts(&tokens(50)).unwrap_err();
        assert_eq!(ExitCode::USR_INSUFFICIENT_FUNDS, actor_error(err).exit_code());
        assert_eq!(tokens(100), h.state.fee_debt);

        let burnt = h.state.repay_debts(&tokens(150)).unwrap();
        assert_eq!(tokens(100), burnt);
        assert!(h.state.is_debt_free());
    }

    #[test]
    fn repays_partial_debt_from_vesting_then_balance() {
        let mut h = harness_with_vesting();
        h.state.apply_penalty(&tokens(430)).unwrap();

        // 50 of the 450 balance is unlocked
        let (from_vesting, from_balance) = h
            .state
            .repay_partial_debt_in_priority_order(&h.store, PERIOD_START, &tokens(450))
            .unwrap();
        assert_eq!(tokens(400), from_vesting);
        assert_eq!(tokens(30), from_balance);
        assert!(h.state.is_debt_free());
        assert!(h.state.locked_funds.is_zero());
    }

    #[test]
    fn partial_repayment_leaves_remaining_debt() {
        let mut h = harness_with_vesting();
        h.state.apply_penalty(&tokens(500)).unwrap();

        let (from_vesting, from_balance) = h
            .state
            .repay_partial_debt_in_priority_order(&h.store, PERIOD_START, &tokens(450))
            .unwrap();
        assert_eq!(tokens(400), from_vesting);
        assert_eq!(tokens(50), from_balance);
        assert_eq!(tokens(50), h.state.fee_debt);
    }

    #[test]
    fn computes_unlocked_and_available_balance() {
        let mut h = harness_with_vesting();
        h.state.add_pre_commit_deposit(&tokens(100)).unwrap();
        h.state.add_initial_pledge(&tokens(200)).unwrap();
        h.state.apply_penalty(&tokens(350)).unwrap();

        assert_eq!(tokens(300), h.state.get_unlocked_balance(&tokens(1000)).unwrap());
        // fee debt may push the available balance below zero
        assert_eq!(
            -tokens(50),
            h.state.get_available_balance(&tokens(1000)).unwrap()
        );

        assert!(h.state.get_unlocked_balance(&tokens(600)).is_err());
    }

    #[test]
    fn rejects_negative_totals() {
        let mut h = Harness::new();

        h.state.add_pre_commit_deposit(&tokens(10)).unwrap();
        assert!(h.state.add_pre_commit_deposit(&-tokens(11)).is_err());
        assert_eq!(tokens(10), h.state.pre_commit_deposits);

        h.state.add_initial_pledge(&tokens(10)).unwrap();
        assert!(h.state.add_initial_pledge(&-tokens(11)).is_err());
        assert_eq!(tokens(10), h.state.initial_pledge);
    }

    #[test]
    fn checks_balance_invariants() {
        let mut h = harness_with_vesting();
        h.state.add_pre_commit_deposit(&tokens(100)).unwrap();
        h.state.add_initial_pledge(&tokens(200)).unwrap();

        h.state.check_balance_invariants(&tokens(700)).unwrap();

        let err = h.state.check_balance_invariants(&tokens(699)).unwrap_err();
        assert_eq!(ERR_BALANCE_INVARIANTS_BROKEN, err.exit_code());

        h.state.fee_debt = -tokens(1);
        let err = h.state.check_balance_invariants(&tokens(700)).unwrap_err();
        assert_eq!(ERR_BALANCE_INVARIANTS_BROKEN, err.exit_code());
        assert!(err.msg().contains("fee debt is negative"));
    }

    #[test]
    fn invariant_check_reports_funds_drift() {
        let mut h = harness_with_vesting();
        h.assert_invariants(&tokens(1000));

        h.state.locked_funds = h.state.locked_funds.clone() + tokens(1);
        h.state.fee_debt = -tokens(1);

        let (_, acc) = check_state_invariants(&h.policy, &h.state, &h.store, &tokens(1000));
        acc.assert_expected(&[
            Regex::new("^miner fee debt is less than zero").unwrap(),
            Regex::new("^locked funds .+ is not sum of vesting table entries").unwrap(),
        ]);
    }
}

mod deadlines {
    use super::*;

    #[test]
    fn assigns_sectors_to_mutable_deadlines() {
        let mut h = Harness::new();
        h.add_sectors(1..=10, 10_000);

        // The first two deadlines are too close to be assigned at the period start.
        let deadlines = h.state.load_deadlines(&h.store).unwrap();
        let live: Vec<u64> = (0..6)
            .map(|idx| {
                deadlines
                    .load_deadline(&h.policy, &h.store, idx)
                    .unwrap()
                    .live_sectors
            })
            .collect();
        assert_eq!(vec![0, 0, 4, 4, 2, 0], live);

        assert_eq!((2, 0), h.state.find_sector(&h.policy, &h.store, 1).unwrap());
        assert_eq!((3, 0), h.state.find_sector(&h.policy, &h.store, 6).unwrap());
        assert_eq!((4, 0), h.state.find_sector(&h.policy, &h.store, 10).unwrap());
        let err = h.state.find_sector(&h.policy, &h.store, 99).unwrap_err();
        assert!(err.to_string().contains("not due at any deadline"));

        h.assert_invariants(&tokens(10_000));
    }

    #[test]
    fn checks_sector_health() {
        let mut h = Harness::new();
        h.add_sectors(1..=4, 10_000);
        h.prove(2, &[0]);

        h.state
            .check_sector_health(&h.policy, &h.store, 2, 0, 3)
            .unwrap();

        let err = h
            .state
            .check_sector_health(&h.policy, &h.store, 2, 0, 9)
            .unwrap_err();
        assert_eq!(ExitCode::USR_NOT_FOUND, actor_error(err).exit_code());

        // sector 3 is terminated
        let mut deadlines = h.state.load_deadlines(&h.store).unwrap();
        let mut deadline = deadlines.load_deadline(&h.policy, &h.store, 2).unwrap();
        let sectors = Sectors::load(&h.store, &h.state.sectors).unwrap();
        let mut to_terminate = PartitionSectorMap::default();
        to_terminate.add(0, new_bitfield(&[3])).unwrap();
        deadline
            .terminate_sectors(
                &h.policy,
                &h.store,
                &sectors,
                200,
                &to_terminate,
                SECTOR_SIZE,
                h.state.quant_spec_for_deadline(&h.policy, 2),
            )
            .unwrap();
        deadlines
            .update_deadline(&h.policy, &h.store, 2, &deadline)
            .unwrap();
        h.state.save_deadlines(&h.store, deadlines).unwrap();

        let err = h
            .state
            .check_sector_health(&h.policy, &h.store, 2, 0, 3)
            .unwrap_err();
        assert!(err.to_string().contains("is terminated"));
    }

    #[test]
    fn pops_early_terminations_across_calls() {
        let mut h = Harness::new();
        let policy = Policy::devnet();
        h.add_sectors(1..=4, 10_000);
        h.prove(2, &[0]);

        // nothing to do yet
        let (result, more) = h
            .state
            .pop_early_terminations(&policy, &h.store, 10, 10)
            .unwrap();
        assert!(result.sectors.is_empty());
        assert!(!more);

        let mut deadlines = h.state.load_deadlines(&h.store).unwrap();
        let mut deadline = deadlines.load_deadline(&policy, &h.store, 2).unwrap();
        let sectors = Sectors::load(&h.store, &h.state.sectors).unwrap();
        let mut to_terminate = PartitionSectorMap::default();
        to_terminate.add(0, new_bitfield(&[1, 2])).unwrap();
        let removed_power = deadline
            .terminate_sectors(
                &policy,
                &h.store,
                &sectors,
                200,
                &to_terminate,
                SECTOR_SIZE,
                h.state.quant_spec_for_deadline(&policy, 2),
            )
            .unwrap();
        assert_eq!(
            power_for_sectors(SECTOR_SIZE, &sectors.load_sector(&new_bitfield(&[1, 2])).unwrap()),
            removed_power
        );
        deadlines.update_deadline(&policy, &h.store, 2, &deadline).unwrap();
        h.state.save_deadlines(&h.store, deadlines).unwrap();
        h.state.early_terminations.set(2);

        let (result, more) = h
            .state
            .pop_early_terminations(&policy, &h.store, 10, 1)
            .unwrap();
        assert_bitfield_equals(&result.sectors[&200], &[1]);
        assert!(more);
        assert!(h.state.early_terminations.get(2));

        let (result, more) = h
            .state
            .pop_early_terminations(&policy, &h.store, 10, 10)
            .unwrap();
        assert_bitfield_equals(&result.sectors[&200], &[2]);
        assert!(!more);
        assert!(h.state.early_terminations.is_empty());
    }

    #[test]
    fn reschedules_sector_expirations_to_next_deadline_end() {
        let mut h = Harness::new();
        let sectors = h.add_sectors(1..=4, 10_000);
        h.prove(2, &[0]);

        let mut to_reschedule = DeadlineSectorMap::new();
        to_reschedule
            .add_values(&h.policy, 2, 0, &[1, 2])
            .unwrap();
        // a partition that doesn't exist is skipped
        to_reschedule
            .add_values(&h.policy, 2, 5, &[3])
            .unwrap();

        let replaced = h
            .state
            .reschedule_sector_expirations(&h.policy, &h.store, 200, SECTOR_SIZE, &to_reschedule)
            .unwrap();
        assert_eq!(sectors[0..2].to_vec(), replaced);

        // Deadline 2 next ends in the following proving period.
        let new_expiration = PERIOD_START + h.policy.wpost_proving_period + 29;
        let updated: Vec<_> = replaced
            .into_iter()
            .map(|mut sector| {
                sector.expiration = new_expiration;
                sector
            })
            .collect();
        h.state.put_sectors(&h.store, updated).unwrap();

        h.assert_invariants(&tokens(10_000));
    }
}

mod advance_deadline {
    use super::*;

    #[test]
    fn does_nothing_before_period_start() {
        let mut h = Harness::new();

        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, PERIOD_START - 1)
            .unwrap();
        assert_eq!(AdvanceDeadlineResult::default(), result);
        assert_eq!(0, h.state.current_deadline);
        assert_eq!(PERIOD_START, h.state.proving_period_start);
    }

    #[test]
    fn moves_to_next_deadline_and_wraps_the_period() {
        let mut h = Harness::new();

        let last = h.state.deadline_info(&h.policy, 0).last();
        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, last)
            .unwrap();
        assert_eq!(AdvanceDeadlineResult::default(), result);
        assert_eq!(1, h.state.current_deadline);

        h.advance_to(h.policy.wpost_period_deadlines - 1);
        assert_eq!(h.policy.wpost_period_deadlines - 1, h.state.current_deadline);
        assert_eq!(PERIOD_START, h.state.proving_period_start);

        let last = h.state.deadline_info(&h.policy, 0).last();
        h.state
            .advance_deadline(&h.policy, &h.store, last)
            .unwrap();
        assert_eq!(0, h.state.current_deadline);
        assert_eq!(
            PERIOD_START + h.policy.wpost_proving_period,
            h.state.proving_period_start
        );
        h.assert_invariants(&TokenAmount::default());
    }

    #[test]
    fn vests_funds_before_closing_the_deadline() {
        let mut h = Harness::new();
        h.state
            .add_locked_funds(&h.store, PERIOD_START, &tokens(400), &VEST_SPEC)
            .unwrap();

        // Nothing vests before epoch 110.
        h.advance_to(1);
        assert_eq!(tokens(400), h.state.locked_funds);

        // Closing deadline 1 at epoch 119 vests the first entry.
        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, 119)
            .unwrap();
        assert_eq!(-tokens(100), result.pledge_delta);
        assert_eq!(tokens(300), h.state.locked_funds);
        h.assert_invariants(&tokens(300));
    }

    #[test]
    fn missed_post_marks_unproven_sectors_faulty() {
        let mut h = Harness::new();
        let sectors = h.add_sectors(1..=4, 10_000);
        let all_power = power_for_sectors(SECTOR_SIZE, &sectors);

        h.advance_to(2);
        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, 129)
            .unwrap();

        // Unproven power was never active, so there is nothing to lose.
        assert!(result.power_delta.is_zero());
        assert!(result.pledge_delta.is_zero());
        assert!(result.previously_faulty_power.is_zero());
        assert_eq!(all_power, result.detected_faulty_power);
        assert_eq!(all_power, result.total_faulty_power);

        let err = h
            .state
            .check_sector_health(&h.policy, &h.store, 2, 0, 1)
            .unwrap_err();
        assert_eq!(ExitCode::USR_FORBIDDEN, actor_error(err).exit_code());

        h.assert_invariants(&tokens(4000));
    }

    #[test]
    fn missed_post_after_proving_loses_power() {
        let mut h = Harness::new();
        let sectors = h.add_sectors(1..=4, 10_000);
        let all_power = power_for_sectors(SECTOR_SIZE, &sectors);

        let post = h.prove(2, &[0]);
        assert_eq!(all_power, post.power_delta);
        assert!(post.penalty_power().is_zero());

        // Proven in the first period.
        h.advance_to(3);

        // Missed in the second.
        h.advance_to(2);
        assert_eq!(
            PERIOD_START + h.policy.wpost_proving_period,
            h.state.proving_period_start
        );
        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, 129 + h.policy.wpost_proving_period)
            .unwrap();

        assert_eq!(-all_power.clone(), result.power_delta);
        assert_eq!(all_power, result.detected_faulty_power);
        assert_eq!(all_power, result.total_faulty_power);
        h.assert_invariants(&tokens(4000));
    }

    #[test]
    fn expires_sectors_and_releases_pledge() {
        let mut h = Harness::new();

        // Expiration quantizes to the last epoch of deadline 2, 129.
        let sectors = h.add_sectors(1..=4, 125);
        let all_power = power_for_sectors(SECTOR_SIZE, &sectors);
        assert_eq!(tokens(4000), h.state.initial_pledge);
        h.prove(2, &[0]);

        h.advance_to(2);
        let result = h
            .state
            .advance_deadline(&h.policy, &h.store, 129)
            .unwrap();

        assert_eq!(-tokens(4000), result.pledge_delta);
        assert_eq!(-all_power, result.power_delta);
        assert!(result.detected_faulty_power.is_zero());
        assert!(h.state.initial_pledge.is_zero());
        assert!(h.state.early_terminations.is_empty());

        let deadline = h
            .state
            .load_deadlines(&h.store)
            .unwrap()
            .load_deadline(&h.policy, &h.store, 2)
            .unwrap();
        assert_eq!(0, deadline.live_sectors);
        assert_eq!(4, deadline.total_sectors);

        h.assert_invariants(&TokenAmount::default());
    }
}
