//! Penalty and reward hooks, and version dispatch.

use crate::{
    adaptor::{ConsensusEngine, XDPoS},
    chain::{ChainReader, RewardState},
    config::XDPoSConfig,
    errors::XDPoSError,
    hooks::{EpochRewardHook, PenaltyHook, SigningPenaltyHook},
    signer::Signer,
    test_utils::{MockCandidates, TestEnv, signing_tx, test_candidates, test_config, test_signers},
};
use alloc::{collections::BTreeMap, sync::Arc};
use alloy_primitives::{Address, B256, U256};
use assert_matches::assert_matches;
use std::collections::HashMap;

fn penalty_env() -> TestEnv {
    TestEnv::with_engine(test_config(), 5, |engine| {
        engine.with_penalty_hook(Arc::new(SigningPenaltyHook))
    })
}

fn reward_env(config: XDPoSConfig) -> (TestEnv, Address) {
    let owner = Address::with_last_byte(0xa0);
    let signers = test_signers(5);
    let candidates = MockCandidates {
        candidates: test_candidates(&signers),
        owners: HashMap::from([(signers[0].address(), owner)]),
    };
    let hook = Arc::new(EpochRewardHook::new(Arc::new(candidates)));
    let env = TestEnv::with_engine(config, 5, |engine| engine.with_reward_hook(hook));
    (env, owner)
}

/// Signing transactions from the first `signers` masternodes for `signed`,
/// included in the block `carrier`
fn attach_signing_txs(env: &TestEnv, carrier: u64, signed: u64, signers: usize) {
    let signed = env.header(signed);
    let txs = env.addresses()[..signers]
        .iter()
        .map(|signer| signing_tx(*signer, signed.number, signed.hash_slow()))
        .collect();
    env.chain.set_transactions(env.header(carrier).hash_slow(), txs);
}

#[test]
fn test_silent_masternode_is_penalized() {
    let env = penalty_env();
    env.extend(5);
    attach_signing_txs(&env, 15, 15, 4);

    let switch = env.extend(5).remove(4);
    let addresses = env.addresses();
    assert_eq!(switch.number, 20);
    assert_eq!(switch.penalty_addresses(), vec![addresses[4]]);
    assert_eq!(switch.validator_addresses(), addresses[..4].to_vec());
    env.engine.verify_header(env.chain.as_ref(), &switch, true).unwrap();

    // the next epoch runs on the remaining four
    let next = env.extend(1).remove(0);
    assert_eq!(env.engine.masternodes(env.chain.as_ref(), &next), addresses[..4].to_vec());
}

#[test]
fn test_penalty_comeback_window() {
    let mut config = test_config();
    config.limit_penalty_epoch = 0;
    let env = TestEnv::with_engine(config, 5, |engine| {
        engine.with_penalty_hook(Arc::new(SigningPenaltyHook))
    });
    assert_eq!(SigningPenaltyHook::comeback_start(&env.engine), 20);
    assert_eq!(SigningPenaltyHook::comeback_start(&penalty_env().engine), 60);

    env.extend(5);
    attach_signing_txs(&env, 15, 15, 4);
    let addresses = env.addresses();
    let first = env.extend(5).remove(4);
    assert_eq!(first.penalty_addresses(), vec![addresses[4]]);

    // block 30 is past the window, so the silent candidate stays out
    let second = env.extend(10).remove(9);
    assert_eq!(second.number, 30);
    assert_eq!(second.penalty_addresses(), vec![addresses[4]]);
    assert_eq!(second.validator_addresses(), addresses[..4].to_vec());
}

#[test]
fn test_penalty_returns_inside_comeback_window() {
    let env = penalty_env();
    env.extend(5);
    attach_signing_txs(&env, 15, 15, 4);
    env.extend(5);

    let second = env.extend(10).remove(9);
    assert!(second.penalty_addresses().is_empty());
    assert_eq!(second.validator_addresses(), env.addresses());
}

#[test]
fn test_penalty_without_signing_txs() {
    let env = TestEnv::new(5);
    let blocks = env.extend(9);
    let parent = &blocks[8];

    let penalties = SigningPenaltyHook
        .hook_penalty(env.chain.as_ref(), &env.engine, 20, parent.hash_slow(), &env.addresses())
        .unwrap();
    assert_eq!(penalties, env.addresses());
}

#[test]
fn test_signing_outside_sampled_blocks_does_not_count() {
    let env = TestEnv::new(5);
    let blocks = env.extend(9);
    // block 16 is not sampled
    attach_signing_txs(&env, 17, 16, 5);

    let penalties = SigningPenaltyHook
        .hook_penalty(env.chain.as_ref(), &env.engine, 20, blocks[8].hash_slow(), &env.addresses())
        .unwrap();
    assert_eq!(penalties.len(), 5);
}

#[test]
fn test_penalty_needs_ancestors() {
    let env = TestEnv::new(5);
    assert_matches!(
        SigningPenaltyHook.hook_penalty(
            env.chain.as_ref(),
            &env.engine,
            20,
            B256::with_last_byte(1),
            &env.addresses()
        ),
        Err(XDPoSError::UnknownAncestor)
    );
}

#[test]
fn test_epoch_rewards() {
    let (env, owner) = reward_env(test_config());
    env.extend(6);
    attach_signing_txs(&env, 16, 15, 3);
    let blocks = env.extend(14);
    let chain = env.chain.as_ref();
    let addresses = env.addresses();
    let foundation = env.engine.config().foundation_wallet;

    let mut switch = blocks[13].clone();
    assert_eq!(switch.number, 30);
    let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
    let distribution = env.engine.finalize(chain, &mut switch, &mut balances).unwrap().unwrap();

    assert_eq!(distribution.masternodes.signers.len(), 3);
    assert_eq!(distribution.masternodes.signers[&addresses[1]].sign, 1);
    assert_eq!(distribution.masternodes.signers[&addresses[1]].reward, U256::from(1_000));
    assert_eq!(balances[&owner], U256::from(900));
    assert_eq!(balances[&addresses[1]], U256::from(900));
    assert_eq!(balances[&addresses[2]], U256::from(900));
    assert_eq!(balances[&foundation], U256::from(300));
    assert!(!balances.contains_key(&addresses[0]));
    assert!(!balances.contains_key(&addresses[3]));
    assert_eq!(distribution.total(), U256::from(3_000));
    assert!(distribution.protectors.is_empty());
}

#[test]
fn test_rewards_only_at_epoch_switch() {
    let (env, _) = reward_env(test_config());
    env.extend(15);
    let chain = env.chain.as_ref();
    let mut balances: BTreeMap<Address, U256> = BTreeMap::new();

    // the first v2 epoch has no finished epoch before it
    let mut first_switch = env.header(20);
    let rewards = env.engine.finalize(chain, &mut first_switch, &mut balances).unwrap();
    assert!(rewards.is_some_and(|rewards| rewards.is_empty()));

    let mut plain = env.header(25);
    assert!(env.engine.finalize(chain, &mut plain, &mut balances).unwrap().is_none());
    assert!(balances.is_empty());
}

#[test]
fn test_rewards_stored_to_folder() {
    let folder = tempfile::tempdir().unwrap();
    let (env, _) = reward_env(test_config().with_store_reward_folder(folder.path()));
    env.extend(6);
    attach_signing_txs(&env, 16, 15, 3);
    env.extend(14);

    let mut switch = env.header(30);
    let path = folder.path().join(format!("30.{}", switch.hash_slow()));
    let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
    env.engine.finalize(env.chain.as_ref(), &mut switch, &mut balances).unwrap();

    let stored: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(stored["masternodes"]["signers"].as_object().unwrap().len(), 3);
}

#[test]
fn test_rewards_need_foundation_wallet() {
    let (env, _) = reward_env(test_config().with_foundation_wallet(Address::ZERO));
    env.extend(10);
    let mut switch = env.header(20);
    let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
    assert_matches!(
        env.engine.finalize(env.chain.as_ref(), &mut switch, &mut balances),
        Err(XDPoSError::Initialization(_))
    );
}

#[derive(Default)]
struct Recorded(Vec<(Address, U256)>);

impl RewardState for Recorded {
    fn add_balance(&mut self, address: Address, amount: U256) {
        self.0.push((address, amount));
    }
}

#[test]
fn test_dispatch_by_version() {
    let env = TestEnv::new(5);
    let xdpos = XDPoS::from_parts(env.engine.config().clone(), Arc::clone(&env.engine));
    let chain: &dyn ChainReader = env.chain.as_ref();

    let v1_block = env.header(5);
    xdpos.verify_header(chain, &v1_block, true).unwrap();
    assert_eq!(xdpos.author(&v1_block).unwrap(), env.addresses()[0]);

    let v2_block = env.extend(1).remove(0);
    xdpos.verify_header(chain, &v2_block, true).unwrap();
    assert_eq!(xdpos.author(&v2_block).unwrap(), env.addresses()[1]);

    let mut state = Recorded::default();
    let mut header = v1_block;
    assert!(xdpos.finalize(chain, &mut header, &mut state).unwrap().is_none());
    assert!(state.0.is_empty());
}
