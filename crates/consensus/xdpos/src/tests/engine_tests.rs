//! Round state machine: proposals, votes, timeouts and commits.

use super::{authorize, outsider};
use crate::{
    config::V2RoundConfig,
    db::MemoryStore,
    errors::XDPoSError,
    signer::Signer,
    test_utils::{TestEnv, test_config},
    v2::{BftMessage, BlockInfo, SyncInfo, XDPoSV2Engine},
};
use alloc::sync::Arc;
use assert_matches::assert_matches;
use tokio::sync::broadcast;
use xdc_primitives::XdcBlockHeader;

fn drain(messages: &mut broadcast::Receiver<BftMessage>) -> Vec<BftMessage> {
    let mut drained = Vec::new();
    while let Ok(message) = messages.try_recv() {
        drained.push(message);
    }
    drained
}

#[test]
fn test_initial_at_switch_block() {
    let env = TestEnv::new(5);
    let switch = env.header(10);

    let state = env.engine.round_state();
    assert_eq!(state.current_round, 1);
    assert_eq!(state.highest_quorum_cert.proposed_block_info, BlockInfo::new(switch.hash_slow(), 0, 10));
    assert_eq!(state.highest_quorum_cert.gap_number, 5);
    assert!(state.lock_quorum_cert.is_none());
    assert!(state.highest_commit_block.is_none());

    let snapshot = env.engine.get_snapshot(env.chain.as_ref(), 5, true).unwrap();
    assert_eq!(snapshot.next_epoch_masternodes, env.addresses());

    env.engine.initial(env.chain.as_ref(), &switch).unwrap();
    assert_eq!(env.engine.round_state(), state);
}

#[test]
fn test_initial_from_v2_head() {
    let env = TestEnv::new(5);
    let blocks = env.extend(3);

    let engine = XDPoSV2Engine::new(test_config(), Arc::new(MemoryStore::new())).unwrap();
    engine.initial(env.chain.as_ref(), &blocks[2]).unwrap();

    let state = engine.round_state();
    assert_eq!(state.current_round, 3);
    assert_eq!(state.highest_quorum_cert.proposed_block_info, env.block_info(&blocks[1]));
    assert_eq!(state.lock_quorum_cert.unwrap().proposed_block_info, env.block_info(&blocks[0]));
    // started below the first gap block, so the first snapshot is seeded
    assert!(engine.get_snapshot(env.chain.as_ref(), 5, true).is_ok());
}

#[test]
fn test_proposal_vote_and_qc() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut messages = env.engine.subscribe();

    let block = env.extend(1).remove(0);
    let info = env.block_info(&block);
    env.engine.proposed_block_handler(env.chain.as_ref(), &block).unwrap();

    assert_eq!(env.engine.round_state().highest_voted_round, 1);
    let Ok(BftMessage::Vote(own)) = messages.try_recv() else { panic!("expected own vote") };
    assert_eq!(own.proposed_block_info, info);
    assert_eq!(own.gap_number, 5);
    assert_eq!(env.engine.vote_pool_size_faker(&own), 1);

    env.engine.vote_handler(env.chain.as_ref(), &env.vote(1, info, 5)).unwrap();
    assert_eq!(env.engine.current_round(), 1);
    env.engine.vote_handler(env.chain.as_ref(), &env.vote(2, info, 5)).unwrap();

    let state = env.engine.round_state();
    assert_eq!(state.current_round, 2);
    assert_eq!(state.highest_quorum_cert.proposed_block_info, info);
    assert_eq!(state.highest_quorum_cert.signatures.len(), 3);
    assert_eq!(state.lock_quorum_cert.unwrap().proposed_block_info.number, 10);
    assert_eq!(env.engine.vote_pool_size_faker(&own), 0);

    let signatures = &state.highest_quorum_cert.signatures;
    assert!(signatures.windows(2).all(|pair| pair[0] <= pair[1]));
    env.engine.verify_qc(env.chain.as_ref(), &state.highest_quorum_cert, None).unwrap();
}

#[test]
fn test_vote_with_mismatched_block_info_is_rejected() {
    let env = TestEnv::new(5);
    let chain = env.chain.as_ref();
    let block = env.extend(1).remove(0);
    let start = env.engine.round_state();

    let wrong_number = BlockInfo::new(block.hash_slow(), 1, 18);
    for index in 0..3 {
        assert_matches!(
            env.engine.vote_handler(chain, &env.vote(index, wrong_number, 5)),
            Err(XDPoSError::BlockInfo(_))
        );
    }
    let wrong_round = BlockInfo::new(block.hash_slow(), 2, 11);
    for index in 0..3 {
        assert_matches!(
            env.engine.vote_handler(chain, &env.vote(index, wrong_round, 5)),
            Err(XDPoSError::BlockInfo(_))
        );
    }
    assert_eq!(env.engine.vote_pool_size_faker(&env.vote(0, wrong_number, 5)), 0);
    assert_eq!(env.engine.round_state(), start);

    assert_matches!(
        env.engine.verify_vote_message(chain, &env.vote(3, wrong_number, 5)),
        Err(XDPoSError::BlockInfo(_))
    );

    // honest votes for the same block still form a QC
    let info = env.block_info(&block);
    assert!(env.engine.verify_vote_message(chain, &env.vote(3, info, 5)).unwrap());
    for index in 0..3 {
        env.engine.vote_handler(chain, &env.vote(index, info, 5)).unwrap();
    }
    assert_eq!(env.engine.round_state().highest_quorum_cert.proposed_block_info, info);
    assert_eq!(env.engine.current_round(), 2);
}

#[test]
fn test_votes_once_per_round() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut messages = env.engine.subscribe();

    let block = env.extend(1).remove(0);
    env.engine.proposed_block_handler(env.chain.as_ref(), &block).unwrap();
    assert_eq!(drain(&mut messages).len(), 1);

    env.engine.proposed_block_handler(env.chain.as_ref(), &block).unwrap();
    assert!(drain(&mut messages).is_empty());
}

#[test]
fn test_no_vote_in_already_voted_round() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut messages = env.engine.subscribe();
    env.engine.set_highest_voted_round_faker(1);

    let block = env.extend(1).remove(0);
    env.engine.proposed_block_handler(env.chain.as_ref(), &block).unwrap();
    assert!(drain(&mut messages).is_empty());
    assert_eq!(env.engine.round_state().highest_voted_round, 1);

    // the QC carried by the next block opens round 2
    let next = env.build_block(&block, 2);
    env.insert(next.clone());
    env.engine.proposed_block_handler(env.chain.as_ref(), &next).unwrap();
    assert_matches!(
        drain(&mut messages).as_slice(),
        [BftMessage::Vote(vote)] if vote.proposed_block_info.round == 2
    );
}

#[test]
fn test_non_masternode_does_not_vote() {
    let env = TestEnv::new(5);
    let blocks = env.extend(2);

    assert_matches!(
        env.engine.proposed_block_handler(env.chain.as_ref(), &blocks[1]),
        Err(XDPoSError::NoSigner)
    );

    env.engine.authorize(outsider());
    assert_matches!(
        env.engine.proposed_block_handler(env.chain.as_ref(), &blocks[1]),
        Err(XDPoSError::NotInMasternodeList("vote"))
    );
    // the carried QC is still adopted
    assert_eq!(env.engine.current_round(), 2);
    assert_eq!(env.engine.round_state().highest_voted_round, 0);
}

#[test]
fn test_voting_rule_respects_lock() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let blocks = env.extend_with_rounds(&[1, 2]);

    env.engine.set_lock_qc_faker(Some(env.qc_for(&blocks[1])));
    env.engine.set_new_round_faker(3);

    // a round 3 fork of block 11 carries an older QC than the lock
    let fork = env.build_block(&blocks[0], 3);
    env.chain.insert_fork(fork.clone());
    env.engine.proposed_block_handler(env.chain.as_ref(), &fork).unwrap();
    assert_eq!(env.engine.round_state().highest_voted_round, 0);

    // extending the locked block is fine
    let extension = env.build_block(&blocks[1], 3);
    env.insert(extension.clone());
    env.engine.proposed_block_handler(env.chain.as_ref(), &extension).unwrap();
    assert_eq!(env.engine.round_state().highest_voted_round, 3);
}

#[test]
fn test_commit_three_consecutive_rounds() {
    let env = TestEnv::new(5);
    let blocks = env.extend_with_rounds(&[1, 2, 3, 4]);

    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&blocks[3])).unwrap();

    let state = env.engine.round_state();
    assert_eq!(state.current_round, 5);
    assert_eq!(state.highest_commit_block, Some(env.block_info(&blocks[1])));
    assert_eq!(state.lock_quorum_cert.unwrap().proposed_block_info, env.block_info(&blocks[2]));

    let committed = env.engine.forensics.highest_committed_qcs().unwrap();
    assert_eq!(committed[2].proposed_block_info, env.block_info(&blocks[3]));
    assert_eq!(committed[0].proposed_block_info, env.block_info(&blocks[1]));
}

#[test]
fn test_no_commit_across_round_gap() {
    let env = TestEnv::new(5);
    let blocks = env.extend_with_rounds(&[1, 2, 4, 5]);

    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&blocks[2])).unwrap();
    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&blocks[3])).unwrap();
    assert!(env.engine.round_state().highest_commit_block.is_none());

    let next = env.extend_with_rounds(&[6]).remove(0);
    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&next)).unwrap();
    assert_eq!(env.engine.round_state().highest_commit_block, Some(env.block_info(&blocks[2])));
}

#[test]
fn test_old_qc_keeps_round() {
    let env = TestEnv::new(5);
    let blocks = env.extend(3);
    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&blocks[2])).unwrap();
    assert_eq!(env.engine.current_round(), 4);

    env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&blocks[0])).unwrap();
    let state = env.engine.round_state();
    assert_eq!(state.current_round, 4);
    assert_eq!(state.highest_quorum_cert.round(), 3);
}

#[test]
fn test_qc_for_unknown_block() {
    let env = TestEnv::new(5);
    let block = env.build_block(&env.header(10), 1);
    assert_matches!(
        env.engine.process_qc(env.chain.as_ref(), &env.qc_for(&block)),
        Err(XDPoSError::UnknownBlock)
    );
}

#[test]
fn test_timeouts_form_tc() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut messages = env.engine.subscribe();

    env.engine.on_countdown_timeout(env.chain.as_ref(), 1).unwrap();
    let Ok(BftMessage::Timeout(own)) = messages.try_recv() else { panic!("expected own timeout") };
    assert_eq!((own.round, own.gap_number), (1, 5));
    assert_eq!(env.engine.round_state().timeout_count, 1);
    assert_eq!(env.engine.timeout_pool_size_faker(&own), 1);

    env.engine.timeout_handler(env.chain.as_ref(), &env.timeout(1, 1, 5)).unwrap();
    env.engine.timeout_handler(env.chain.as_ref(), &env.timeout(2, 1, 5)).unwrap();

    let state = env.engine.round_state();
    assert_eq!(state.current_round, 2);
    assert_eq!(state.highest_timeout_cert.round, 1);
    assert_eq!(state.highest_timeout_cert.signatures.len(), 3);
    assert_eq!(state.timeout_count, 0);
    assert_eq!(env.engine.timeout_pool_size_faker(&own), 0);

    let tc = env.engine.sync_info().highest_timeout_cert.unwrap();
    env.engine.verify_tc(env.chain.as_ref(), &tc).unwrap();
    assert!(drain(&mut messages).iter().any(|message| matches!(message, BftMessage::SyncInfo(_))));
}

#[test]
fn test_stale_countdown_is_ignored() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    env.engine.on_countdown_timeout(env.chain.as_ref(), 7).unwrap();
    assert_eq!(env.engine.round_state().timeout_count, 0);
}

#[test]
fn test_countdown_needs_masternode() {
    let env = TestEnv::new(5);
    env.engine.authorize(outsider());
    assert_matches!(
        env.engine.on_countdown_timeout(env.chain.as_ref(), 1),
        Err(XDPoSError::NotInMasternodeList("timeout"))
    );
}

#[test]
fn test_sync_info_after_repeated_timeouts() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut messages = env.engine.subscribe();

    for _ in 0..3 {
        env.engine.on_countdown_timeout(env.chain.as_ref(), 1).unwrap();
    }

    let sent = drain(&mut messages);
    let timeouts = sent.iter().filter(|message| matches!(message, BftMessage::Timeout(_))).count();
    let sync_infos = sent.iter().filter(|message| matches!(message, BftMessage::SyncInfo(_))).count();
    assert_eq!((timeouts, sync_infos), (3, 1));
    assert_eq!(env.engine.round_state().timeout_count, 3);
    // a lone signer never reaches a TC
    assert_eq!(env.engine.current_round(), 1);
}

#[test]
fn test_message_round_checks() {
    let env = TestEnv::new(5);
    let block = env.extend(1).remove(0);

    assert_matches!(
        env.engine.timeout_handler(env.chain.as_ref(), &env.timeout(1, 4, 5)),
        Err(XDPoSError::IncomingMessageRoundNotEqualCurrentRound { kind: "timeout", incoming_round: 4, current_round: 1 })
    );

    let far = BlockInfo::new(block.hash_slow(), 5, block.number);
    assert_matches!(
        env.engine.vote_handler(env.chain.as_ref(), &env.vote(1, far, 5)),
        Err(XDPoSError::IncomingMessageRoundTooFarFromCurrentRound { kind: "vote", .. })
    );

    // one round ahead is accepted and pooled
    let ahead = BlockInfo::new(block.hash_slow(), 2, block.number);
    let vote = env.vote(1, ahead, 5);
    env.engine.vote_handler(env.chain.as_ref(), &vote).unwrap();
    assert_eq!(env.engine.vote_pool_size_faker(&vote), 1);
}

#[test]
fn test_sync_info_handler() {
    let env = TestEnv::new(5);
    let blocks = env.extend(3);
    let sync_info =
        SyncInfo { highest_quorum_cert: env.qc_for(&blocks[2]), highest_timeout_cert: Some(env.sign_tc(5, 5, 3)) };

    assert!(env.engine.verify_sync_info_message(env.chain.as_ref(), &sync_info).unwrap());
    env.engine.sync_info_handler(env.chain.as_ref(), &sync_info).unwrap();

    let state = env.engine.round_state();
    assert_eq!(state.current_round, 6);
    assert_eq!(state.highest_quorum_cert.round(), 3);
    assert_eq!(state.highest_timeout_cert.round, 5);
    assert_eq!(state.highest_commit_block, Some(env.block_info(&blocks[0])));

    assert!(!env.engine.verify_sync_info_message(env.chain.as_ref(), &sync_info).unwrap());
    assert_eq!(env.engine.sync_info(), sync_info);
}

#[test]
fn test_sync_info_without_tc() {
    let env = TestEnv::new(5);
    assert!(env.engine.sync_info().highest_timeout_cert.is_none());
}

#[test]
fn test_buffered_votes_form_qc_when_block_arrives() {
    let env = TestEnv::new(5);
    let block = env.build_block(&env.header(10), 1);
    let info = env.block_info(&block);

    for index in 1..4 {
        env.engine.vote_handler(env.chain.as_ref(), &env.vote(index, info, 5)).unwrap();
    }
    assert_eq!(env.engine.vote_pool_size_faker(&env.vote(1, info, 5)), 3);
    assert_eq!(env.engine.current_round(), 1);

    env.insert(block.clone());
    assert_matches!(
        env.engine.proposed_block_handler(env.chain.as_ref(), &block),
        Err(XDPoSError::NoSigner)
    );
    let state = env.engine.round_state();
    assert_eq!(state.current_round, 2);
    assert_eq!(state.highest_quorum_cert.proposed_block_info, info);
}

#[test]
fn test_hygiene_drops_old_rounds() {
    let env = TestEnv::new(5);
    let block = env.build_block(&env.header(10), 1);
    let vote = env.vote(1, env.block_info(&block), 5);
    env.engine.vote_handler(env.chain.as_ref(), &vote).unwrap();

    env.engine.hygiene_pools();
    assert_eq!(env.engine.vote_pool_size_faker(&vote), 1);

    env.engine.set_new_round_faker(20);
    env.engine.hygiene_pools();
    assert_eq!(env.engine.vote_pool_size_faker(&vote), 0);
}

#[test]
fn test_prepare_and_seal() {
    let env = TestEnv::new(5);
    authorize(&env, 1);
    let address = env.signers[1].address();
    let parent = env.header(10);

    let mut header = XdcBlockHeader {
        number: 11,
        parent_hash: parent.hash_slow(),
        beneficiary: address,
        ..Default::default()
    };
    env.engine.prepare(env.chain.as_ref(), &mut header).unwrap();
    env.engine.seal(&mut header).unwrap();

    let (qc, round, masternodes) = env.engine.extra_fields(&header).unwrap();
    assert_eq!(round, 1);
    assert_eq!(qc.unwrap().proposed_block_info.hash, parent.hash_slow());
    assert_eq!(masternodes, env.addresses());
    assert!(header.timestamp >= parent.timestamp + 2);
    assert_eq!(env.engine.author(&header).unwrap(), address);
    env.engine.verify_header(env.chain.as_ref(), &header, true).unwrap();
}

#[test]
fn test_prepare_requires_highest_qc_parent() {
    let env = TestEnv::new(5);
    authorize(&env, 0);
    let mut header =
        XdcBlockHeader { number: 10, parent_hash: env.header(9).hash_slow(), ..Default::default() };
    assert_matches!(
        env.engine.prepare(env.chain.as_ref(), &mut header),
        Err(XDPoSError::NotReadyToPropose { .. })
    );
}

#[test]
fn test_seal_needs_signer() {
    let env = TestEnv::new(5);
    let mut header = XdcBlockHeader { number: 11, ..Default::default() };
    assert_matches!(env.engine.seal(&mut header), Err(XDPoSError::NoSigner));
}

#[test]
fn test_your_turn() {
    let env = TestEnv::new(5);
    let parent = env.header(10);
    let addresses = env.addresses();

    // round 1 leader is masternodes[1 % 10 % 5]
    assert!(env.engine.your_turn(env.chain.as_ref(), &parent, addresses[1]).unwrap());
    assert!(!env.engine.your_turn(env.chain.as_ref(), &parent, addresses[0]).unwrap());
    assert!(!env.engine.your_turn(env.chain.as_ref(), &parent, outsider().address()).unwrap());
}

/// Certificates need 60% up to round 4 and 80% from round 5
fn threshold_switch_env() -> TestEnv {
    let mut config = test_config();
    config.v2 = config.v2.map(|v2| {
        v2.with_round_config(
            V2RoundConfig::default().with_switch_round(5).with_cert_threshold(80).with_max_masternodes(5),
        )
    });
    TestEnv::with_engine(config, 5, |engine| engine)
}

#[test]
fn test_params_follow_block_round() {
    let env = threshold_switch_env();
    assert_eq!(env.engine.params().cert_threshold, 60);

    env.extend(4);
    assert_eq!(env.engine.params().cert_threshold, 60);

    env.extend(1);
    let params = env.engine.params();
    assert_eq!((params.switch_round, params.cert_threshold), (5, 80));
    assert_eq!(env.threshold(), 4);
}

#[test]
fn test_certificates_keep_threshold_of_their_round() {
    let env = threshold_switch_env();
    let chain = env.chain.as_ref();
    let first = env.extend(1).remove(0);
    let early_qc = env.sign_qc(env.block_info(&first), 5, 3);
    env.engine.verify_qc(chain, &early_qc, None).unwrap();
    let early_tc = env.sign_tc(2, 5, 3);
    env.engine.verify_tc(chain, &early_tc).unwrap();

    let blocks = env.extend(5);
    assert_eq!(env.engine.params().cert_threshold, 80);
    env.engine.verify_qc(chain, &early_qc, None).unwrap();
    env.engine.verify_tc(chain, &early_tc).unwrap();
    // block 12 carries the three-signature QC of round 1
    env.engine.verify_header(chain, &blocks[0], true).unwrap();

    let round_five = env.block_info(&blocks[3]);
    assert_eq!(round_five.round, 5);
    assert_matches!(
        env.engine.verify_qc(chain, &env.sign_qc(round_five, 5, 3), None),
        Err(XDPoSError::InvalidQC(_))
    );
    env.engine.verify_qc(chain, &env.sign_qc(round_five, 5, 4), None).unwrap();
    assert_matches!(env.engine.verify_tc(chain, &env.sign_tc(6, 5, 3)), Err(XDPoSError::InvalidTC(_)));
}

#[test]
fn test_epoch_switch_detection() {
    let env = TestEnv::new(5);
    let blocks = env.extend(10);
    let chain = env.chain.as_ref();
    let (first, last) = (&blocks[0], &blocks[9]);

    assert_eq!(env.engine.is_epoch_switch(first).unwrap(), (true, 1));
    assert_eq!(env.engine.is_epoch_switch(&blocks[1]).unwrap(), (false, 1));
    assert_eq!(env.engine.is_epoch_switch(last).unwrap(), (true, 2));

    assert_eq!(env.engine.is_epoch_switch_at_round(10, &blocks[8]).unwrap(), (true, 2));
    assert_eq!(env.engine.is_epoch_switch_at_round(11, last).unwrap(), (false, 2));
    assert!(!env.engine.is_epoch_switch_at_round(5, &blocks[8]).unwrap().0);

    assert_eq!(env.engine.current_epoch_switch_block(chain, 19).unwrap(), (11, 1));
    assert_eq!(env.engine.current_epoch_switch_block(chain, 20).unwrap(), (20, 2));
    assert_eq!(env.engine.masternodes_by_hash(chain, last.hash_slow()).unwrap(), env.addresses());

    let info = env.engine.epoch_switch_info(chain, None, last.hash_slow()).unwrap();
    assert_eq!(info.epoch_switch_block_info, env.block_info(last));
    assert_eq!(info.epoch_switch_parent_block_info, Some(env.block_info(&blocks[8])));

    let previous = env.engine.previous_epoch_switch_info_by_hash(chain, last.hash_slow(), 1).unwrap();
    assert_eq!(previous.epoch_switch_block_info.number, 11);
    let oldest = env.engine.previous_epoch_switch_info_by_hash(chain, last.hash_slow(), 5).unwrap();
    assert_eq!(oldest.epoch_switch_block_info.number, 10);
    assert!(oldest.epoch_switch_parent_block_info.is_none());
}

#[test]
fn test_epoch_switch_after_missed_rounds() {
    let env = TestEnv::new(5);
    let blocks = env.extend_with_rounds(&[1, 2, 3, 12]);
    assert_eq!(env.engine.is_epoch_switch(&blocks[3]).unwrap(), (true, 2));
    assert_eq!(blocks[3].validator_addresses(), env.addresses());
    env.engine.verify_header(env.chain.as_ref(), &blocks[3], true).unwrap();
}

#[test]
fn test_snapshot_at_gap_block() {
    let env = TestEnv::new(5);
    env.extend(5);

    let gap = env.header(15);
    // blocks of the epoch starting at 20 use the snapshot taken at 15
    let snapshot = env.engine.get_snapshot(env.chain.as_ref(), 20, false).unwrap();
    assert_eq!(snapshot.hash, gap.hash_slow());
    assert_eq!(snapshot.next_epoch_masternodes, env.addresses());
    assert_eq!(snapshot.next_epoch_candidates, env.addresses());
    assert_eq!(env.engine.get_snapshot(env.chain.as_ref(), 19, false).unwrap().number, 5);

    assert_matches!(
        env.engine.get_snapshot(env.chain.as_ref(), 25, true),
        Err(XDPoSError::SnapshotNotFound(_))
    );
}
