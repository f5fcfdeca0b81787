//! Consensus message handling.
//!
//! Incoming proposals, votes, timeouts and sync info drive the round state.
//! Votes and timeouts the engine produces itself go through the same
//! handlers before they are broadcast.

use super::{
    BftMessage, BlockInfo, Round, SyncInfo, Timeout, TimeoutCert, TimeoutForSign, Vote,
    VoteForSign, XDPoSV2Engine,
    engine::RoundState,
    pool::POOL_HYGIENE_ROUND,
    types::{timeout_sig_hash, vote_sig_hash},
    verification::cert_threshold_count,
};
use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    signer::recover_signer,
};
use alloc::{string::String, vec::Vec};
use tracing::{debug, info, trace, warn};
use xdc_primitives::XdcBlockHeader;

impl XDPoSV2Engine {
    /// Handle a proposed block: adopt its QC and vote for it when allowed.
    pub fn proposed_block_handler(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<()> {
        let fields = self.decode_v2_extra(header)?;
        let qc = fields.quorum_cert;
        self.verify_qc(chain, &qc, None)?;

        let block_info = BlockInfo::new(header.hash_slow(), fields.round, header.number);
        let mut state = self.round_state.lock();
        self.process_qc_locked(chain, &mut state, &qc)?;

        let allowed = self.allowed_to_send(chain, header, "vote");
        if allowed.is_ok() {
            if self.verify_voting_rule(chain, &state, &block_info, &qc)? {
                self.send_vote(chain, &mut state, block_info)?;
            } else {
                debug!(
                    target: "consensus::xdpos",
                    round = block_info.round,
                    current_round = state.current_round,
                    "Voting rule not satisfied"
                );
            }
        }

        self.form_buffered_qcs(chain, &mut state, &block_info)?;
        allowed
    }

    /// Build QCs from votes that arrived before the block they vote for.
    fn form_buffered_qcs(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        block_info: &BlockInfo,
    ) -> XDPoSResult<()> {
        let mut pending: Vec<(String, Vote)> = Vec::new();
        for (key, _, vote) in state.vote_pool.iter() {
            if vote.proposed_block_info == *block_info && !pending.iter().any(|(k, _)| k == key) {
                pending.push((key.into(), vote.clone()));
            }
        }
        for (key, vote) in pending {
            self.try_form_qc(chain, state, &key, &vote)?;
        }
        Ok(())
    }

    /// Collect a vote and build a QC once enough masternodes voted for the same block.
    pub fn vote_handler(&self, chain: &dyn ChainReader, vote: &Vote) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        self.vote_handler_locked(chain, &mut state, vote)
    }

    pub(crate) fn vote_handler_locked(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        vote: &Vote,
    ) -> XDPoSResult<()> {
        let round = vote.proposed_block_info.round;
        if round != state.current_round && round != state.current_round + 1 {
            return Err(XDPoSError::IncomingMessageRoundTooFarFromCurrentRound {
                kind: "vote",
                incoming_round: round,
                current_round: state.current_round,
            });
        }

        let signer = recover_signer(&vote_sig_hash(&vote.for_sign()), &vote.signature)?;
        self.forensics.detect_equivocation_in_vote_pool(vote, signer, &state.vote_pool);
        if let Err(err) = self.forensics.process_vote_equivocation(chain, self, vote, signer) {
            debug!(target: "consensus::xdpos", %err, "Vote equivocation check failed");
        }

        state.note_round(round);
        let count = state.vote_pool.add(signer, vote.clone());
        trace!(target: "consensus::xdpos", round, %signer, count, "Pooled vote");

        self.try_form_qc(chain, state, &vote.pool_key(), vote)
    }

    /// Turn the votes pooled under `key` into a QC if they reach the threshold.
    fn try_form_qc(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        key: &str,
        vote: &Vote,
    ) -> XDPoSResult<()> {
        let block_info = vote.proposed_block_info;
        let Some(header) = chain.header_by_hash(block_info.hash) else {
            debug!(
                target: "consensus::xdpos",
                hash = %block_info.hash,
                round = block_info.round,
                "Buffering votes for unknown block"
            );
            return Ok(());
        };
        if let Err(err) = self.verify_block_info(chain, &block_info, Some(&header)) {
            state.vote_pool.clear_key(key);
            return Err(err);
        }

        let masternodes = self.masternodes(chain, &header);
        if masternodes.is_empty() {
            warn!(target: "consensus::xdpos", number = header.number, "No masternodes for voted block");
            return Ok(());
        }
        let threshold =
            cert_threshold_count(masternodes.len(), self.params_at(block_info.round).cert_threshold);

        let pooled = state.vote_pool.get(key);
        if pooled.len() < threshold {
            return Ok(());
        }
        let mut signatures: Vec<_> = pooled
            .into_iter()
            .filter(|(signer, _)| masternodes.contains(signer))
            .map(|(_, vote)| vote.signature)
            .collect();
        if signatures.len() < threshold {
            return Ok(());
        }
        signatures.sort();

        let qc = super::QuorumCert { proposed_block_info: block_info, signatures, gap_number: vote.gap_number };
        info!(
            target: "consensus::xdpos",
            round = block_info.round,
            number = block_info.number,
            signatures = qc.signatures.len(),
            "Formed QC"
        );
        self.process_qc_locked(chain, state, &qc)?;
        state.vote_pool.clear_key(key);
        Ok(())
    }

    /// Collect a timeout and build a TC once enough masternodes timed out.
    pub fn timeout_handler(&self, chain: &dyn ChainReader, timeout: &Timeout) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        self.timeout_handler_locked(chain, &mut state, timeout)
    }

    pub(crate) fn timeout_handler_locked(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        timeout: &Timeout,
    ) -> XDPoSResult<()> {
        if timeout.round != state.current_round {
            return Err(XDPoSError::IncomingMessageRoundNotEqualCurrentRound {
                kind: "timeout",
                incoming_round: timeout.round,
                current_round: state.current_round,
            });
        }

        let signer = recover_signer(&timeout_sig_hash(&timeout.for_sign()), &timeout.signature)?;
        state.note_round(timeout.round);
        let count = state.timeout_pool.add(signer, timeout.clone());
        trace!(target: "consensus::xdpos", round = timeout.round, %signer, count, "Pooled timeout");

        let snapshot = self.get_snapshot(chain, timeout.gap_number, true)?;
        let masternodes = snapshot.next_epoch_masternodes;
        let threshold =
            cert_threshold_count(masternodes.len(), self.params_at(timeout.round).cert_threshold);
        if count < threshold {
            return Ok(());
        }

        let mut signatures: Vec<_> = state
            .timeout_pool
            .get(&timeout.pool_key())
            .into_iter()
            .filter(|(signer, _)| masternodes.contains(signer))
            .map(|(_, timeout)| timeout.signature)
            .collect();
        if signatures.is_empty() || signatures.len() < threshold {
            return Ok(());
        }
        signatures.sort();

        let tc = TimeoutCert { round: timeout.round, signatures, gap_number: timeout.gap_number };
        info!(target: "consensus::xdpos", round = tc.round, signatures = tc.signatures.len(), "Formed TC");
        self.process_tc_locked(state, &tc);
        self.broadcast(BftMessage::SyncInfo(state.sync_info()));
        state.timeout_pool.clear();
        Ok(())
    }

    /// Adopt the certificates carried by a peer's sync info.
    pub fn sync_info_handler(&self, chain: &dyn ChainReader, sync_info: &SyncInfo) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        self.process_qc_locked(chain, &mut state, &sync_info.highest_quorum_cert)?;
        if let Some(tc) = &sync_info.highest_timeout_cert {
            self.process_tc_locked(&mut state, tc);
        }
        Ok(())
    }

    /// Fails with `NotInMasternodeList(kind)` unless the local signer is a
    /// masternode of the epoch `header` belongs to.
    pub(crate) fn allowed_to_send(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        kind: &'static str,
    ) -> XDPoSResult<()> {
        let signer = self.signer()?.address();
        if self.masternodes(chain, header).contains(&signer) {
            Ok(())
        } else {
            debug!(target: "consensus::xdpos", %signer, number = header.number, kind, "Not a masternode");
            Err(XDPoSError::NotInMasternodeList(kind))
        }
    }

    fn send_vote(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        block_info: BlockInfo,
    ) -> XDPoSResult<()> {
        let epoch_info = self.epoch_switch_info(chain, None, block_info.hash)?;
        let gap_number = self.epoch_gap_number(epoch_info.epoch_switch_block_info.number);

        let for_sign = VoteForSign { proposed_block_info: block_info, gap_number };
        let signature = self.signer()?.sign_hash(vote_sig_hash(&for_sign))?;
        let vote = Vote { proposed_block_info: block_info, signature, gap_number };

        state.highest_voted_round = state.current_round;
        debug!(target: "consensus::xdpos", round = block_info.round, number = block_info.number, "Sending vote");
        self.vote_handler_locked(chain, state, &vote)?;
        self.broadcast(BftMessage::Vote(vote));
        Ok(())
    }

    fn send_timeout(&self, chain: &dyn ChainReader, state: &mut RoundState) -> XDPoSResult<()> {
        let head = chain.current_header();
        let (is_switch, _) = self.is_epoch_switch_at_round(state.current_round, &head)?;
        let gap_number = if is_switch {
            self.epoch_gap_number(head.number + 1)
        } else {
            let info = self.epoch_switch_info(chain, Some(&head), head.hash_slow())?;
            self.epoch_gap_number(info.epoch_switch_block_info.number)
        };

        let for_sign = TimeoutForSign { round: state.current_round, gap_number };
        let signature = self.signer()?.sign_hash(timeout_sig_hash(&for_sign))?;
        let timeout = Timeout { round: state.current_round, signature, gap_number };

        debug!(target: "consensus::xdpos", round = timeout.round, gap_number, "Sending timeout");
        self.timeout_handler_locked(chain, state, &timeout)?;
        self.broadcast(BftMessage::Timeout(timeout));
        Ok(())
    }

    /// Countdown expiry for `fired_round`: send a timeout and restart the timer.
    ///
    /// Expiries for a round the engine already left are ignored.
    pub fn on_countdown_timeout(&self, chain: &dyn ChainReader, fired_round: Round) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        if fired_round != state.current_round {
            trace!(target: "consensus::xdpos", fired_round, current_round = state.current_round, "Stale countdown");
            return Ok(());
        }

        let result = self.timeout_locked(chain, &mut state);
        self.countdown.reset(state.current_round);
        result
    }

    fn timeout_locked(&self, chain: &dyn ChainReader, state: &mut RoundState) -> XDPoSResult<()> {
        self.allowed_to_send(chain, &chain.current_header(), "timeout")?;
        self.send_timeout(chain, state)?;

        state.timeout_count += 1;
        let threshold = self.params().timeout_sync_threshold;
        if threshold > 0 && state.timeout_count % threshold == 0 {
            debug!(target: "consensus::xdpos", timeout_count = state.timeout_count, "Broadcasting sync info");
            self.broadcast(BftMessage::SyncInfo(state.sync_info()));
        }
        Ok(())
    }

    /// Drop pooled messages more than [`POOL_HYGIENE_ROUND`] rounds behind
    /// the highest round seen.
    pub fn hygiene_pools(&self) {
        let mut state = self.round_state.lock();
        let below = state.highest_seen_round.saturating_sub(POOL_HYGIENE_ROUND);
        let votes = state.vote_pool.purge_below(below);
        let timeouts = state.timeout_pool.purge_below(below);
        if votes + timeouts > 0 {
            debug!(target: "consensus::xdpos", below, votes, timeouts, "Purged stale pool entries");
        }
    }
}
