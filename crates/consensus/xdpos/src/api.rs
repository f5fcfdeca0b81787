//! Read-only consensus API.
//!
//! Serves the `XDPoS_*` RPC namespace of the node from the v2 engine and the
//! chain. Responses are serde types with camelCase fields.

use crate::{
    adaptor::NOT_SUPPORTED_IN_V1,
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    v2::{BlockInfo, EpochSwitchInfo, Round, XDPoSV2Engine, proposer::leader_index},
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use tracing::trace;
use xdc_primitives::XdcBlockHeader;

/// Largest `end - begin` accepted by [`XDPoSApi::get_epoch_numbers_between`]
pub const MAX_BLOCK_DISTANCE: u64 = 50_000;

/// A round in which the expected leader produced no block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedRoundInfo {
    /// The missed round
    pub round: Round,
    /// Leader of the missed round
    pub miner: Address,
    /// Block produced after the gap
    pub current_block_hash: B256,
    /// Number of the block produced after the gap
    pub current_block_num: u64,
    /// Block produced before the gap
    pub parent_block_hash: B256,
    /// Number of the block produced before the gap
    pub parent_block_num: u64,
}

/// Missed rounds of one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedRoundsMetadata {
    /// Round of the epoch switch block
    pub epoch_round: Round,
    /// Number of the epoch switch block
    pub epoch_block_number: u64,
    /// Missed rounds, newest first
    pub missed_rounds: Vec<MissedRoundInfo>,
}

/// Block range of an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochNumInfo {
    /// Epoch switch block hash
    pub epoch_block_hash: B256,
    /// Epoch switch block round
    pub epoch_round: Round,
    /// First block of the epoch
    pub epoch_first_block: u64,
    /// Last block of the epoch, `None` for the current epoch
    pub epoch_last_block: Option<u64>,
}

/// Read API over a chain and its v2 engine
#[derive(Clone)]
pub struct XDPoSApi {
    engine: Arc<XDPoSV2Engine>,
    chain: Arc<dyn ChainReader>,
}

impl core::fmt::Debug for XDPoSApi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XDPoSApi").field("engine", &self.engine).finish_non_exhaustive()
    }
}

impl XDPoSApi {
    /// Create the API
    pub fn new(engine: Arc<XDPoSV2Engine>, chain: Arc<dyn ChainReader>) -> Self {
        Self { engine, chain }
    }

    /// Header at `number`, or the head when `None`
    fn header_at(&self, number: Option<u64>) -> Option<XdcBlockHeader> {
        match number {
            Some(number) => self.chain.header_by_number(number),
            None => Some(self.chain.current_header()),
        }
    }

    /// Epoch number of the epoch switch block described by `info`
    fn epoch_num(&self, info: &EpochSwitchInfo) -> u64 {
        let epoch = self.engine.config().epoch;
        self.engine.switch_block() / epoch + info.epoch_switch_block_info.round / epoch
    }

    /// Rounds of the epoch containing block `number` (head when `None`) in
    /// which no block was produced, with the leader that missed each one.
    pub fn get_missed_rounds_in_epoch_by_block_num(
        &self,
        number: Option<u64>,
    ) -> XDPoSResult<MissedRoundsMetadata> {
        let header = self.header_at(number).ok_or(XDPoSError::UnknownBlock)?;
        if header.number <= self.engine.switch_block() {
            return Err(XDPoSError::Api(NOT_SUPPORTED_IN_V1.into()));
        }

        let chain = self.chain.as_ref();
        let info = self.engine.epoch_switch_info(chain, Some(&header), header.hash_slow())?;
        let masternodes = &info.masternodes;
        let epoch = self.engine.config().epoch;

        let mut missed_rounds = Vec::new();
        let mut current = header;
        while current.number > info.epoch_switch_block_info.number {
            let parent =
                chain.header_by_hash(current.parent_hash).ok_or(XDPoSError::UnknownAncestor)?;
            let (_, parent_round, _) = self.engine.extra_fields(&parent)?;
            let (_, round, _) = self.engine.extra_fields(&current)?;

            if !masternodes.is_empty() {
                for missed in parent_round + 1..round {
                    missed_rounds.push(MissedRoundInfo {
                        round: missed,
                        miner: masternodes[leader_index(missed, epoch, masternodes.len())],
                        current_block_hash: current.hash_slow(),
                        current_block_num: current.number,
                        parent_block_hash: current.parent_hash,
                        parent_block_num: parent.number,
                    });
                }
            }
            current = parent;
        }

        Ok(MissedRoundsMetadata {
            epoch_round: info.epoch_switch_block_info.round,
            epoch_block_number: info.epoch_switch_block_info.number,
            missed_rounds,
        })
    }

    /// Epoch switch infos of the epochs starting in `begin..=end`, oldest first.
    pub fn epoch_switch_infos_between(
        &self,
        begin: &XdcBlockHeader,
        end: &XdcBlockHeader,
    ) -> XDPoSResult<Vec<EpochSwitchInfo>> {
        let chain = self.chain.as_ref();
        let mut infos = Vec::new();
        let mut header = Some(end);
        let mut hash = end.hash_slow();
        let mut number = end.number;

        while number > begin.number {
            let info = self.engine.epoch_switch_info(chain, header.take(), hash)?;
            // the v2 switch block has no parent epoch
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            hash = parent.hash;
            number = info.epoch_switch_block_info.number;
            if number >= begin.number {
                infos.push(info);
            }
        }

        infos.reverse();
        Ok(infos)
    }

    /// Numbers of the epoch switch blocks between `begin` and `end`, inclusive.
    pub fn get_epoch_numbers_between(
        &self,
        begin: Option<u64>,
        end: Option<u64>,
    ) -> XDPoSResult<Vec<u64>> {
        let begin = self
            .header_at(begin)
            .ok_or_else(|| XDPoSError::Api("illegal begin block number".into()))?;
        let end =
            self.header_at(end).ok_or_else(|| XDPoSError::Api("illegal end block number".into()))?;
        if begin.number > end.number {
            return Err(XDPoSError::Api("illegal begin and end block number, begin > end".into()));
        }
        if end.number - begin.number > MAX_BLOCK_DISTANCE {
            return Err(XDPoSError::Api(
                "illegal begin and end block number, exceed max block distance".into(),
            ));
        }
        if end.number <= self.engine.switch_block() {
            return Err(XDPoSError::Api(NOT_SUPPORTED_IN_V1.into()));
        }

        let infos = self.epoch_switch_infos_between(&begin, &end)?;
        Ok(infos.iter().map(|info| info.epoch_switch_block_info.number).collect())
    }

    /// Epoch switch block of epoch `epoch_num`.
    fn block_by_epoch_number(&self, epoch_num: u64) -> XDPoSResult<BlockInfo> {
        let chain = self.chain.as_ref();
        let head = chain.current_header();
        if head.number <= self.engine.switch_block() {
            return Err(XDPoSError::Api(NOT_SUPPORTED_IN_V1.into()));
        }
        let first_epoch = self.engine.switch_block() / self.engine.config().epoch;
        if epoch_num < first_epoch {
            return Err(XDPoSError::Api("illegal epoch number".into()));
        }

        let mut info = self.engine.epoch_switch_info(chain, Some(&head), head.hash_slow())?;
        loop {
            let current = self.epoch_num(&info);
            if current == epoch_num {
                return Ok(info.epoch_switch_block_info);
            }
            // epochs without blocks are skipped by the chain
            if current < epoch_num {
                break;
            }
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            info = self.engine.epoch_switch_info(chain, None, parent.hash)?;
        }
        trace!(target: "consensus::xdpos::api", epoch_num, "Epoch not found");
        Err(XDPoSError::Api("illegal epoch number".into()))
    }

    /// First and last block of epoch `epoch_num`.
    pub fn get_block_info_by_epoch_num(&self, epoch_num: u64) -> XDPoSResult<EpochNumInfo> {
        let this_epoch = self.block_by_epoch_number(epoch_num)?;
        let next_epoch = self.block_by_epoch_number(epoch_num + 1).ok();
        Ok(EpochNumInfo {
            epoch_block_hash: this_epoch.hash,
            epoch_round: this_epoch.round,
            epoch_first_block: this_epoch.number,
            epoch_last_block: next_epoch.map(|next| next.number - 1),
        })
    }
}
