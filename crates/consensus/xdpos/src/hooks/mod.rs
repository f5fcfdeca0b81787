//! Penalty and reward hooks.
//!
//! The engine calls a [`PenaltyHook`] when computing the masternodes of a new
//! epoch and a [`RewardHook`] when finalizing an epoch switch block. Both are
//! optional; without them no one is penalized and no rewards are paid.

mod penalty;
mod reward;

pub use penalty::SigningPenaltyHook;
pub use reward::{EpochRewardHook, REWARD_FOUNDATION_PERCENT, REWARD_MASTER_PERCENT, epoch_reward};

use crate::{
    chain::{ChainReader, RewardState},
    errors::XDPoSResult,
    v2::XDPoSV2Engine,
};
use alloc::{collections::BTreeMap, vec::Vec};
use alloy_primitives::{Address, B256, U256};
use core::fmt::Debug;
use serde::Serialize;
use xdc_primitives::XdcBlockHeader;

/// Decides which masternode candidates are penalized at an epoch switch.
pub trait PenaltyHook: Send + Sync + Debug {
    /// Penalized addresses for the epoch switch block `number` built on
    /// `parent_hash`, given the ranked `candidates`.
    fn hook_penalty(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        number: u64,
        parent_hash: B256,
        candidates: &[Address],
    ) -> XDPoSResult<Vec<Address>>;
}

/// Computes the rewards paid at an epoch switch block.
pub trait RewardHook: Send + Sync + Debug {
    /// Rewards for `header`. Non epoch switch headers get an empty distribution.
    fn hook_reward(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<RewardDistribution>;
}

/// Signing count and reward of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardLog {
    /// Sampled blocks the node signed
    pub sign: u64,
    /// Reward before the owner/foundation split
    pub reward: U256,
}

/// Rewards of one node tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRewards {
    /// Per node tally
    pub signers: BTreeMap<Address, RewardLog>,
    /// Per node payouts by receiving address
    pub rewards: BTreeMap<Address, BTreeMap<Address, U256>>,
}

impl TierRewards {
    /// Total paid out
    pub fn total(&self) -> U256 {
        self.rewards.values().flat_map(BTreeMap::values).fold(U256::ZERO, |acc, amount| acc + amount)
    }

    /// Whether nothing is paid out
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

/// Rewards paid at an epoch switch block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardDistribution {
    /// Masternode rewards
    pub masternodes: TierRewards,
    /// Protector node rewards
    pub protectors: TierRewards,
    /// Observer node rewards
    pub observers: TierRewards,
}

impl RewardDistribution {
    /// Credit every payout to `state`.
    pub fn apply(&self, state: &mut dyn RewardState) {
        for tier in [&self.masternodes, &self.protectors, &self.observers] {
            for receivers in tier.rewards.values() {
                for (address, amount) in receivers {
                    state.add_balance(*address, *amount);
                }
            }
        }
    }

    /// Total paid out across tiers
    pub fn total(&self) -> U256 {
        self.masternodes.total() + self.protectors.total() + self.observers.total()
    }

    /// Whether nothing is paid out
    pub fn is_empty(&self) -> bool {
        self.masternodes.is_empty() && self.protectors.is_empty() && self.observers.is_empty()
    }
}
