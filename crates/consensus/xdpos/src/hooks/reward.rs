//! Epoch rewards.
//!
//! The reward of an epoch switch block pays for the signing work of the
//! epoch before the one just ending, so signing transactions that arrive late
//! are still counted. Each node's share is proportional to the sampled
//! blocks it signed and is split between the candidate owner and the
//! foundation wallet.

use super::{RewardDistribution, RewardHook, RewardLog, TierRewards};
use crate::{
    chain::{CandidateSource, ChainReader},
    errors::{XDPoSError, XDPoSResult},
    v2::{XDPoSV2Engine, snapshot::rank_candidates},
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use alloy_primitives::{Address, B256, U256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use xdc_primitives::XdcBlockHeader;

/// Share of a node's reward paid to the candidate owner
pub const REWARD_MASTER_PERCENT: u64 = 90;

/// Share of a node's reward paid to the foundation wallet
pub const REWARD_FOUNDATION_PERCENT: u64 = 10;

/// Epoch reward after `epochs` epochs of v2, halved every `halving_epochs`.
///
/// The sum over all epochs approaches `2 * reward * halving_epochs`.
pub fn epoch_reward(reward: u128, halving_epochs: u64, epochs: u64) -> U256 {
    let halvings = epochs.checked_div(halving_epochs).unwrap_or(0);
    U256::from(reward) >> halvings.min(256) as usize
}

/// Signers of every sampled block of one epoch
#[derive(Debug, Default)]
struct EpochSigning {
    masternodes: Vec<Address>,
    sampled: Vec<HashSet<Address>>,
}

impl EpochSigning {
    /// Sampled blocks signed by each of `members`, omitting those that signed none.
    fn tally(&self, members: &[Address]) -> BTreeMap<Address, u64> {
        let mut counts = BTreeMap::new();
        for signers in &self.sampled {
            for member in members {
                if signers.contains(member) {
                    *counts.entry(*member).or_default() += 1;
                }
            }
        }
        counts
    }
}

/// Split `pool` among `counts` proportionally, then between owner and foundation.
fn distribute(
    pool: U256,
    counts: &BTreeMap<Address, u64>,
    foundation: Address,
    owner_of: impl Fn(Address) -> Address,
) -> TierRewards {
    let total: u64 = counts.values().sum();
    let mut tier = TierRewards::default();
    if total == 0 || pool.is_zero() {
        return tier;
    }

    for (&signer, &sign) in counts {
        let reward = pool * U256::from(sign) / U256::from(total);
        let owner_share = reward * U256::from(REWARD_MASTER_PERCENT) / U256::from(100);
        let foundation_share = reward * U256::from(REWARD_FOUNDATION_PERCENT) / U256::from(100);

        let mut receivers: BTreeMap<Address, U256> = BTreeMap::new();
        *receivers.entry(owner_of(signer)).or_default() += owner_share;
        *receivers.entry(foundation).or_default() += foundation_share;

        tier.signers.insert(signer, RewardLog { sign, reward });
        tier.rewards.insert(signer, receivers);
    }
    tier
}

/// [`RewardHook`] paying masternodes, and after the reward upgrade block
/// protector and observer nodes, for their signing transactions.
#[derive(Debug, Clone)]
pub struct EpochRewardHook {
    source: Arc<dyn CandidateSource>,
}

impl EpochRewardHook {
    /// Hook reading candidates and owners from `source`
    pub fn new(source: Arc<dyn CandidateSource>) -> Self {
        Self { source }
    }

    /// Walk back from `header` to the epoch before the ending one and collect
    /// who signed its sampled blocks. `None` when no such v2 epoch exists.
    fn previous_epoch_signing(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<Option<EpochSigning>> {
        let switch_block = engine.switch_block();
        let merge_sign_range = engine.config().merge_sign_range;

        let mut hashes: HashMap<u64, B256> = HashMap::new();
        let mut signed: HashMap<B256, Vec<Address>> = HashMap::new();
        let mut end = None;
        let mut current = header.clone();

        let (start, masternodes) = loop {
            if current.number <= switch_block {
                return Ok(None);
            }
            let number = current.number - 1;
            let parent =
                chain.header(current.parent_hash, number).ok_or(XDPoSError::UnknownAncestor)?;
            hashes.insert(number, current.parent_hash);
            for tx in engine.signing_txs(chain, current.parent_hash) {
                signed.entry(tx.block_hash).or_default().push(tx.signer);
            }

            let (is_switch, _) = engine.is_epoch_switch(&parent)?;
            if is_switch && number != switch_block + 1 {
                if end.is_some() {
                    break (number, engine.extra_fields(&parent)?.2);
                }
                if number == switch_block {
                    return Ok(None);
                }
                end = Some(number - 1);
            }
            current = parent;
        };
        let Some(end) = end else { return Ok(None) };

        let sampled = (start..=end)
            .filter(|number| number % merge_sign_range == 0)
            .filter_map(|number| hashes.get(&number))
            .map(|hash| signed.get(hash).into_iter().flatten().copied().collect())
            .collect();
        debug!(target: "consensus::xdpos::hooks", start, end, "Collected epoch signing");
        Ok(Some(EpochSigning { masternodes, sampled }))
    }

    /// Protector and observer nodes: the best ranked candidates outside `masternodes`.
    fn standby_tiers(
        &self,
        engine: &XDPoSV2Engine,
        parent: &XdcBlockHeader,
        masternodes: &[Address],
    ) -> XDPoSResult<(Vec<Address>, Vec<Address>)> {
        let params = engine.params();
        let mut standby = rank_candidates(&self.source.candidates(parent)?)
            .into_iter()
            .filter(|candidate| !masternodes.contains(candidate));
        let protectors = standby.by_ref().take(params.max_protector_nodes).collect();
        let observers = standby.take(params.max_observer_nodes).collect();
        Ok((protectors, observers))
    }
}

impl RewardHook for EpochRewardHook {
    fn hook_reward(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<RewardDistribution> {
        let config = engine.config();
        let number = header.number;
        let (is_switch, epoch_num) = engine.is_epoch_switch(header)?;
        if !is_switch || number <= engine.switch_block() + 1 {
            return Ok(RewardDistribution::default());
        }
        if config.foundation_wallet.is_zero() {
            return Err(XDPoSError::Initialization("foundation wallet address is empty".into()));
        }

        let Some(signing) = self.previous_epoch_signing(chain, engine, header)? else {
            return Ok(RewardDistribution::default());
        };

        let epochs = epoch_num.saturating_sub(engine.switch_block() / config.epoch);
        let halving = |pool: u128| epoch_reward(pool, config.reward_halving_epochs, epochs);
        let owner_of =
            |candidate: Address| self.source.candidate_owner(candidate).unwrap_or(candidate);

        let mut distribution = RewardDistribution {
            masternodes: distribute(
                halving(config.reward),
                &signing.tally(&signing.masternodes),
                config.foundation_wallet,
                owner_of,
            ),
            ..Default::default()
        };

        if config.reward_upgrade_block.is_some_and(|upgrade| number >= upgrade) {
            let parent = chain
                .header(header.parent_hash, number - 1)
                .ok_or(XDPoSError::UnknownAncestor)?;
            let (protectors, observers) = self.standby_tiers(engine, &parent, &signing.masternodes)?;
            distribution.protectors = distribute(
                halving(config.protector_reward),
                &signing.tally(&protectors),
                config.foundation_wallet,
                owner_of,
            );
            distribution.observers = distribute(
                halving(config.observer_reward),
                &signing.tally(&observers),
                config.foundation_wallet,
                owner_of,
            );
        }

        info!(
            target: "consensus::xdpos::hooks",
            number,
            epochs,
            masternodes = distribution.masternodes.signers.len(),
            protectors = distribution.protectors.signers.len(),
            observers = distribution.observers.signers.len(),
            total = %distribution.total(),
            "Computed epoch rewards"
        );
        Ok(distribution)
    }
}
