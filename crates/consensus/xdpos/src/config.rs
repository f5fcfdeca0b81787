//! XDPoS Configuration Types
//!
//! The v2 parameters are versioned by round: [`V2Config::configs`] maps the
//! round at which a parameter set becomes active to the set itself. The
//! engine swaps the active set in [`crate::XDPoSV2Engine::update_params`].

use crate::errors::{XDPoSError, XDPoSResult};
use crate::v2::Round;
use alloc::{collections::BTreeMap, format};
use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// XDPoS consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XDPoSConfig {
    /// Epoch length in blocks (default: 900)
    pub epoch: u64,

    /// Block period in seconds (default: 2)
    pub period: u64,

    /// Gap before epoch switch in blocks (default: 450)
    pub gap: u64,

    /// Epoch reward in wei before halving (default: 250 XDC)
    pub reward: u128,

    /// Number of epochs after which the epoch reward halves
    pub reward_halving_epochs: u64,

    /// Foundation wallet address for reward distribution
    pub foundation_wallet: Address,

    /// Block from which protector and observer nodes are rewarded
    pub reward_upgrade_block: Option<u64>,

    /// Epoch reward pool for protector nodes
    pub protector_reward: u128,

    /// Epoch reward pool for observer nodes
    pub observer_reward: u128,

    /// Only blocks with `number % merge_sign_range == 0` are signed
    pub merge_sign_range: u64,

    /// Trailing window of blocks scanned for signing transactions
    pub range_return_signer: u64,

    /// Epochs back inspected for penalty comebacks
    pub limit_penalty_epoch: u64,

    /// Directory where epoch rewards are exported as JSON
    pub store_reward_folder: Option<PathBuf>,

    /// V2 consensus configuration
    pub v2: Option<V2Config>,
}

impl Default for XDPoSConfig {
    fn default() -> Self {
        Self {
            epoch: 900,
            period: 2,
            gap: 450,
            reward: 250_000_000_000_000_000_000, // 250 XDC
            reward_halving_epochs: 2 * 365 * 24 * 60 * 60 / (900 * 2),
            foundation_wallet: Address::ZERO,
            reward_upgrade_block: None,
            protector_reward: 0,
            observer_reward: 0,
            merge_sign_range: 15,
            range_return_signer: 150,
            limit_penalty_epoch: 4,
            store_reward_folder: None,
            v2: None,
        }
    }
}

impl XDPoSConfig {
    /// Create a new XDPoS config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from its JSON representation.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> XDPoSResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| XDPoSError::Initialization(format!("invalid XDPoS config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> XDPoSResult<()> {
        if self.epoch == 0 {
            return Err(XDPoSError::Initialization("epoch must be non-zero".into()));
        }
        if self.gap >= self.epoch {
            return Err(XDPoSError::Initialization(format!(
                "gap {} must be smaller than epoch {}",
                self.gap, self.epoch
            )));
        }
        if self.merge_sign_range == 0 {
            return Err(XDPoSError::Initialization("merge sign range must be non-zero".into()));
        }
        if let Some(v2) = &self.v2 {
            if !v2.configs.contains_key(&0) {
                return Err(XDPoSError::Initialization(
                    "v2 config needs a parameter set for round 0".into(),
                ));
            }
        }
        Ok(())
    }

    /// Set epoch length
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Set block period
    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    /// Set gap
    pub fn with_gap(mut self, gap: u64) -> Self {
        self.gap = gap;
        self
    }

    /// Set reward
    pub fn with_reward(mut self, reward: u128) -> Self {
        self.reward = reward;
        self
    }

    /// Set foundation wallet
    pub fn with_foundation_wallet(mut self, wallet: Address) -> Self {
        self.foundation_wallet = wallet;
        self
    }

    /// Set the reward export directory
    pub fn with_store_reward_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.store_reward_folder = Some(folder.into());
        self
    }

    /// Enable protector/observer rewards from `block`
    pub fn with_reward_upgrade(mut self, block: u64, protector: u128, observer: u128) -> Self {
        self.reward_upgrade_block = Some(block);
        self.protector_reward = protector;
        self.observer_reward = observer;
        self
    }

    /// Set V2 config
    pub fn with_v2(mut self, v2: V2Config) -> Self {
        self.v2 = Some(v2);
        self
    }

    /// Check if V2 is enabled for a given block number.
    ///
    /// The switch block itself is the last v1 block.
    pub fn is_v2(&self, block_number: u64) -> bool {
        match &self.v2 {
            Some(v2) => block_number > v2.switch_block,
            None => false,
        }
    }

    /// Get the V2 switch block if configured
    pub fn v2_switch_block(&self) -> Option<u64> {
        self.v2.as_ref().map(|v2| v2.switch_block)
    }

    /// Whether `number` is a gap block, where the next epoch's snapshot is taken.
    pub const fn is_gap_block(&self, number: u64) -> bool {
        number % self.epoch == self.epoch - self.gap
    }
}

/// XDPoS V2 consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct V2Config {
    /// Last v1 block; v2 starts at `switch_block + 1`
    pub switch_block: u64,

    /// Skip header checks (tests and fast sync only)
    pub skip_v2_validation: bool,

    /// Parameter sets keyed by the round they become active
    pub configs: BTreeMap<Round, V2RoundConfig>,
}

impl Default for V2Config {
    fn default() -> Self {
        Self {
            switch_block: 0,
            skip_v2_validation: false,
            configs: BTreeMap::from([(0, V2RoundConfig::default())]),
        }
    }
}

impl V2Config {
    /// Create new V2 config
    pub fn new(switch_block: u64) -> Self {
        Self { switch_block, ..Default::default() }
    }

    /// Add a parameter set, active from its `switch_round`
    pub fn with_round_config(mut self, config: V2RoundConfig) -> Self {
        self.configs.insert(config.switch_round, config);
        self
    }

    /// Disable header checks
    pub const fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_v2_validation = skip;
        self
    }

    /// The parameter set active at `round`: the entry with the largest
    /// `switch_round <= round`.
    pub fn config_at(&self, round: Round) -> V2RoundConfig {
        self.configs
            .range(..=round)
            .next_back()
            .map(|(_, config)| config.clone())
            .unwrap_or_default()
    }
}

/// V2 parameters active from `switch_round` on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct V2RoundConfig {
    /// First round using this parameter set
    pub switch_round: Round,

    /// Masternodes selected per epoch
    pub max_masternodes: usize,

    /// Protector nodes rewarded after the reward upgrade
    pub max_protector_nodes: usize,

    /// Observer nodes rewarded after the reward upgrade
    pub max_observer_nodes: usize,

    /// Certificate threshold in percent of the masternode count
    pub cert_threshold: u64,

    /// Broadcast sync info every this many consecutive timeouts
    pub timeout_sync_threshold: u64,

    /// Base timeout in seconds
    pub timeout_period: u64,

    /// Minimum seconds between a parent and its child
    pub mine_period: u64,

    /// Growth base of the timeout while no QC is formed
    pub expo_timeout_base: u64,

    /// Upper bound of the timeout exponent
    pub max_timeout_exponent: u32,
}

impl Default for V2RoundConfig {
    fn default() -> Self {
        Self {
            switch_round: 0,
            max_masternodes: 108,
            max_protector_nodes: 0,
            max_observer_nodes: 0,
            cert_threshold: 67,
            timeout_sync_threshold: 3,
            timeout_period: 10,
            mine_period: 2,
            expo_timeout_base: 2,
            max_timeout_exponent: 5,
        }
    }
}

impl V2RoundConfig {
    /// Set the activation round
    pub const fn with_switch_round(mut self, round: Round) -> Self {
        self.switch_round = round;
        self
    }

    /// Set mine period
    pub const fn with_mine_period(mut self, period: u64) -> Self {
        self.mine_period = period;
        self
    }

    /// Set timeout period
    pub const fn with_timeout_period(mut self, period: u64) -> Self {
        self.timeout_period = period;
        self
    }

    /// Set certificate threshold
    pub const fn with_cert_threshold(mut self, threshold: u64) -> Self {
        self.cert_threshold = threshold;
        self
    }

    /// Set the timeout count that triggers a sync info broadcast
    pub const fn with_timeout_sync_threshold(mut self, threshold: u64) -> Self {
        self.timeout_sync_threshold = threshold;
        self
    }

    /// Set the masternode cap
    pub const fn with_max_masternodes(mut self, max: usize) -> Self {
        self.max_masternodes = max;
        self
    }

    /// Set protector and observer caps
    pub const fn with_standby_tiers(mut self, protectors: usize, observers: usize) -> Self {
        self.max_protector_nodes = protectors;
        self.max_observer_nodes = observers;
        self
    }

    /// Set the timeout growth base and exponent cap
    pub const fn with_exp_timeout(mut self, base: u64, max_exponent: u32) -> Self {
        self.expo_timeout_base = base;
        self.max_timeout_exponent = max_exponent;
        self
    }
}

/// XDC Mainnet configuration
pub fn xdc_mainnet_config() -> XDPoSConfig {
    XDPoSConfig {
        foundation_wallet: address!("0x746249c61f5832c5eed53172776b460491bdcd5c"),
        v2: Some(V2Config {
            switch_block: 80_370_000,
            skip_v2_validation: false,
            configs: BTreeMap::from([
                (0, V2RoundConfig::default()),
                (
                    2_000,
                    V2RoundConfig::default()
                        .with_switch_round(2_000)
                        .with_timeout_sync_threshold(2)
                        .with_timeout_period(30),
                ),
            ]),
        }),
        ..Default::default()
    }
}

/// XDC Apothem testnet configuration
pub fn xdc_apothem_config() -> XDPoSConfig {
    XDPoSConfig {
        foundation_wallet: address!("0x746249c61f5832c5eed53172776b460491bdcd5c"),
        v2: Some(V2Config {
            switch_block: 56_828_700,
            skip_v2_validation: false,
            configs: BTreeMap::from([(0, V2RoundConfig::default().with_max_masternodes(15))]),
        }),
        ..Default::default()
    }
}
