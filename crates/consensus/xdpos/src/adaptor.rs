//! Version dispatch.
//!
//! [`XDPoS`] owns both engines and routes every call by block number: blocks
//! up to the v2 switch block belong to v1, later blocks to v2.

use crate::{
    api::XDPoSApi,
    chain::{ChainReader, RewardState},
    config::XDPoSConfig,
    db::KeyValueStore,
    errors::{XDPoSError, XDPoSResult},
    hooks::RewardDistribution,
    v1::XDPoSV1Engine,
    v2::XDPoSV2Engine,
};
use alloc::sync::Arc;
use alloy_primitives::Address;
use core::fmt::Debug;
use xdc_primitives::XdcBlockHeader;

/// Error message for operations the v1 engine does not provide
pub const NOT_SUPPORTED_IN_V1: &str = "not supported in the v1 consensus";

/// Block-level consensus operations shared by both versions.
pub trait ConsensusEngine: Send + Sync + Debug {
    /// Address that sealed `header`
    fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address>;

    /// Verify `header` against its ancestors
    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()>;

    /// Fill the consensus fields of a block about to be built
    fn prepare(&self, chain: &dyn ChainReader, header: &mut XdcBlockHeader) -> XDPoSResult<()>;

    /// Sign a prepared header
    fn seal(&self, header: &mut XdcBlockHeader) -> XDPoSResult<()>;

    /// Apply block rewards and finish the header
    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut XdcBlockHeader,
        state: &mut dyn RewardState,
    ) -> XDPoSResult<Option<RewardDistribution>>;
}

impl ConsensusEngine for XDPoSV1Engine {
    fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address> {
        Self::author(self, header)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        Self::verify_header(self, chain, header, full_verify)
    }

    fn prepare(&self, _chain: &dyn ChainReader, _header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        Err(XDPoSError::Api(NOT_SUPPORTED_IN_V1.into()))
    }

    fn seal(&self, _header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        Err(XDPoSError::Api(NOT_SUPPORTED_IN_V1.into()))
    }

    fn finalize(
        &self,
        _chain: &dyn ChainReader,
        header: &mut XdcBlockHeader,
        _state: &mut dyn RewardState,
    ) -> XDPoSResult<Option<RewardDistribution>> {
        Self::finalize(self, header);
        Ok(None)
    }
}

impl ConsensusEngine for XDPoSV2Engine {
    fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address> {
        Self::author(self, header)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        Self::verify_header(self, chain, header, full_verify)
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        Self::prepare(self, chain, header)
    }

    fn seal(&self, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        Self::seal(self, header)
    }

    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut XdcBlockHeader,
        state: &mut dyn RewardState,
    ) -> XDPoSResult<Option<RewardDistribution>> {
        Self::finalize(self, chain, header, state)
    }
}

/// Engine responsible for a block
#[derive(Debug, Clone, Copy)]
pub enum Engine<'a> {
    /// Blocks up to and including the switch block
    V1(&'a XDPoSV1Engine),
    /// Blocks after the switch block
    V2(&'a XDPoSV2Engine),
}

impl<'a> Engine<'a> {
    /// The engine as a trait object
    pub fn as_dyn(self) -> &'a dyn ConsensusEngine {
        match self {
            Self::V1(engine) => engine,
            Self::V2(engine) => engine,
        }
    }

    /// Whether this is the v2 engine
    pub const fn is_v2(&self) -> bool {
        matches!(self, Self::V2(_))
    }
}

/// XDPoS consensus with both protocol versions
#[derive(Debug)]
pub struct XDPoS {
    config: XDPoSConfig,
    v1: XDPoSV1Engine,
    v2: Arc<XDPoSV2Engine>,
}

impl XDPoS {
    /// Create both engines from `config`, which must carry a v2 section.
    pub fn new(config: XDPoSConfig, store: Arc<dyn KeyValueStore>) -> XDPoSResult<Self> {
        let v2 = Arc::new(XDPoSV2Engine::new(config.clone(), store)?);
        Ok(Self::from_parts(config, v2))
    }

    /// Wrap an already configured v2 engine, e.g. one with hooks installed.
    pub fn from_parts(config: XDPoSConfig, v2: Arc<XDPoSV2Engine>) -> Self {
        Self { v1: XDPoSV1Engine::new(config.clone()), config, v2 }
    }

    /// Engine for the block `number`
    pub fn engine_for(&self, number: u64) -> Engine<'_> {
        if self.config.is_v2(number) { Engine::V2(&self.v2) } else { Engine::V1(&self.v1) }
    }

    /// XDPoS config
    pub const fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    /// The v1 verifier
    pub const fn v1(&self) -> &XDPoSV1Engine {
        &self.v1
    }

    /// The v2 engine
    pub const fn v2(&self) -> &Arc<XDPoSV2Engine> {
        &self.v2
    }

    /// Read API over `chain`
    pub fn api(&self, chain: Arc<dyn ChainReader>) -> XDPoSApi {
        XDPoSApi::new(Arc::clone(&self.v2), chain)
    }
}

impl ConsensusEngine for XDPoS {
    fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address> {
        self.engine_for(header.number).as_dyn().author(header)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        self.engine_for(header.number).as_dyn().verify_header(chain, header, full_verify)
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        self.engine_for(header.number).as_dyn().prepare(chain, header)
    }

    fn seal(&self, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        self.engine_for(header.number).as_dyn().seal(header)
    }

    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut XdcBlockHeader,
        state: &mut dyn RewardState,
    ) -> XDPoSResult<Option<RewardDistribution>> {
        self.engine_for(header.number).as_dyn().finalize(chain, header, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::V2Config, db::MemoryStore};
    use assert_matches::assert_matches;

    fn xdpos() -> XDPoS {
        let config = XDPoSConfig::default().with_epoch(10).with_gap(5).with_v2(V2Config::new(10));
        XDPoS::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_engine_for_routes_by_switch_block() {
        let xdpos = xdpos();
        assert_matches!(xdpos.engine_for(0), Engine::V1(_));
        assert_matches!(xdpos.engine_for(10), Engine::V1(_));
        assert_matches!(xdpos.engine_for(11), Engine::V2(_));
        assert!(xdpos.engine_for(1_000).is_v2());
    }

    #[test]
    fn test_v1_does_not_produce_blocks() {
        let xdpos = xdpos();
        let mut header = XdcBlockHeader { number: 3, ..Default::default() };
        assert_matches!(xdpos.seal(&mut header), Err(XDPoSError::Api(message)) if message == NOT_SUPPORTED_IN_V1);
    }

    #[test]
    fn test_missing_v2_config() {
        let result = XDPoS::new(XDPoSConfig::default(), Arc::new(MemoryStore::new()));
        assert_matches!(result, Err(XDPoSError::Initialization(_)));
    }
}
