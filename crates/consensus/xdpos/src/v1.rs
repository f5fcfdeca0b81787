//! XDPoS V1 header checks.
//!
//! Blocks up to the v2 switch block use the fixed extra layout
//! `vanity | validators | seal` and are sealed by a signature at the end of
//! the extra data. The v1 engine only verifies such headers and recovers
//! their authors; it does not produce blocks.

use crate::{
    chain::ChainReader,
    config::XDPoSConfig,
    constants::INMEMORY_SIGNATURES,
    errors::{XDPoSError, XDPoSResult},
    extra_data::{V1ExtraData, decode_masternodes_from_v1_extra, recover_v1_author},
};
use alloc::vec::Vec;
use alloy_primitives::{Address, B256};
use core::num::NonZeroUsize;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;
use xdc_primitives::{EMPTY_OMMER_ROOT_HASH, NONCE_AUTH_VOTE, NONCE_DROP_VOTE, XdcBlockHeader};

/// Verifier for pre-switch headers
#[derive(Debug)]
pub struct XDPoSV1Engine {
    config: XDPoSConfig,
    signatures: Mutex<LruCache<B256, Address>>,
}

impl XDPoSV1Engine {
    /// Create a v1 verifier
    pub fn new(config: XDPoSConfig) -> Self {
        let capacity = NonZeroUsize::new(INMEMORY_SIGNATURES).unwrap_or(NonZeroUsize::MIN);
        Self { config, signatures: Mutex::new(LruCache::new(capacity)) }
    }

    /// Address that sealed `header`, recovered from the extra seal
    pub fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address> {
        let hash = header.hash_slow();
        if let Some(author) = self.signatures.lock().get(&hash) {
            return Ok(*author);
        }
        let author = recover_v1_author(header)?;
        self.signatures.lock().put(hash, author);
        Ok(author)
    }

    /// Masternodes of the checkpoint governing block `number`, empty when the
    /// checkpoint is unknown.
    pub fn masternodes_at(&self, chain: &dyn ChainReader, number: u64) -> Vec<Address> {
        let previous = number.saturating_sub(1);
        let checkpoint = previous - previous % self.config.epoch;
        chain
            .header_by_number(checkpoint)
            .and_then(|header| decode_masternodes_from_v1_extra(&header).ok())
            .unwrap_or_default()
    }

    /// Verify a v1 header. `full_verify` also checks the author against the
    /// checkpoint masternodes and the timestamp against the local clock.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        let number = header.number;
        if full_verify && header.timestamp > crate::v2::unix_now() {
            return Err(XDPoSError::FutureBlock);
        }

        let checkpoint = number % self.config.epoch == 0;
        if header.nonce != NONCE_AUTH_VOTE && header.nonce != NONCE_DROP_VOTE {
            return Err(XDPoSError::InvalidVote);
        }
        if checkpoint && header.nonce != NONCE_DROP_VOTE {
            return Err(XDPoSError::InvalidCheckpointVote);
        }

        let extra = V1ExtraData::parse(&header.extra_data)?;
        if !checkpoint && !extra.validators.is_empty() {
            return Err(XDPoSError::InvalidCheckpointSigners);
        }
        if header.mix_hash != B256::ZERO {
            return Err(XDPoSError::InvalidMixDigest);
        }
        if header.ommers_hash != EMPTY_OMMER_ROOT_HASH {
            return Err(XDPoSError::InvalidUncleHash);
        }
        if number == 0 {
            return Ok(());
        }

        let parent = chain.header(header.parent_hash, number - 1).ok_or(XDPoSError::UnknownAncestor)?;
        if parent.timestamp + self.config.period > header.timestamp {
            return Err(XDPoSError::InvalidTimestamp);
        }

        if full_verify {
            let author = self.author(header)?;
            let masternodes = self.masternodes_at(chain, number);
            if !masternodes.is_empty() && !masternodes.contains(&author) {
                return Err(XDPoSError::ValidatorNotWithinMasternodes);
            }
            trace!(target: "consensus::xdpos::v1", number, %author, "Verified v1 header");
        }
        Ok(())
    }

    /// Clear the uncle hash. V1 rewards are not paid by this engine.
    pub fn finalize(&self, header: &mut XdcBlockHeader) {
        header.ommers_hash = EMPTY_OMMER_ROOT_HASH;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::EXTRA_SEAL,
        extra_data::hash_without_seal,
        signer::{LocalSigner, Signer},
    };
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Headers(HashMap<B256, XdcBlockHeader>);

    impl ChainReader for Headers {
        fn current_header(&self) -> XdcBlockHeader {
            self.0.values().max_by_key(|header| header.number).cloned().unwrap_or_default()
        }

        fn header_by_number(&self, number: u64) -> Option<XdcBlockHeader> {
            self.0.values().find(|header| header.number == number).cloned()
        }

        fn header_by_hash(&self, hash: B256) -> Option<XdcBlockHeader> {
            self.0.get(&hash).cloned()
        }
    }

    fn sealed(key: &LocalSigner, mut header: XdcBlockHeader, validators: &[Address]) -> XdcBlockHeader {
        header.extra_data =
            V1ExtraData { vanity: [0; 32], validators: validators.to_vec(), seal: [0; 65] }.encode().into();
        let signature = key.sign_hash(hash_without_seal(&header)).unwrap();
        let mut extra = header.extra_data.to_vec();
        let len = extra.len();
        extra[len - EXTRA_SEAL..].copy_from_slice(&signature);
        header.extra_data = extra.into();
        header
    }

    fn setup() -> (XDPoSV1Engine, Headers, LocalSigner, XdcBlockHeader) {
        let config = XDPoSConfig::default().with_epoch(10).with_gap(5).with_period(2);
        let key = LocalSigner::from_slice(&[7; 32]).unwrap();
        let genesis = sealed(
            &key,
            XdcBlockHeader { nonce: NONCE_DROP_VOTE, timestamp: 100, ..Default::default() },
            &[key.address()],
        );
        let mut chain = Headers::default();
        chain.0.insert(genesis.hash_slow(), genesis.clone());
        (XDPoSV1Engine::new(config), chain, key, genesis)
    }

    #[test]
    fn test_verify_v1_header() {
        let (engine, chain, key, genesis) = setup();
        let header = sealed(
            &key,
            XdcBlockHeader {
                number: 1,
                parent_hash: genesis.hash_slow(),
                timestamp: 102,
                beneficiary: key.address(),
                ..Default::default()
            },
            &[],
        );

        engine.verify_header(&chain, &header, true).unwrap();
        assert_eq!(engine.author(&header).unwrap(), key.address());
        assert_eq!(engine.masternodes_at(&chain, 1), vec![key.address()]);
    }

    #[test]
    fn test_verify_v1_header_rejects() {
        let (engine, chain, key, genesis) = setup();
        let base = XdcBlockHeader {
            number: 1,
            parent_hash: genesis.hash_slow(),
            timestamp: 102,
            ..Default::default()
        };

        let early = sealed(&key, XdcBlockHeader { timestamp: 101, ..base.clone() }, &[]);
        assert_matches!(engine.verify_header(&chain, &early, false), Err(XDPoSError::InvalidTimestamp));

        let signers_outside_checkpoint = sealed(&key, base.clone(), &[key.address()]);
        assert_matches!(
            engine.verify_header(&chain, &signers_outside_checkpoint, false),
            Err(XDPoSError::InvalidCheckpointSigners)
        );

        let orphan = sealed(&key, XdcBlockHeader { parent_hash: B256::repeat_byte(1), ..base.clone() }, &[]);
        assert_matches!(engine.verify_header(&chain, &orphan, false), Err(XDPoSError::UnknownAncestor));

        let outsider = LocalSigner::from_slice(&[8; 32]).unwrap();
        let foreign = sealed(&outsider, base, &[]);
        assert_matches!(
            engine.verify_header(&chain, &foreign, true),
            Err(XDPoSError::ValidatorNotWithinMasternodes)
        );
    }

    #[test]
    fn test_checkpoint_requires_drop_nonce() {
        let (engine, chain, key, genesis) = setup();
        let mut header = sealed(
            &key,
            XdcBlockHeader { number: 10, parent_hash: genesis.hash_slow(), ..Default::default() },
            &[key.address()],
        );
        header.nonce = NONCE_AUTH_VOTE;
        assert_matches!(
            engine.verify_header(&chain, &header, false),
            Err(XDPoSError::InvalidCheckpointVote)
        );
    }
}
