//! Scenario tests for the XDPoS engine
//!
//! Each module drives a [`TestEnv`](crate::test_utils::TestEnv): a v1 chain up
//! to block 10, five masternodes and a v2 engine started at the switch block.

mod engine_tests;
mod hooks_tests;

use crate::{
    signer::{LocalSigner, Signer},
    test_utils::TestEnv,
};
use alloc::sync::Arc;

/// Authorize masternode `index` on the environment's engine
fn authorize(env: &TestEnv, index: usize) {
    env.engine.authorize(Arc::new(env.signers[index].clone()));
}

/// A key that is not a masternode
fn outsider() -> Arc<dyn Signer> {
    Arc::new(LocalSigner::from_slice(&[0x99; 32]).unwrap())
}
