//! XDC primitive types shared by the XDPoS consensus engine.
//!
//! The XDC header carries three consensus fields on top of the Ethereum header:
//! the epoch validator list, the block producer seal and the penalty list.

#![doc(issue_tracker_base_url = "https://github.com/XinFinOrg/xdpos-rs/issues/")]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod header;
pub use header::{XdcBlockHeader, addresses_from_bytes, addresses_to_bytes};

pub use alloy_consensus::constants::EMPTY_OMMER_ROOT_HASH;
pub use alloy_primitives::{Address, B64, B256, BlockHash, Bloom, Bytes, U256};

/// Nonce of a header that casts an authorization vote.
pub const NONCE_AUTH_VOTE: B64 = B64::new([0xff; 8]);

/// Nonce of a header that casts a drop vote. Epoch switch headers must carry it.
pub const NONCE_DROP_VOTE: B64 = B64::ZERO;

/// Length in bytes of a recoverable secp256k1 signature (`r || s || v`).
pub const SIGNATURE_LENGTH: usize = 65;
