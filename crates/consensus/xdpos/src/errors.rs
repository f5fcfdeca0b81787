//! XDPoS Consensus Errors
//!
//! A closed taxonomy: callers branch on the variant, the payload only carries
//! context for logs.

use crate::v2::Round;
use alloc::string::String;
use alloy_primitives::B256;

/// XDPoS-specific error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XDPoSError {
    /// Unknown block
    #[error("unknown block")]
    UnknownBlock,

    /// Unknown ancestor
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Block in the future
    #[error("block in the future")]
    FutureBlock,

    /// Invalid timestamp
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// Invalid vote nonce
    #[error("invalid vote nonce")]
    InvalidVote,

    /// Epoch switch block carries an auth nonce
    #[error("vote nonce in checkpoint block non-zero")]
    InvalidCheckpointVote,

    /// Non-zero mix digest
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Non-empty uncle hash
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// Epoch switch block without validators
    #[error("empty validators list on epoch switch block")]
    EmptyEpochSwitchValidators,

    /// Validators field is not a list of addresses
    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    /// `validators` or `penalties` populated outside an epoch switch
    #[error("invalid field exist in a non-epoch switch block")]
    InvalidFieldInNonEpochSwitch,

    /// Extra data is not a decodable v2 envelope
    #[error("invalid v2 extra data: {0}")]
    InvalidV2Extra(String),

    /// QC content is invalid
    #[error("invalid QC content: {0}")]
    InvalidQC(String),

    /// QC signatures are invalid
    #[error("invalid QC signatures: {0}")]
    InvalidQCSignatures(String),

    /// TC content is invalid
    #[error("invalid TC content: {0}")]
    InvalidTC(String),

    /// TC signatures are invalid
    #[error("invalid TC signatures: {0}")]
    InvalidTCSignatures(String),

    /// Incoming vote is outside `[current, current + 1]`
    #[error(
        "{kind} message round number: {incoming_round} is too far away from currentRound: {current_round}"
    )]
    IncomingMessageRoundTooFarFromCurrentRound {
        /// Message type
        kind: &'static str,
        /// Round carried by the message
        incoming_round: Round,
        /// Local current round
        current_round: Round,
    },

    /// Incoming timeout is not for the current round
    #[error(
        "{kind} message round number: {incoming_round} does not match currentRound: {current_round}"
    )]
    IncomingMessageRoundNotEqualCurrentRound {
        /// Message type
        kind: &'static str,
        /// Round carried by the message
        incoming_round: Round,
        /// Local current round
        current_round: Round,
    },

    /// Header carries no validator signature
    #[error("no validator signature in header")]
    NoValidatorSignature,

    /// Block author is not a masternode of the epoch
    #[error("validator address is not in the master node list")]
    ValidatorNotWithinMasternodes,

    /// Block author differs from the coinbase
    #[error("coinbase address does not match the recovered validator")]
    CoinbaseAndValidatorMismatch,

    /// Epoch switch validators differ from the locally computed set
    #[error("validators are not legit, possible attack detected: {0}")]
    ValidatorsNotLegit(String),

    /// Epoch switch penalties differ from the locally computed set
    #[error("penalties are not legit, possible attack detected: {0}")]
    PenaltiesNotLegit(String),

    /// Parent is not the block of the highest QC
    #[error("not ready to propose: parent {parent} is not the highest QC block {highest_qc}")]
    NotReadyToPropose {
        /// Parent hash of the header being prepared
        parent: B256,
        /// Hash of the highest QC block
        highest_qc: B256,
    },

    /// Local signer is not a masternode
    #[error("not in the master node list, not supposed to {0}")]
    NotInMasternodeList(&'static str),

    /// No snapshot for the requested gap block
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Epoch switch info cannot be resolved
    #[error("epoch switch info not found for hash {0}")]
    EpochSwitchInfoNotFound(B256),

    /// Engine initialization failed
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Signature is malformed or cannot be recovered
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Block info does not match the chain
    #[error("{0}")]
    BlockInfo(String),

    /// Forensics processing failure
    #[error("{0}")]
    Forensics(String),

    /// RPC argument rejected
    #[error("{0}")]
    Api(String),

    /// Signing failed
    #[error("signer error: {0}")]
    Signer(String),

    /// Persistent store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// No signer has been authorized
    #[error("no signer authorized")]
    NoSigner,

    /// Extra data is shorter than vanity plus seal
    #[error("extra-data 32 byte vanity prefix missing")]
    ExtraDataTooShort,

    /// Missing seal signature
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,
}

/// Result type for XDPoS operations
pub type XDPoSResult<T> = Result<T, XDPoSError>;
