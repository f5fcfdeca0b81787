//! XDC block header with XDPoS validator fields.

use alloc::vec::Vec;
use alloy_primitives::{Address, B64, B256, Bloom, Bytes, Sealable, U256, keccak256};
use alloy_primitives::bytes::BufMut;
use alloy_rlp::{Decodable, Encodable, Header as RlpHeader};

const ADDRESS_LENGTH: usize = 20;

/// XDC block header with XDPoS consensus fields.
///
/// The header extends the 15 classic Ethereum fields with:
/// - `validators`: concatenated 20-byte masternode addresses, set on epoch switch headers only
/// - `validator`: the 65-byte seal produced by the block author
/// - `penalties`: concatenated 20-byte addresses penalized at this epoch switch
///
/// The block hash covers all 18 fields. The seal hash covers every field except `validator`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct XdcBlockHeader {
    /// The Keccak 256-bit hash of the parent block's header, in its entirety.
    pub parent_hash: B256,
    /// The Keccak 256-bit hash of the ommers list portion of this block.
    pub ommers_hash: B256,
    /// The address credited with the block fees.
    pub beneficiary: Address,
    /// Root of the state trie after this block.
    pub state_root: B256,
    /// Root of the transactions trie.
    pub transactions_root: B256,
    /// Root of the receipts trie.
    pub receipts_root: B256,
    /// Bloom filter of the logs produced by this block.
    pub logs_bloom: Bloom,
    /// Block difficulty. XDPoS v2 always uses one.
    pub difficulty: U256,
    /// Block number.
    pub number: u64,
    /// Gas limit of the block.
    pub gas_limit: u64,
    /// Gas used by the block.
    pub gas_used: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Consensus extra data. In v2 this is the versioned round/QC envelope.
    pub extra_data: Bytes,
    /// Reserved, must be zero.
    pub mix_hash: B256,
    /// Vote nonce, either all zero or all `0xff`.
    pub nonce: B64,
    /// Masternodes of the epoch that starts at this header.
    pub validators: Bytes,
    /// Seal signature of the block author.
    pub validator: Bytes,
    /// Masternodes penalized at this epoch switch.
    pub penalties: Bytes,
}

impl Default for XdcBlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            ommers_hash: alloy_consensus::constants::EMPTY_OMMER_ROOT_HASH,
            beneficiary: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Bloom::ZERO,
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
            mix_hash: B256::ZERO,
            nonce: B64::ZERO,
            validators: Bytes::new(),
            validator: Bytes::new(),
            penalties: Bytes::new(),
        }
    }
}

impl XdcBlockHeader {
    /// Computes the block hash: keccak256 over the RLP of all 18 fields.
    pub fn hash_slow(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(&buf)
    }

    /// Computes the hash signed by the block author. The `validator` seal is left out.
    pub fn seal_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode_fields(&mut buf, false);
        keccak256(&buf)
    }

    /// Masternode addresses carried by this header.
    pub fn validator_addresses(&self) -> Vec<Address> {
        addresses_from_bytes(&self.validators)
    }

    /// Penalized addresses carried by this header.
    pub fn penalty_addresses(&self) -> Vec<Address> {
        addresses_from_bytes(&self.penalties)
    }

    fn payload_length(&self, with_seal: bool) -> usize {
        let mut length = self.parent_hash.length() +
            self.ommers_hash.length() +
            self.beneficiary.length() +
            self.state_root.length() +
            self.transactions_root.length() +
            self.receipts_root.length() +
            self.logs_bloom.length() +
            self.difficulty.length() +
            self.number.length() +
            self.gas_limit.length() +
            self.gas_used.length() +
            self.timestamp.length() +
            self.extra_data.length() +
            self.mix_hash.length() +
            self.nonce.length() +
            self.validators.length();
        if with_seal {
            length += self.validator.length();
        }
        length + self.penalties.length()
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_seal: bool) {
        RlpHeader { list: true, payload_length: self.payload_length(with_seal) }.encode(out);
        self.parent_hash.encode(out);
        self.ommers_hash.encode(out);
        self.beneficiary.encode(out);
        self.state_root.encode(out);
        self.transactions_root.encode(out);
        self.receipts_root.encode(out);
        self.logs_bloom.encode(out);
        self.difficulty.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.timestamp.encode(out);
        self.extra_data.encode(out);
        self.mix_hash.encode(out);
        self.nonce.encode(out);
        self.validators.encode(out);
        if with_seal {
            self.validator.encode(out);
        }
        self.penalties.encode(out);
    }
}

/// Splits a concatenation of 20-byte addresses. A trailing partial address is ignored.
pub fn addresses_from_bytes(bytes: &[u8]) -> Vec<Address> {
    bytes.chunks_exact(ADDRESS_LENGTH).map(Address::from_slice).collect()
}

/// Concatenates addresses into the byte layout used by `validators` and `penalties`.
pub fn addresses_to_bytes(addresses: &[Address]) -> Bytes {
    let mut out = Vec::with_capacity(addresses.len() * ADDRESS_LENGTH);
    for address in addresses {
        out.extend_from_slice(address.as_slice());
    }
    out.into()
}

impl Sealable for XdcBlockHeader {
    fn hash_slow(&self) -> B256 {
        Self::hash_slow(self)
    }
}

impl alloy_consensus::BlockHeader for XdcBlockHeader {
    fn parent_hash(&self) -> B256 {
        self.parent_hash
    }

    fn ommers_hash(&self) -> B256 {
        self.ommers_hash
    }

    fn beneficiary(&self) -> Address {
        self.beneficiary
    }

    fn state_root(&self) -> B256 {
        self.state_root
    }

    fn transactions_root(&self) -> B256 {
        self.transactions_root
    }

    fn receipts_root(&self) -> B256 {
        self.receipts_root
    }

    fn withdrawals_root(&self) -> Option<B256> {
        None
    }

    fn logs_bloom(&self) -> Bloom {
        self.logs_bloom
    }

    fn difficulty(&self) -> U256 {
        self.difficulty
    }

    fn number(&self) -> u64 {
        self.number
    }

    fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    fn gas_used(&self) -> u64 {
        self.gas_used
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn mix_hash(&self) -> Option<B256> {
        Some(self.mix_hash)
    }

    fn nonce(&self) -> Option<B64> {
        Some(self.nonce)
    }

    fn base_fee_per_gas(&self) -> Option<u64> {
        None
    }

    fn blob_gas_used(&self) -> Option<u64> {
        None
    }

    fn excess_blob_gas(&self) -> Option<u64> {
        None
    }

    fn parent_beacon_block_root(&self) -> Option<B256> {
        None
    }

    fn requests_hash(&self) -> Option<B256> {
        None
    }

    fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }
}

impl Encodable for XdcBlockHeader {
    fn encode(&self, out: &mut dyn BufMut) {
        self.encode_fields(out, true);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length(true);
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for XdcBlockHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();

        let mut header = Self {
            parent_hash: Decodable::decode(buf)?,
            ommers_hash: Decodable::decode(buf)?,
            beneficiary: Decodable::decode(buf)?,
            state_root: Decodable::decode(buf)?,
            transactions_root: Decodable::decode(buf)?,
            receipts_root: Decodable::decode(buf)?,
            logs_bloom: Decodable::decode(buf)?,
            difficulty: Decodable::decode(buf)?,
            number: Decodable::decode(buf)?,
            gas_limit: Decodable::decode(buf)?,
            gas_used: Decodable::decode(buf)?,
            timestamp: Decodable::decode(buf)?,
            extra_data: Decodable::decode(buf)?,
            mix_hash: Decodable::decode(buf)?,
            nonce: Decodable::decode(buf)?,
            validators: Bytes::new(),
            validator: Bytes::new(),
            penalties: Bytes::new(),
        };

        // Headers relayed by Ethereum-only peers may lack the XDPoS fields.
        if started_len - buf.len() < rlp_head.payload_length {
            header.validators = Decodable::decode(buf)?;
        }
        if started_len - buf.len() < rlp_head.payload_length {
            header.validator = Decodable::decode(buf)?;
        }
        if started_len - buf.len() < rlp_head.payload_length {
            header.penalties = Decodable::decode(buf)?;
        }

        if started_len - buf.len() != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(header)
    }
}
