//! Decoded block-file records.

use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::script_to_address;
use crate::codec::Encode;
use crate::pow::work_from_bits;

// ─── Hash256 ─────────────────────────────────────────────────────────────────

/// A 32-byte hash in on-disk (little-endian) byte order.
///
/// `Display` and [`Hash256::to_hex`] render the byte-reversed form used by
/// explorers and RPC.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Double SHA-256 of `data`, in on-disk order.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        Self(second.into())
    }

    /// Returns `true` for the all-zero marker (genesis parent, mint inputs).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Display hex (byte-reversed).
    pub fn to_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }

    /// Parse a display hex string back into on-disk order.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

// ─── Block header ────────────────────────────────────────────────────────────

/// The fixed 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block hash: double SHA-256 over the serialized header.
    pub fn hash(&self) -> Hash256 {
        Hash256::double_sha256(&self.to_bytes())
    }

    /// Proof-of-work contributed by this block alone.
    pub fn work(&self) -> U256 {
        work_from_bits(self.bits)
    }

    /// Returns `true` if this header claims the genesis marker as its parent.
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Transaction kinds carried in the trailing `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Normal,
    Mint,
    License,
    Vote,
    BanVote,
    Match,
    Cancel,
    Unknown(u32),
}

impl From<u32> for TxType {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::Mint,
            2 => Self::License,
            3 => Self::Vote,
            4 => Self::BanVote,
            5 => Self::Match,
            6 => Self::Cancel,
            other => Self::Unknown(other),
        }
    }
}

impl From<TxType> for u32 {
    fn from(ty: TxType) -> Self {
        match ty {
            TxType::Normal => 0,
            TxType::Mint => 1,
            TxType::License => 2,
            TxType::Vote => 3,
            TxType::BanVote => 4,
            TxType::Match => 5,
            TxType::Cancel => 6,
            TxType::Unknown(code) => code,
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Mint => write!(f, "MINT"),
            Self::License => write!(f, "LICENSE"),
            Self::Vote => write!(f, "VOTE"),
            Self::BanVote => write!(f, "BANVOTE"),
            Self::Match => write!(f, "MATCH"),
            Self::Cancel => write!(f, "CANCEL"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_hash: Hash256,
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Mint and coinbase inputs reference no previous transaction.
    pub fn is_mint(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    /// Asset tag of this output.
    pub color: u32,
}

impl TxOutput {
    /// Address string for the output script; empty for non-standard scripts.
    pub fn address(&self) -> String {
        script_to_address(&self.script_pubkey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTx {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub tx_type: TxType,
}

impl RawTx {
    /// Transaction id: double SHA-256 of the re-serialized transaction.
    pub fn txid(&self) -> Hash256 {
        Hash256::double_sha256(&self.to_bytes())
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// One decoded blk-file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub magic: u32,
    /// Size of the block payload as declared by the record prefix.
    pub size: u32,
    pub header: BlockHeader,
    pub txs: Vec<RawTx>,
    /// Trailing block signature; empty when the record carries none.
    pub signature: Vec<u8>,
}

impl RawBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}
