//! Chain store traits and row types.
//!
//! Every mutation happens inside a [`ChainTxn`] obtained from
//! [`ChainStore::begin`]. A transaction dropped without [`ChainTxn::commit`]
//! is rolled back, so readers never observe a half-written batch.
//!
//! Implementations: [`crate::memory::MemoryChainStore`] here and
//! `SqliteChainStore` in `blkindex-storage`.

use std::collections::HashSet;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::BlkCursor;
use crate::error::IndexerError;
use crate::pow::work_from_bits;
use crate::types::TxType;

/// Primary key of a stored row.
pub type RowId = i64;

// ─── Branch ──────────────────────────────────────────────────────────────────

/// Where a stored block sits relative to the main chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    /// `in_longest = 1`.
    Main,
    /// Anchored, but not on the main chain (`in_longest = 0`).
    Fork,
    /// Ancestry unknown (`in_longest` unset).
    Orphan,
}

impl Branch {
    pub fn from_in_longest(in_longest: Option<bool>) -> Self {
        match in_longest {
            Some(true) => Self::Main,
            Some(false) => Self::Fork,
            None => Self::Orphan,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Fork => "fork",
            Self::Orphan => "orphan",
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Height and cumulative work of an anchored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub height: u64,
    pub chain_work: U256,
}

impl Anchor {
    /// Anchor of a block whose parent is the genesis marker.
    pub fn genesis(bits: u32) -> Self {
        Self {
            height: 0,
            chain_work: work_from_bits(bits),
        }
    }
}

/// The fields of a block row the indexer reasons about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub id: RowId,
    pub hash: String,
    pub prev_hash: String,
    pub prev_id: Option<RowId>,
    pub height: Option<u64>,
    pub chain_work: Option<U256>,
    pub in_longest: Option<bool>,
    pub bits: u32,
    pub time: u32,
}

impl StoredBlock {
    /// `true` once the block's ancestry reaches genesis.
    pub fn is_anchored(&self) -> bool {
        self.anchor().is_some()
    }

    pub fn anchor(&self) -> Option<Anchor> {
        Some(Anchor {
            height: self.height?,
            chain_work: self.chain_work?,
        })
    }

    /// Anchor for a child with `bits`, if this block is anchored.
    pub fn child_anchor(&self, bits: u32) -> Option<Anchor> {
        let anchor = self.anchor()?;
        Some(Anchor {
            height: anchor.height + 1,
            chain_work: anchor.chain_work.saturating_add(work_from_bits(bits)),
        })
    }

    pub fn branch(&self) -> Branch {
        Branch::from_in_longest(self.in_longest)
    }

    /// Apply an anchor in place (mirrors [`ChainTxn::anchor_block`]).
    pub fn anchored(mut self, prev_id: RowId, anchor: Anchor) -> Self {
        self.prev_id = Some(prev_id);
        self.height = Some(anchor.height);
        self.chain_work = Some(anchor.chain_work);
        self.in_longest = Some(false);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    pub hash: String,
    pub prev_hash: String,
    pub prev_id: Option<RowId>,
    pub merkle_root: String,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: u32,
    pub size: u32,
    pub tx_count: u32,
    /// `None` stores the block as an orphan.
    pub anchor: Option<Anchor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTx {
    pub block_id: RowId,
    pub hash: String,
    pub version: u32,
    pub lock_time: u32,
    pub tx_type: TxType,
    pub size: u32,
    pub time: u32,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTxOut {
    pub tx_id: RowId,
    pub position: u32,
    pub value: u64,
    pub script: Vec<u8>,
    /// Resolved to an address row with get-or-create semantics.
    pub address: String,
    pub color: u32,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTxIn {
    pub tx_id: RowId,
    pub position: u32,
    pub txout_id: Option<RowId>,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

// ─── Orphan checkpoint rows ──────────────────────────────────────────────────

/// A block waiting for `parent_hash` to be anchored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrphanLink {
    pub parent_hash: String,
    pub block_hash: String,
}

/// An input of an orphan block whose previous output is not yet known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTxIn {
    pub txin_id: RowId,
    pub block_hash: String,
    pub prev_hash: String,
    pub prev_position: u32,
}

/// Persisted orphan state, as loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSnapshot {
    pub links: Vec<OrphanLink>,
    pub inputs: Vec<PendingTxIn>,
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A chain store that hands out atomic write transactions.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Start a write transaction.
    async fn begin(&self) -> Result<Box<dyn ChainTxn>, IndexerError>;

    /// Newest cursor row for `dirname`, if any.
    async fn latest_cursor(&self, dirname: &str) -> Result<Option<BlkCursor>, IndexerError>;

    /// The orphan checkpoint written by the last committed batch.
    async fn load_orphans(&self) -> Result<OrphanSnapshot, IndexerError>;
}

/// One atomic unit of chain-store mutations.
#[async_trait]
pub trait ChainTxn: Send {
    async fn block_by_hash(&mut self, hash: &str) -> Result<Option<StoredBlock>, IndexerError>;

    async fn block_by_id(&mut self, id: RowId) -> Result<Option<StoredBlock>, IndexerError>;

    /// The anchored block with the greatest chain work; ties go to the
    /// lowest hash.
    async fn best_block(&mut self) -> Result<Option<StoredBlock>, IndexerError>;

    /// Children of `parent` with `in_longest = 1`. `None` asks for anchored
    /// root blocks (no parent row) on the main chain.
    async fn longest_children(
        &mut self,
        parent: Option<RowId>,
    ) -> Result<Vec<StoredBlock>, IndexerError>;

    async fn insert_block(&mut self, block: &NewBlock) -> Result<RowId, IndexerError>;

    /// Attach an orphan to its parent: sets `prev_block`, height, chain work,
    /// `in_longest = 0`, and marks its transactions and outputs valid.
    async fn anchor_block(
        &mut self,
        id: RowId,
        prev_id: RowId,
        anchor: &Anchor,
    ) -> Result<(), IndexerError>;

    async fn set_in_longest(
        &mut self,
        id: RowId,
        in_longest: Option<bool>,
    ) -> Result<(), IndexerError>;

    async fn insert_tx(&mut self, tx: &NewTx) -> Result<RowId, IndexerError>;

    /// `(tx_id, block_id)` of every stored transaction with `hash`.
    async fn txs_by_hash(&mut self, hash: &str) -> Result<Vec<(RowId, RowId)>, IndexerError>;

    async fn txout_id(&mut self, tx_id: RowId, position: u32)
        -> Result<Option<RowId>, IndexerError>;

    async fn insert_txout(&mut self, out: &NewTxOut) -> Result<RowId, IndexerError>;

    async fn insert_txin(&mut self, input: &NewTxIn) -> Result<RowId, IndexerError>;

    async fn set_txin_txout(&mut self, txin_id: RowId, txout_id: RowId)
        -> Result<(), IndexerError>;

    /// Recompute `spent` for outputs owned by, or consumed from, `block_ids`.
    async fn refresh_spent(&mut self, block_ids: &[RowId]) -> Result<(), IndexerError>;

    /// Insert (`id == None`) or update a cursor row; returns its id.
    async fn save_cursor(&mut self, cursor: &BlkCursor) -> Result<RowId, IndexerError>;

    /// Replace the orphan checkpoint.
    async fn replace_orphans(&mut self, snapshot: &OrphanSnapshot) -> Result<(), IndexerError>;

    async fn commit(&mut self) -> Result<(), IndexerError>;

    /// Locate the transaction `tx_hash` on the branch ending at `start`.
    ///
    /// A single stored candidate is returned as is. With several candidates
    /// (the same transaction mined on different forks) the ancestry of
    /// `start` is walked, `start` included, and the first block owning a
    /// candidate wins.
    async fn find_tx_on_branch(
        &mut self,
        tx_hash: &str,
        start: RowId,
    ) -> Result<Option<RowId>, IndexerError> {
        let candidates = self.txs_by_hash(tx_hash).await?;
        match candidates.as_slice() {
            [] => return Ok(None),
            [(tx_id, _)] => return Ok(Some(*tx_id)),
            _ => {}
        }
        let mut seen = HashSet::new();
        let mut next = Some(start);
        while let Some(block_id) = next {
            if !seen.insert(block_id) {
                break;
            }
            if let Some((tx_id, _)) = candidates.iter().find(|(_, b)| *b == block_id) {
                return Ok(Some(*tx_id));
            }
            next = self.block_by_id(block_id).await?.and_then(|b| b.prev_id);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(height: Option<u64>, work: Option<u64>) -> StoredBlock {
        StoredBlock {
            id: 1,
            hash: "aa".into(),
            prev_hash: "00".into(),
            prev_id: None,
            height,
            chain_work: work.map(U256::from),
            in_longest: None,
            bits: crate::fixtures::EASY_BITS,
            time: 0,
        }
    }

    #[test]
    fn child_anchor_adds_height_and_work() {
        let parent = stored(Some(9), Some(20));
        let child = parent.child_anchor(crate::fixtures::EASY_BITS).unwrap();
        assert_eq!(child.height, 10);
        assert_eq!(child.chain_work, U256::from(22u64));
    }

    #[test]
    fn orphan_has_no_child_anchor() {
        let orphan = stored(None, None);
        assert!(!orphan.is_anchored());
        assert!(orphan.child_anchor(crate::fixtures::EASY_BITS).is_none());
        assert_eq!(orphan.branch(), Branch::Orphan);
    }

    #[test]
    fn branch_labels() {
        assert_eq!(Branch::from_in_longest(Some(true)).as_str(), "main");
        assert_eq!(Branch::from_in_longest(Some(false)).to_string(), "fork");
    }
}
