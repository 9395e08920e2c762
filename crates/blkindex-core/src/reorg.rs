//! Main-chain maintenance.
//!
//! After each batch the block with the most cumulative work becomes the main
//! chain tip. Its ancestry is promoted to `in_longest = 1` down to the first
//! block already on the main chain (the fork point), and the old main chain
//! above the fork point is demoted to `in_longest = 0`.
//!
//! ```text
//!            ┌── a1 ── a2            (old main, demoted)
//!   g ── f ──┤
//!            └── b1 ── b2 ── b3      (heavier, promoted)
//! ```

use tracing::{debug, info};

use crate::error::IndexerError;
use crate::store::{ChainTxn, RowId, StoredBlock};

/// What a resolution pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorgOutcome {
    /// Hash of the main-chain tip after the pass.
    pub tip: Option<String>,
    /// Blocks moved onto the main chain, tip first.
    pub promoted: Vec<String>,
    /// Blocks moved off the main chain, nearest to the fork point first.
    pub demoted: Vec<String>,
    /// Last block shared by the old and new main chain.
    pub fork_point: Option<String>,
}

impl ReorgOutcome {
    /// `true` if blocks left the main chain.
    pub fn is_reorg(&self) -> bool {
        !self.demoted.is_empty()
    }

    /// Reorg depth (number of blocks demoted).
    pub fn depth(&self) -> usize {
        self.demoted.len()
    }
}

/// Moves `in_longest` so that the main chain ends at the heaviest block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainResolver;

impl ChainResolver {
    pub fn new() -> Self {
        Self
    }

    /// Run one resolution pass inside `txn`.
    ///
    /// Ids of every promoted and demoted block, plus the fork point, are
    /// appended to `touched`.
    pub async fn resolve(
        &self,
        txn: &mut dyn ChainTxn,
        touched: &mut Vec<RowId>,
    ) -> Result<ReorgOutcome, IndexerError> {
        let Some(best) = txn.best_block().await? else {
            return Ok(ReorgOutcome::default());
        };
        let mut outcome = ReorgOutcome {
            tip: Some(best.hash.clone()),
            ..ReorgOutcome::default()
        };

        // Promote from the tip down to the fork point.
        let mut promoted: Vec<StoredBlock> = Vec::new();
        let mut fork_point: Option<StoredBlock> = None;
        let mut cursor = Some(best);
        while let Some(block) = cursor {
            if block.in_longest == Some(true) {
                fork_point = Some(block);
                break;
            }
            txn.set_in_longest(block.id, Some(true)).await?;
            touched.push(block.id);
            cursor = match block.prev_id {
                Some(prev_id) => txn.block_by_id(prev_id).await?,
                None => None,
            };
            promoted.push(block);
        }

        let Some(new_next) = promoted.last().map(|b| b.id) else {
            debug!(tip = ?outcome.tip, "main chain unchanged");
            return Ok(outcome);
        };
        if let Some(fork) = &fork_point {
            touched.push(fork.id);
        }

        // Demote the old main chain above the fork point.
        let mut parent = fork_point.as_ref().map(|b| b.id);
        let mut exclude = Some(new_next);
        loop {
            let siblings: Vec<StoredBlock> = txn
                .longest_children(parent)
                .await?
                .into_iter()
                .filter(|b| Some(b.id) != exclude)
                .collect();
            let old = match siblings.as_slice() {
                [] => break,
                [old] => old.clone(),
                _ => {
                    let block_hash = match parent {
                        Some(id) => txn
                            .block_by_id(id)
                            .await?
                            .map(|b| b.hash)
                            .unwrap_or_default(),
                        None => "genesis".to_string(),
                    };
                    return Err(IndexerError::ForkConflict {
                        block_hash,
                        count: siblings.len(),
                    });
                }
            };
            txn.set_in_longest(old.id, Some(false)).await?;
            touched.push(old.id);
            parent = Some(old.id);
            exclude = None;
            outcome.demoted.push(old.hash);
        }

        outcome.promoted = promoted.into_iter().map(|b| b.hash).collect();
        outcome.fork_point = fork_point.map(|b| b.hash);

        if outcome.is_reorg() {
            info!(
                tip = ?outcome.tip,
                fork_point = ?outcome.fork_point,
                promoted = outcome.promoted.len(),
                demoted = outcome.depth(),
                "chain reorganization"
            );
        } else {
            debug!(
                tip = ?outcome.tip,
                promoted = outcome.promoted.len(),
                "main chain extended"
            );
        }
        Ok(outcome)
    }
}
