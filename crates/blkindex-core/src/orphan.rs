//! Orphan tracker.
//!
//! Blocks whose parent is not yet stored are kept as orphans (no height, no
//! chain work, `in_longest` unset). When the parent is anchored, every
//! waiting descendant is anchored in turn with an explicit stack, so arbitrarily
//! long orphan chains do not grow the call stack.
//!
//! The tracker is plain data owned by the ingestion driver. It is written to
//! the store with every batch and reloaded at startup.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::store::{ChainTxn, OrphanLink, OrphanSnapshot, PendingTxIn, RowId, StoredBlock};

/// Pending orphan blocks keyed by the hash of the parent they wait for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanTracker {
    pending: HashMap<String, BTreeSet<String>>,
    inputs: HashMap<String, Vec<PendingTxIn>>,
}

impl OrphanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the tracker from a persisted checkpoint.
    pub fn from_snapshot(snapshot: OrphanSnapshot) -> Self {
        let mut tracker = Self::new();
        for link in snapshot.links {
            tracker.record(link.parent_hash, link.block_hash);
        }
        for input in snapshot.inputs {
            tracker.defer_input(input);
        }
        tracker
    }

    /// Remember that `block_hash` waits for `parent_hash`.
    pub fn record(&mut self, parent_hash: impl Into<String>, block_hash: impl Into<String>) {
        self.pending
            .entry(parent_hash.into())
            .or_default()
            .insert(block_hash.into());
    }

    /// Remember an input of an orphan block to resolve once it is anchored.
    pub fn defer_input(&mut self, input: PendingTxIn) {
        self.inputs
            .entry(input.block_hash.clone())
            .or_default()
            .push(input);
    }

    /// Number of orphan blocks waiting for a parent.
    pub fn len(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// `true` if `block_hash` is waiting for a parent.
    pub fn contains(&self, block_hash: &str) -> bool {
        self.pending.values().any(|children| children.contains(block_hash))
    }

    /// Number of deferred inputs.
    pub fn pending_inputs(&self) -> usize {
        self.inputs.values().map(Vec::len).sum()
    }

    /// Deterministic view of the tracker, as persisted.
    pub fn snapshot(&self) -> OrphanSnapshot {
        let mut links: Vec<OrphanLink> = self
            .pending
            .iter()
            .flat_map(|(parent, children)| {
                children.iter().map(move |child| OrphanLink {
                    parent_hash: parent.clone(),
                    block_hash: child.clone(),
                })
            })
            .collect();
        links.sort();
        let mut inputs: Vec<PendingTxIn> = self.inputs.values().flatten().cloned().collect();
        inputs.sort_by_key(|i| i.txin_id);
        OrphanSnapshot { links, inputs }
    }

    /// Write the current state into `txn`.
    pub async fn checkpoint(&self, txn: &mut dyn ChainTxn) -> Result<(), IndexerError> {
        txn.replace_orphans(&self.snapshot()).await
    }

    /// Anchor every orphan descending from the anchored block `parent`.
    ///
    /// Anchored block ids are appended to `touched`. Returns the number of
    /// blocks anchored.
    pub async fn resolve(
        &mut self,
        txn: &mut dyn ChainTxn,
        parent: &StoredBlock,
        touched: &mut Vec<RowId>,
    ) -> Result<usize, IndexerError> {
        let mut anchored = 0;
        let mut stack = vec![parent.clone()];

        while let Some(parent) = stack.pop() {
            let Some(children) = self.pending.remove(&parent.hash) else {
                continue;
            };
            for child_hash in children {
                let Some(child) = txn.block_by_hash(&child_hash).await? else {
                    warn!(block = %child_hash, parent = %parent.hash, "orphan block missing from store");
                    continue;
                };
                let Some(anchor) = parent.child_anchor(child.bits) else {
                    return Err(IndexerError::Other(format!(
                        "cannot anchor {child_hash}: parent {} is not anchored",
                        parent.hash
                    )));
                };

                txn.anchor_block(child.id, parent.id, &anchor).await?;
                touched.push(child.id);
                anchored += 1;
                debug!(
                    block = %child.hash,
                    height = anchor.height,
                    "orphan anchored"
                );

                self.resolve_inputs(txn, &child).await?;
                stack.push(child.anchored(parent.id, anchor));
            }
        }

        Ok(anchored)
    }

    async fn resolve_inputs(
        &mut self,
        txn: &mut dyn ChainTxn,
        block: &StoredBlock,
    ) -> Result<(), IndexerError> {
        let Some(inputs) = self.inputs.remove(&block.hash) else {
            return Ok(());
        };
        for input in inputs {
            let txout = match txn.find_tx_on_branch(&input.prev_hash, block.id).await? {
                Some(tx_id) => txn.txout_id(tx_id, input.prev_position).await?,
                None => None,
            };
            match txout {
                Some(txout_id) => txn.set_txin_txout(input.txin_id, txout_id).await?,
                None => warn!(
                    block = %block.hash,
                    prev_tx = %input.prev_hash,
                    prev_position = input.prev_position,
                    "input still unresolved after anchoring"
                ),
            }
        }
        Ok(())
    }
}
