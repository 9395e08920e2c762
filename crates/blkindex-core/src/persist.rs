//! Block persistence: turns decoded blocks into store rows.
//!
//! The CPU-bound part (transaction hashing, address derivation) can be fanned
//! out to blocking workers. Rows are always written in file order through the
//! single batch transaction.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::orphan::OrphanTracker;
use crate::store::{Anchor, ChainTxn, NewBlock, NewTx, NewTxIn, NewTxOut, PendingTxIn, RowId};
use crate::types::{RawBlock, RawTx};

/// Derived values of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    pub txid: String,
    pub size: u32,
    /// One address per output, in output order.
    pub addresses: Vec<String>,
}

impl PreparedTx {
    pub fn from_tx(tx: &RawTx) -> Self {
        Self {
            txid: tx.txid().to_hex(),
            size: tx.size() as u32,
            addresses: tx.outputs.iter().map(|o| o.address()).collect(),
        }
    }
}

/// Counters for one persisted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Blocks inserted.
    pub inserted: usize,
    /// Blocks already stored and skipped.
    pub skipped: usize,
    /// Inserted blocks left without a known ancestry.
    pub orphaned: usize,
    /// Previously orphaned blocks anchored by this batch.
    pub anchored: usize,
    /// Inputs stored without a previous output.
    pub unresolved_inputs: usize,
    /// Ids of every inserted or anchored block.
    pub touched: Vec<RowId>,
}

/// Writes blocks, transactions, outputs and inputs for a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockPersister {
    workers: usize,
}

impl BlockPersister {
    /// `workers == 0` prepares transactions inline.
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Hash every transaction of `blocks` and derive output addresses.
    pub async fn prepare(&self, blocks: &[RawBlock]) -> Result<Vec<Vec<PreparedTx>>, IndexerError> {
        if self.workers == 0 {
            return Ok(blocks
                .iter()
                .map(|b| b.txs.iter().map(PreparedTx::from_tx).collect())
                .collect());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let results: Arc<Mutex<Vec<(usize, usize, PreparedTx)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for (block_idx, block) in blocks.iter().enumerate() {
            for (tx_idx, tx) in block.txs.iter().enumerate() {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| IndexerError::Other(e.to_string()))?;
                let results = Arc::clone(&results);
                let tx = tx.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    let prepared = PreparedTx::from_tx(&tx);
                    results
                        .lock()
                        .unwrap()
                        .push((block_idx, tx_idx, prepared));
                    drop(permit);
                }));
            }
        }

        for joined in futures::future::join_all(handles).await {
            joined.map_err(|e| IndexerError::Other(format!("prepare worker failed: {e}")))?;
        }

        let mut flat = std::mem::take(&mut *results.lock().unwrap());
        flat.sort_by_key(|(b, t, _)| (*b, *t));
        let mut prepared: Vec<Vec<PreparedTx>> =
            blocks.iter().map(|b| Vec::with_capacity(b.txs.len())).collect();
        for (block_idx, _, tx) in flat {
            prepared[block_idx].push(tx);
        }
        Ok(prepared)
    }

    /// Persist `blocks` in order inside `txn`.
    pub async fn persist(
        &self,
        txn: &mut dyn ChainTxn,
        orphans: &mut OrphanTracker,
        blocks: &[RawBlock],
    ) -> Result<PersistReport, IndexerError> {
        let prepared = self.prepare(blocks).await?;
        let mut report = PersistReport::default();
        for (block, txs) in blocks.iter().zip(&prepared) {
            self.persist_block(txn, orphans, block, txs, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn persist_block(
        &self,
        txn: &mut dyn ChainTxn,
        orphans: &mut OrphanTracker,
        block: &RawBlock,
        prepared: &[PreparedTx],
        report: &mut PersistReport,
    ) -> Result<(), IndexerError> {
        let hash = block.hash().to_hex();
        if txn.block_by_hash(&hash).await?.is_some() {
            debug!(block = %hash, "block already stored");
            report.skipped += 1;
            return Ok(());
        }

        let header = &block.header;
        let prev_hash = header.prev_hash.to_hex();
        let parent = if header.is_genesis() {
            None
        } else {
            txn.block_by_hash(&prev_hash).await?
        };
        let anchor = if header.is_genesis() {
            Some(Anchor::genesis(header.bits))
        } else {
            parent.as_ref().and_then(|p| p.child_anchor(header.bits))
        };
        let valid = anchor.is_some();

        let block_id = txn
            .insert_block(&NewBlock {
                hash: hash.clone(),
                prev_hash: prev_hash.clone(),
                prev_id: parent.as_ref().map(|p| p.id),
                merkle_root: header.merkle_root.to_hex(),
                time: header.time,
                bits: header.bits,
                nonce: header.nonce,
                version: header.version,
                size: block.size,
                tx_count: block.txs.len() as u32,
                anchor,
            })
            .await?;
        report.inserted += 1;
        report.touched.push(block_id);

        if valid {
            debug!(
                block = %hash,
                height = anchor.map(|a| a.height),
                txs = block.txs.len(),
                "block stored"
            );
        } else {
            warn!(block = %hash, parent = %prev_hash, "parent unknown, block stored as orphan");
            orphans.record(prev_hash, hash.clone());
            report.orphaned += 1;
        }

        for (tx, prep) in block.txs.iter().zip(prepared) {
            let tx_id = txn
                .insert_tx(&NewTx {
                    block_id,
                    hash: prep.txid.clone(),
                    version: tx.version,
                    lock_time: tx.lock_time,
                    tx_type: tx.tx_type,
                    size: prep.size,
                    time: header.time,
                    valid,
                })
                .await?;

            for (position, (out, address)) in tx.outputs.iter().zip(&prep.addresses).enumerate() {
                txn.insert_txout(&NewTxOut {
                    tx_id,
                    position: position as u32,
                    value: out.value,
                    script: out.script_pubkey.clone(),
                    address: address.clone(),
                    color: out.color,
                    valid,
                })
                .await?;
            }

            for (position, input) in tx.inputs.iter().enumerate() {
                let prev_tx = input.prev_hash.to_hex();
                let txout_id = if input.is_mint() {
                    None
                } else {
                    match txn.find_tx_on_branch(&prev_tx, block_id).await? {
                        Some(prev_id) => txn.txout_id(prev_id, input.prev_index).await?,
                        None => None,
                    }
                };
                let txin_id = txn
                    .insert_txin(&NewTxIn {
                        tx_id,
                        position: position as u32,
                        txout_id,
                        script_sig: input.script_sig.clone(),
                        sequence: input.sequence,
                    })
                    .await?;

                if txout_id.is_some() || input.is_mint() {
                    continue;
                }
                report.unresolved_inputs += 1;
                if valid {
                    warn!(
                        tx = %prep.txid,
                        prev_tx = %prev_tx,
                        prev_position = input.prev_index,
                        "previous output not found"
                    );
                } else {
                    orphans.defer_input(PendingTxIn {
                        txin_id,
                        block_hash: hash.clone(),
                        prev_hash: prev_tx,
                        prev_position: input.prev_index,
                    });
                }
            }
        }

        if valid {
            if let Some(stored) = txn.block_by_id(block_id).await? {
                report.anchored += orphans
                    .resolve(txn, &stored, &mut report.touched)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ChainBuilder;
    use crate::memory::MemoryChainStore;
    use crate::store::ChainStore;

    #[tokio::test]
    async fn parallel_prepare_keeps_order() {
        let mut builder = ChainBuilder::new();
        let mut blocks = builder.linear(3);
        let extra: Vec<RawTx> = (1..6).map(|s| builder.mint_tx(s, 10, 1)).collect();
        blocks[1].txs.extend(extra);

        let sequential = BlockPersister::new(0).prepare(&blocks).await.unwrap();
        let parallel = BlockPersister::new(3).prepare(&blocks).await.unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(parallel[1].len(), 6);
    }

    #[tokio::test]
    async fn spend_in_same_block_resolves() {
        let mut builder = ChainBuilder::new();
        let mint = builder.mint_tx(1, 1_000, 3);
        let spend = builder.spend_tx(&mint, 0, 2);
        let genesis = builder.block(crate::types::Hash256::ZERO, vec![mint.clone(), spend.clone()]);

        let store = MemoryChainStore::new();
        let mut txn = store.begin().await.unwrap();
        let mut orphans = OrphanTracker::new();
        let report = BlockPersister::new(0)
            .persist(txn.as_mut(), &mut orphans, std::slice::from_ref(&genesis))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.unresolved_inputs, 0);
        let block_hash = genesis.hash().to_hex();
        let source = store.input_source(&block_hash, &spend.txid().to_hex(), 0);
        assert_eq!(source, Some(mint.txid().to_hex()));
    }

    #[tokio::test]
    async fn orphan_inputs_are_deferred_then_resolved() {
        let mut builder = ChainBuilder::new();
        let genesis = builder.genesis();
        let a = builder.child_of(&genesis);
        let spend = builder.spend_tx(&a.txs[0], 0, 9);
        let b = builder.block(a.hash(), vec![spend.clone()]);

        let store = MemoryChainStore::new();
        let persister = BlockPersister::new(0);
        let mut orphans = OrphanTracker::new();

        let mut txn = store.begin().await.unwrap();
        let report = persister
            .persist(txn.as_mut(), &mut orphans, &[genesis, b.clone()])
            .await
            .unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(orphans.pending_inputs(), 1);

        let report = persister
            .persist(txn.as_mut(), &mut orphans, std::slice::from_ref(&a))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert_eq!(report.anchored, 1);
        assert!(orphans.is_empty());
        assert_eq!(orphans.pending_inputs(), 0);

        let b_row = store.block(&b.hash().to_hex()).unwrap();
        assert_eq!(b_row.height, Some(2));
        assert_eq!(store.tx_validity(&spend.txid().to_hex()), vec![true]);
        let source = store.input_source(&b.hash().to_hex(), &spend.txid().to_hex(), 0);
        assert_eq!(source, Some(a.txs[0].txid().to_hex()));
    }

    #[tokio::test]
    async fn stored_blocks_are_skipped() {
        let blocks = ChainBuilder::new().linear(2);
        let store = MemoryChainStore::new();
        let mut txn = store.begin().await.unwrap();
        let mut orphans = OrphanTracker::new();
        let persister = BlockPersister::new(0);
        persister
            .persist(txn.as_mut(), &mut orphans, &blocks)
            .await
            .unwrap();
        let again = persister
            .persist(txn.as_mut(), &mut orphans, &blocks)
            .await
            .unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 2);
    }
}
