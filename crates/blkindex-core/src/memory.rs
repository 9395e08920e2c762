//! In-memory chain store.
//!
//! Holds the full row graph in RAM. A transaction works on a private copy of
//! the state and swaps it in on commit, so a dropped transaction leaves the
//! store untouched. Useful for tests and short-lived indexers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cursor::BlkCursor;
use crate::error::IndexerError;
use crate::store::{
    Anchor, ChainStore, ChainTxn, NewBlock, NewTx, NewTxIn, NewTxOut, OrphanSnapshot, RowId,
    StoredBlock,
};

#[derive(Debug, Clone)]
struct TxRow {
    id: RowId,
    tx: NewTx,
}

#[derive(Debug, Clone)]
struct TxOutRow {
    id: RowId,
    out: NewTxOut,
    spent: Option<bool>,
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    next_id: RowId,
    blocks: BTreeMap<RowId, StoredBlock>,
    block_ids: HashMap<String, RowId>,
    txs: BTreeMap<RowId, TxRow>,
    txouts: BTreeMap<RowId, TxOutRow>,
    txins: BTreeMap<RowId, NewTxIn>,
    addresses: HashMap<String, RowId>,
    cursors: BTreeMap<RowId, BlkCursor>,
    orphans: OrphanSnapshot,
}

impl ChainState {
    fn alloc(&mut self) -> RowId {
        self.next_id += 1;
        self.next_id
    }

    fn block_in_longest(&self, id: RowId) -> bool {
        self.blocks
            .get(&id)
            .map(|b| b.in_longest == Some(true))
            .unwrap_or(false)
    }

    fn tx_block(&self, tx_id: RowId) -> Option<RowId> {
        self.txs.get(&tx_id).map(|t| t.tx.block_id)
    }
}

/// Chain store kept entirely in RAM.
#[derive(Debug, Clone, Default)]
pub struct MemoryChainStore {
    state: Arc<Mutex<ChainState>>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed block row for `hash`.
    pub fn block(&self, hash: &str) -> Option<StoredBlock> {
        let state = self.state.lock().unwrap();
        let id = state.block_ids.get(hash)?;
        state.blocks.get(id).cloned()
    }

    /// All committed blocks in insertion order.
    pub fn blocks(&self) -> Vec<StoredBlock> {
        self.state.lock().unwrap().blocks.values().cloned().collect()
    }

    /// Hashes of the main chain ordered by height.
    pub fn main_chain(&self) -> Vec<String> {
        let mut main: Vec<StoredBlock> = self
            .blocks()
            .into_iter()
            .filter(|b| b.in_longest == Some(true))
            .collect();
        main.sort_by_key(|b| b.height);
        main.into_iter().map(|b| b.hash).collect()
    }

    /// `(valid, spent)` of output `position` of `tx_hash` in `block_hash`.
    pub fn output_state(
        &self,
        block_hash: &str,
        tx_hash: &str,
        position: u32,
    ) -> Option<(bool, Option<bool>)> {
        let state = self.state.lock().unwrap();
        let block_id = *state.block_ids.get(block_hash)?;
        let tx = state
            .txs
            .values()
            .find(|t| t.tx.block_id == block_id && t.tx.hash == tx_hash)?;
        state
            .txouts
            .values()
            .find(|o| o.out.tx_id == tx.id && o.out.position == position)
            .map(|o| (o.out.valid, o.spent))
    }

    /// Hash of the transaction whose output feeds input `position` of
    /// `tx_hash` in `block_hash`; `None` when the input is unresolved.
    pub fn input_source(&self, block_hash: &str, tx_hash: &str, position: u32) -> Option<String> {
        let state = self.state.lock().unwrap();
        let block_id = *state.block_ids.get(block_hash)?;
        let tx = state
            .txs
            .values()
            .find(|t| t.tx.block_id == block_id && t.tx.hash == tx_hash)?;
        let txin = state
            .txins
            .values()
            .find(|i| i.tx_id == tx.id && i.position == position)?;
        let out = state.txouts.get(&txin.txout_id?)?;
        state.txs.get(&out.out.tx_id).map(|t| t.tx.hash.clone())
    }

    /// Validity flags of every stored copy of `tx_hash`.
    pub fn tx_validity(&self, tx_hash: &str) -> Vec<bool> {
        let state = self.state.lock().unwrap();
        state
            .txs
            .values()
            .filter(|t| t.tx.hash == tx_hash)
            .map(|t| t.tx.valid)
            .collect()
    }

    /// Number of distinct addresses seen.
    pub fn address_count(&self) -> usize {
        self.state.lock().unwrap().addresses.len()
    }

    /// All cursor rows for `dirname`, oldest first.
    pub fn cursors(&self, dirname: &str) -> Vec<BlkCursor> {
        let state = self.state.lock().unwrap();
        state
            .cursors
            .values()
            .filter(|c| c.dirname == dirname)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn begin(&self) -> Result<Box<dyn ChainTxn>, IndexerError> {
        let work = self.state.lock().unwrap().clone();
        Ok(Box::new(MemoryTxn {
            shared: Arc::clone(&self.state),
            work,
        }))
    }

    async fn latest_cursor(&self, dirname: &str) -> Result<Option<BlkCursor>, IndexerError> {
        Ok(self.cursors(dirname).pop())
    }

    async fn load_orphans(&self) -> Result<OrphanSnapshot, IndexerError> {
        Ok(self.state.lock().unwrap().orphans.clone())
    }
}

/// Write transaction over a private copy of the store state.
struct MemoryTxn {
    shared: Arc<Mutex<ChainState>>,
    work: ChainState,
}

impl MemoryTxn {
    fn block_mut(&mut self, id: RowId) -> Result<&mut StoredBlock, IndexerError> {
        self.work
            .blocks
            .get_mut(&id)
            .ok_or_else(|| IndexerError::Storage(format!("no block row {id}")))
    }
}

#[async_trait]
impl ChainTxn for MemoryTxn {
    async fn block_by_hash(&mut self, hash: &str) -> Result<Option<StoredBlock>, IndexerError> {
        Ok(self
            .work
            .block_ids
            .get(hash)
            .and_then(|id| self.work.blocks.get(id))
            .cloned())
    }

    async fn block_by_id(&mut self, id: RowId) -> Result<Option<StoredBlock>, IndexerError> {
        Ok(self.work.blocks.get(&id).cloned())
    }

    async fn best_block(&mut self) -> Result<Option<StoredBlock>, IndexerError> {
        Ok(self
            .work
            .blocks
            .values()
            .filter_map(|b| b.chain_work.map(|w| (w, b)))
            .max_by(|(wa, a), (wb, b)| wa.cmp(wb).then_with(|| b.hash.cmp(&a.hash)))
            .map(|(_, b)| b.clone()))
    }

    async fn longest_children(
        &mut self,
        parent: Option<RowId>,
    ) -> Result<Vec<StoredBlock>, IndexerError> {
        Ok(self
            .work
            .blocks
            .values()
            .filter(|b| b.in_longest == Some(true) && b.prev_id == parent)
            .cloned()
            .collect())
    }

    async fn insert_block(&mut self, block: &NewBlock) -> Result<RowId, IndexerError> {
        if self.work.block_ids.contains_key(&block.hash) {
            return Err(IndexerError::Storage(format!(
                "duplicate block hash {}",
                block.hash
            )));
        }
        let id = self.work.alloc();
        let anchor = block.anchor;
        self.work.blocks.insert(
            id,
            StoredBlock {
                id,
                hash: block.hash.clone(),
                prev_hash: block.prev_hash.clone(),
                prev_id: block.prev_id,
                height: anchor.map(|a| a.height),
                chain_work: anchor.map(|a| a.chain_work),
                in_longest: anchor.map(|_| false),
                bits: block.bits,
                time: block.time,
            },
        );
        self.work.block_ids.insert(block.hash.clone(), id);
        Ok(id)
    }

    async fn anchor_block(
        &mut self,
        id: RowId,
        prev_id: RowId,
        anchor: &Anchor,
    ) -> Result<(), IndexerError> {
        let block = self.block_mut(id)?;
        *block = block.clone().anchored(prev_id, *anchor);
        let tx_ids: Vec<RowId> = self
            .work
            .txs
            .values_mut()
            .filter(|t| t.tx.block_id == id)
            .map(|t| {
                t.tx.valid = true;
                t.id
            })
            .collect();
        for out in self.work.txouts.values_mut() {
            if tx_ids.contains(&out.out.tx_id) {
                out.out.valid = true;
            }
        }
        Ok(())
    }

    async fn set_in_longest(
        &mut self,
        id: RowId,
        in_longest: Option<bool>,
    ) -> Result<(), IndexerError> {
        self.block_mut(id)?.in_longest = in_longest;
        Ok(())
    }

    async fn insert_tx(&mut self, tx: &NewTx) -> Result<RowId, IndexerError> {
        let duplicate = self
            .work
            .txs
            .values()
            .any(|t| t.tx.block_id == tx.block_id && t.tx.hash == tx.hash);
        if duplicate {
            return Err(IndexerError::Storage(format!(
                "duplicate tx {} in block row {}",
                tx.hash, tx.block_id
            )));
        }
        let id = self.work.alloc();
        self.work.txs.insert(id, TxRow { id, tx: tx.clone() });
        Ok(id)
    }

    async fn txs_by_hash(&mut self, hash: &str) -> Result<Vec<(RowId, RowId)>, IndexerError> {
        Ok(self
            .work
            .txs
            .values()
            .filter(|t| t.tx.hash == hash)
            .map(|t| (t.id, t.tx.block_id))
            .collect())
    }

    async fn txout_id(
        &mut self,
        tx_id: RowId,
        position: u32,
    ) -> Result<Option<RowId>, IndexerError> {
        Ok(self
            .work
            .txouts
            .values()
            .find(|o| o.out.tx_id == tx_id && o.out.position == position)
            .map(|o| o.id))
    }

    async fn insert_txout(&mut self, out: &NewTxOut) -> Result<RowId, IndexerError> {
        if !self.work.addresses.contains_key(&out.address) {
            let id = self.work.alloc();
            self.work.addresses.insert(out.address.clone(), id);
        }
        let id = self.work.alloc();
        self.work.txouts.insert(
            id,
            TxOutRow {
                id,
                out: out.clone(),
                spent: None,
            },
        );
        Ok(id)
    }

    async fn insert_txin(&mut self, input: &NewTxIn) -> Result<RowId, IndexerError> {
        let id = self.work.alloc();
        self.work.txins.insert(id, input.clone());
        Ok(id)
    }

    async fn set_txin_txout(
        &mut self,
        txin_id: RowId,
        txout_id: RowId,
    ) -> Result<(), IndexerError> {
        let row = self
            .work
            .txins
            .get_mut(&txin_id)
            .ok_or_else(|| IndexerError::Storage(format!("no txin row {txin_id}")))?;
        row.txout_id = Some(txout_id);
        Ok(())
    }

    async fn refresh_spent(&mut self, block_ids: &[RowId]) -> Result<(), IndexerError> {
        let state = &self.work;
        let consumed_from: Vec<RowId> = state
            .txins
            .values()
            .filter(|i| {
                state
                    .tx_block(i.tx_id)
                    .map(|b| block_ids.contains(&b))
                    .unwrap_or(false)
            })
            .filter_map(|i| i.txout_id)
            .collect();

        let mut updates = Vec::new();
        for out in state.txouts.values() {
            let Some(owner) = state.tx_block(out.out.tx_id) else {
                continue;
            };
            if !block_ids.contains(&owner) && !consumed_from.contains(&out.id) {
                continue;
            }
            let spent = if state.block_in_longest(owner) {
                let consumed = state.txins.values().any(|i| {
                    i.txout_id == Some(out.id)
                        && state
                            .tx_block(i.tx_id)
                            .map(|b| state.block_in_longest(b))
                            .unwrap_or(false)
                });
                Some(consumed)
            } else {
                None
            };
            updates.push((out.id, spent));
        }
        for (id, spent) in updates {
            if let Some(out) = self.work.txouts.get_mut(&id) {
                out.spent = spent;
            }
        }
        Ok(())
    }

    async fn save_cursor(&mut self, cursor: &BlkCursor) -> Result<RowId, IndexerError> {
        let id = match cursor.id {
            Some(id) => id,
            None => self.work.alloc(),
        };
        let mut row = cursor.clone();
        row.id = Some(id);
        self.work.cursors.insert(id, row);
        Ok(id)
    }

    async fn replace_orphans(&mut self, snapshot: &OrphanSnapshot) -> Result<(), IndexerError> {
        self.work.orphans = snapshot.clone();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        let mut shared = self.shared.lock().unwrap();
        *shared = std::mem::take(&mut self.work);
        Ok(())
    }
}
