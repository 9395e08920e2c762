//! Read-side queries over the SQLite chain store.
//!
//! These run against the pool outside of indexer transactions and only see
//! committed batches.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use blkindex_core::error::IndexerError;
use blkindex_core::store::Branch;
use blkindex_core::types::TxType;

use crate::sqlite::{decode_flag, SqliteChainStore};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

// ─── Views ───────────────────────────────────────────────────────────────────

/// A block with its chain position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockView {
    pub hash: String,
    pub prev_hash: String,
    pub height: Option<u64>,
    pub merkle_root: String,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: u32,
    pub size: u32,
    pub tx_count: u32,
    /// Cumulative work as 64-digit hex.
    pub chain_work: Option<String>,
    pub branch: Branch,
    /// Main-chain blocks on top of this one, itself included; 0 off the
    /// main chain.
    pub confirmations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInView {
    pub position: u32,
    /// `None` for mint inputs and inputs whose previous output is unknown.
    pub prev_tx: Option<String>,
    pub prev_position: Option<u32>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutView {
    pub position: u32,
    pub value: u64,
    pub address: String,
    pub color: u32,
    pub spent: Option<bool>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxView {
    pub hash: String,
    pub block_hash: String,
    pub block_height: Option<u64>,
    pub branch: Branch,
    pub version: u32,
    pub lock_time: u32,
    pub tx_type: TxType,
    pub size: u32,
    pub time: u32,
    pub valid: bool,
    pub inputs: Vec<TxInView>,
    pub outputs: Vec<TxOutView>,
}

/// An unspent main-chain output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utxo {
    pub tx_hash: String,
    pub position: u32,
    pub value: u64,
    pub color: u32,
    pub block_height: Option<u64>,
}

/// Unspent value held by an address in one color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColorBalance {
    pub color: u32,
    pub value: u64,
    pub outputs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainTip {
    pub hash: String,
    pub height: u64,
    pub chain_work: String,
}

/// Row counts and tip of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub blocks: u64,
    pub main_blocks: u64,
    pub fork_blocks: u64,
    pub orphan_blocks: u64,
    pub txs: u64,
    pub addresses: u64,
    pub tip: Option<ChainTip>,
    /// Heights holding more than one main-chain block. Always empty in a
    /// consistent store.
    pub conflicting_heights: Vec<u64>,
}

const BLOCK_VIEW_COLUMNS: &str = "hash, prev_hash, height, merkle_root, time, bits, nonce, \
                                  version, size, tx_count, chain_work, in_longest";

fn block_view(row: &SqliteRow, tip_height: Option<u64>) -> BlockView {
    let height = row.get::<Option<i64>, _>("height").map(|h| h as u64);
    let branch = Branch::from_in_longest(decode_flag(row.get("in_longest")));
    let confirmations = match (branch, height, tip_height) {
        (Branch::Main, Some(h), Some(tip)) if tip >= h => tip - h + 1,
        _ => 0,
    };
    BlockView {
        hash: row.get("hash"),
        prev_hash: row.get("prev_hash"),
        height,
        merkle_root: row.get("merkle_root"),
        time: row.get::<i64, _>("time") as u32,
        bits: row.get::<i64, _>("bits") as u32,
        nonce: row.get::<i64, _>("nonce") as u32,
        version: row.get::<i64, _>("version") as u32,
        size: row.get::<i64, _>("size") as u32,
        tx_count: row.get::<i64, _>("tx_count") as u32,
        chain_work: row.get("chain_work"),
        branch,
        confirmations,
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

impl SqliteChainStore {
    /// Main-chain tip (highest `in_longest = 1` block).
    pub async fn tip(&self) -> Result<Option<ChainTip>, IndexerError> {
        let row = sqlx::query(
            "SELECT hash, height, chain_work FROM blocks
             WHERE in_longest = 1 ORDER BY height DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|row| ChainTip {
            hash: row.get("hash"),
            height: row.get::<i64, _>("height") as u64,
            chain_work: row.get("chain_work"),
        }))
    }

    async fn tip_height(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.tip().await?.map(|t| t.height))
    }

    /// Total number of stored blocks (main, fork and orphan).
    pub async fn block_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    pub async fn status(&self) -> Result<StoreStatus, IndexerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS blocks,
                    COALESCE(SUM(in_longest = 1), 0) AS main_blocks,
                    COALESCE(SUM(in_longest = 0), 0) AS fork_blocks,
                    COALESCE(SUM(in_longest IS NULL), 0) AS orphan_blocks,
                    (SELECT COUNT(*) FROM txs) AS txs,
                    (SELECT COUNT(*) FROM addresses) AS addresses
             FROM blocks",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let count = |name: &str| row.get::<i64, _>(name) as u64;
        Ok(StoreStatus {
            blocks: count("blocks"),
            main_blocks: count("main_blocks"),
            fork_blocks: count("fork_blocks"),
            orphan_blocks: count("orphan_blocks"),
            txs: count("txs"),
            addresses: count("addresses"),
            tip: self.tip().await?,
            conflicting_heights: self.main_height_conflicts().await?,
        })
    }

    /// Heights with more than one `in_longest = 1` block.
    pub async fn main_height_conflicts(&self) -> Result<Vec<u64>, IndexerError> {
        let rows = sqlx::query(
            "SELECT height, COUNT(*) AS blocks
             FROM blocks
             WHERE in_longest = 1
             GROUP BY height
             HAVING COUNT(*) > 1
             ORDER BY height",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("height") as u64)
            .collect())
    }

    /// Any stored block by hash.
    pub async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockView>, IndexerError> {
        let tip = self.tip_height().await?;
        let sql = format!("SELECT {BLOCK_VIEW_COLUMNS} FROM blocks WHERE hash = ?");
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| block_view(&row, tip)))
    }

    /// Main-chain block at `height`.
    pub async fn block_by_height(&self, height: u64) -> Result<Option<BlockView>, IndexerError> {
        let tip = self.tip_height().await?;
        let sql = format!(
            "SELECT {BLOCK_VIEW_COLUMNS} FROM blocks WHERE height = ? AND in_longest = 1"
        );
        let row = sqlx::query(&sql)
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| block_view(&row, tip)))
    }

    /// Transaction by hash, preferring the main-chain copy.
    pub async fn tx_by_hash(&self, hash: &str) -> Result<Option<TxView>, IndexerError> {
        let row = sqlx::query(
            "SELECT t.id, t.hash, t.version, t.locktime, t.tx_type, t.size, t.time, t.valid,
                    b.hash AS block_hash, b.height AS block_height, b.in_longest
             FROM txs t JOIN blocks b ON b.id = t.block_id
             WHERE t.hash = ?
             ORDER BY COALESCE(b.in_longest, -1) DESC, t.id
             LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Ok(Some(self.tx_view(&row).await?)),
            None => Ok(None),
        }
    }

    /// Transactions of block `hash` in block order.
    pub async fn block_txs(&self, hash: &str) -> Result<Vec<TxView>, IndexerError> {
        let rows = sqlx::query(
            "SELECT t.id, t.hash, t.version, t.locktime, t.tx_type, t.size, t.time, t.valid,
                    b.hash AS block_hash, b.height AS block_height, b.in_longest
             FROM txs t JOIN blocks b ON b.id = t.block_id
             WHERE b.hash = ? ORDER BY t.id",
        )
        .bind(hash)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut txs = Vec::with_capacity(rows.len());
        for row in &rows {
            txs.push(self.tx_view(row).await?);
        }
        Ok(txs)
    }

    async fn tx_view(&self, row: &SqliteRow) -> Result<TxView, IndexerError> {
        let tx_id: i64 = row.get("id");

        let inputs = sqlx::query(
            "SELECT i.position, i.sequence, pt.hash AS prev_tx, o.position AS prev_position
             FROM tx_ins i
             LEFT JOIN tx_outs o ON o.id = i.txout_id
             LEFT JOIN txs pt ON pt.id = o.tx_id
             WHERE i.tx_id = ? ORDER BY i.position",
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?
        .iter()
        .map(|r| TxInView {
            position: r.get::<i64, _>("position") as u32,
            prev_tx: r.get("prev_tx"),
            prev_position: r.get::<Option<i64>, _>("prev_position").map(|p| p as u32),
            sequence: r.get::<i64, _>("sequence") as u32,
        })
        .collect();

        let outputs = sqlx::query(
            "SELECT o.position, o.value, a.address, o.color, o.spent, o.valid
             FROM tx_outs o JOIN addresses a ON a.id = o.address_id
             WHERE o.tx_id = ? ORDER BY o.position",
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?
        .iter()
        .map(|r| TxOutView {
            position: r.get::<i64, _>("position") as u32,
            value: r.get::<i64, _>("value") as u64,
            address: r.get("address"),
            color: r.get::<i64, _>("color") as u32,
            spent: decode_flag(r.get("spent")),
            valid: r.get("valid"),
        })
        .collect();

        Ok(TxView {
            hash: row.get("hash"),
            block_hash: row.get("block_hash"),
            block_height: row.get::<Option<i64>, _>("block_height").map(|h| h as u64),
            branch: Branch::from_in_longest(decode_flag(row.get("in_longest"))),
            version: row.get::<i64, _>("version") as u32,
            lock_time: row.get::<i64, _>("locktime") as u32,
            tx_type: TxType::from(row.get::<i64, _>("tx_type") as u32),
            size: row.get::<i64, _>("size") as u32,
            time: row.get::<i64, _>("time") as u32,
            valid: row.get("valid"),
            inputs,
            outputs,
        })
    }

    /// Unspent main-chain outputs paying `address`, optionally of one color.
    pub async fn utxos(
        &self,
        address: &str,
        color: Option<u32>,
    ) -> Result<Vec<Utxo>, IndexerError> {
        let color = color.map(i64::from);
        let rows = sqlx::query(
            "SELECT t.hash AS tx_hash, o.position, o.value, o.color, b.height
             FROM tx_outs o
             JOIN addresses a ON a.id = o.address_id
             JOIN txs t ON t.id = o.tx_id
             JOIN blocks b ON b.id = t.block_id
             WHERE a.address = ? AND o.spent = 0 AND b.in_longest = 1
               AND (? IS NULL OR o.color = ?)
             ORDER BY b.height, t.id, o.position",
        )
        .bind(address)
        .bind(color)
        .bind(color)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|r| Utxo {
                tx_hash: r.get("tx_hash"),
                position: r.get::<i64, _>("position") as u32,
                value: r.get::<i64, _>("value") as u64,
                color: r.get::<i64, _>("color") as u32,
                block_height: r.get::<Option<i64>, _>("height").map(|h| h as u64),
            })
            .collect())
    }

    /// Unspent value per color held by `address`.
    ///
    /// Totals are accumulated as `u64`; one above `u64::MAX` is an error.
    pub async fn balance(&self, address: &str) -> Result<Vec<ColorBalance>, IndexerError> {
        let rows = sqlx::query(
            "SELECT o.color, o.value
             FROM tx_outs o
             JOIN addresses a ON a.id = o.address_id
             JOIN txs t ON t.id = o.tx_id
             JOIN blocks b ON b.id = t.block_id
             WHERE a.address = ? AND o.spent = 0 AND b.in_longest = 1",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut totals: BTreeMap<u32, ColorBalance> = BTreeMap::new();
        for r in &rows {
            let color = r.get::<i64, _>("color") as u32;
            let value = r.get::<i64, _>("value") as u64;
            let entry = totals.entry(color).or_insert(ColorBalance {
                color,
                value: 0,
                outputs: 0,
            });
            entry.value = entry.value.checked_add(value).ok_or_else(|| {
                IndexerError::Storage(format!("balance of {address} in color {color} overflows"))
            })?;
            entry.outputs += 1;
        }
        Ok(totals.into_values().collect())
    }
}
