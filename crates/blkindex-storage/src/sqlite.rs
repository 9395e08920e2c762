//! SQLite chain store.
//!
//! Persists the block / transaction / output / input / address graph, the
//! blk-file cursor and the orphan checkpoint to a single SQLite file.
//! Every indexer batch runs inside one `sqlx` transaction.
//!
//! # Usage
//! ```rust,no_run
//! use blkindex_storage::sqlite::SqliteChainStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteChainStore::open("./chain.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteChainStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use alloy_primitives::U256;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use blkindex_core::cursor::BlkCursor;
use blkindex_core::error::IndexerError;
use blkindex_core::store::{
    Anchor, ChainStore, ChainTxn, NewBlock, NewTx, NewTxIn, NewTxOut, OrphanLink,
    OrphanSnapshot, PendingTxIn, RowId, StoredBlock,
};

/// Block ids bound per `refresh_spent` statement (each list is bound twice).
const SPENT_CHUNK: usize = 400;

const BLOCK_COLUMNS: &str =
    "id, hash, prev_hash, prev_block, height, chain_work, in_longest, bits, time";

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// Fixed-width hex so that text order equals numeric order.
pub(crate) fn encode_work(work: U256) -> String {
    hex::encode(work.to_be_bytes::<32>())
}

pub(crate) fn decode_work(s: &str) -> Result<U256, IndexerError> {
    U256::from_str_radix(s, 16)
        .map_err(|e| IndexerError::Storage(format!("bad chain_work '{s}': {e}")))
}

pub(crate) fn decode_flag(v: Option<i64>) -> Option<bool> {
    v.map(|v| v != 0)
}

fn block_from_row(row: &SqliteRow) -> Result<StoredBlock, IndexerError> {
    let chain_work: Option<String> = row.get("chain_work");
    Ok(StoredBlock {
        id: row.get("id"),
        hash: row.get("hash"),
        prev_hash: row.get("prev_hash"),
        prev_id: row.get("prev_block"),
        height: row.get::<Option<i64>, _>("height").map(|h| h as u64),
        chain_work: chain_work.as_deref().map(decode_work).transpose()?,
        in_longest: decode_flag(row.get("in_longest")),
        bits: row.get::<i64, _>("bits") as u32,
        time: row.get::<i64, _>("time") as u32,
    })
}

/// SQLite-backed chain store.
#[derive(Debug, Clone)]
pub struct SqliteChainStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteChainStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chain.db"`) or a full
    /// SQLite URL (`"sqlite:./chain.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single pooled connection keeps the database alive; all data is lost
    /// when the store is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                hash        TEXT    NOT NULL UNIQUE,
                prev_hash   TEXT    NOT NULL,
                prev_block  INTEGER REFERENCES blocks (id),
                height      INTEGER,
                merkle_root TEXT    NOT NULL,
                time        INTEGER NOT NULL,
                bits        INTEGER NOT NULL,
                nonce       INTEGER NOT NULL,
                version     INTEGER NOT NULL,
                size        INTEGER NOT NULL,
                tx_count    INTEGER NOT NULL,
                chain_work  TEXT,
                in_longest  INTEGER
            );",
            "CREATE INDEX IF NOT EXISTS idx_blocks_prev ON blocks (prev_block);",
            "CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks (height);",
            "CREATE INDEX IF NOT EXISTS idx_blocks_work ON blocks (chain_work);",
            "CREATE TABLE IF NOT EXISTS addresses (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT    NOT NULL UNIQUE
            );",
            "CREATE TABLE IF NOT EXISTS txs (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                hash     TEXT    NOT NULL,
                block_id INTEGER NOT NULL REFERENCES blocks (id),
                version  INTEGER NOT NULL,
                locktime INTEGER NOT NULL,
                tx_type  INTEGER NOT NULL,
                size     INTEGER NOT NULL,
                time     INTEGER NOT NULL,
                valid    INTEGER NOT NULL,
                UNIQUE (hash, block_id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_txs_block ON txs (block_id);",
            "CREATE TABLE IF NOT EXISTS tx_outs (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_id      INTEGER NOT NULL REFERENCES txs (id),
                position   INTEGER NOT NULL,
                value      INTEGER NOT NULL,
                script     BLOB    NOT NULL,
                address_id INTEGER NOT NULL REFERENCES addresses (id),
                color      INTEGER NOT NULL,
                spent      INTEGER,
                valid      INTEGER NOT NULL,
                UNIQUE (tx_id, position)
            );",
            "CREATE INDEX IF NOT EXISTS idx_tx_outs_address ON tx_outs (address_id);",
            "CREATE TABLE IF NOT EXISTS tx_ins (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_id      INTEGER NOT NULL REFERENCES txs (id),
                position   INTEGER NOT NULL,
                txout_id   INTEGER REFERENCES tx_outs (id),
                script_sig BLOB    NOT NULL,
                sequence   INTEGER NOT NULL,
                UNIQUE (tx_id, position)
            );",
            "CREATE INDEX IF NOT EXISTS idx_tx_ins_txout ON tx_ins (txout_id);",
            "CREATE TABLE IF NOT EXISTS datadirs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                dirname        TEXT    NOT NULL,
                blkfile_number INTEGER NOT NULL,
                blkfile_offset INTEGER NOT NULL,
                created_at     INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_datadirs_dirname ON datadirs (dirname);",
            "CREATE TABLE IF NOT EXISTS orphans (
                parent_hash TEXT NOT NULL,
                block_hash  TEXT NOT NULL,
                PRIMARY KEY (parent_hash, block_hash)
            );",
            "CREATE TABLE IF NOT EXISTS orphan_txins (
                txin_id       INTEGER PRIMARY KEY,
                block_hash    TEXT    NOT NULL,
                prev_hash     TEXT    NOT NULL,
                prev_position INTEGER NOT NULL
            );",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChainStore for SqliteChainStore {
    async fn begin(&self) -> Result<Box<dyn ChainTxn>, IndexerError> {
        let tx = self.pool.begin().await.map_err(storage_err)?;
        Ok(Box::new(SqliteTxn { tx: Some(tx) }))
    }

    async fn latest_cursor(&self, dirname: &str) -> Result<Option<BlkCursor>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, dirname, blkfile_number, blkfile_offset, created_at
             FROM datadirs WHERE dirname = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(dirname)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|row| BlkCursor {
            id: Some(row.get("id")),
            dirname: row.get("dirname"),
            blkfile_number: row.get::<i64, _>("blkfile_number") as u32,
            blkfile_offset: row.get::<i64, _>("blkfile_offset") as u64,
            created_at: row.get("created_at"),
        }))
    }

    async fn load_orphans(&self) -> Result<OrphanSnapshot, IndexerError> {
        let links = sqlx::query(
            "SELECT parent_hash, block_hash FROM orphans ORDER BY parent_hash, block_hash",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?
        .into_iter()
        .map(|row| OrphanLink {
            parent_hash: row.get("parent_hash"),
            block_hash: row.get("block_hash"),
        })
        .collect();

        let inputs = sqlx::query(
            "SELECT txin_id, block_hash, prev_hash, prev_position
             FROM orphan_txins ORDER BY txin_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?
        .into_iter()
        .map(|row| PendingTxIn {
            txin_id: row.get("txin_id"),
            block_hash: row.get("block_hash"),
            prev_hash: row.get("prev_hash"),
            prev_position: row.get::<i64, _>("prev_position") as u32,
        })
        .collect();

        Ok(OrphanSnapshot { links, inputs })
    }
}

/// One `sqlx` transaction. Dropping it without commit rolls back.
struct SqliteTxn {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTxn {
    fn conn(&mut self) -> Result<&mut SqliteConnection, IndexerError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| IndexerError::Storage("transaction already committed".into()))
    }

    async fn fetch_block(
        &mut self,
        filter: &str,
        bind: RowIdOrHash<'_>,
    ) -> Result<Option<StoredBlock>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE {filter}");
        let query = sqlx::query(&sql);
        let query = match bind {
            RowIdOrHash::Id(id) => query.bind(id),
            RowIdOrHash::Hash(hash) => query.bind(hash),
        };
        let row = query
            .fetch_optional(self.conn()?)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }
}

enum RowIdOrHash<'a> {
    Id(RowId),
    Hash(&'a str),
}

#[async_trait]
impl ChainTxn for SqliteTxn {
    async fn block_by_hash(&mut self, hash: &str) -> Result<Option<StoredBlock>, IndexerError> {
        self.fetch_block("hash = ?", RowIdOrHash::Hash(hash)).await
    }

    async fn block_by_id(&mut self, id: RowId) -> Result<Option<StoredBlock>, IndexerError> {
        self.fetch_block("id = ?", RowIdOrHash::Id(id)).await
    }

    async fn best_block(&mut self) -> Result<Option<StoredBlock>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE chain_work IS NOT NULL
             ORDER BY chain_work DESC, hash ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(self.conn()?)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn longest_children(
        &mut self,
        parent: Option<RowId>,
    ) -> Result<Vec<StoredBlock>, IndexerError> {
        let rows = match parent {
            Some(parent) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks
                     WHERE prev_block = ? AND in_longest = 1 ORDER BY id"
                );
                sqlx::query(&sql)
                    .bind(parent)
                    .fetch_all(self.conn()?)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks
                     WHERE prev_block IS NULL AND in_longest = 1 ORDER BY id"
                );
                sqlx::query(&sql).fetch_all(self.conn()?).await
            }
        }
        .map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn insert_block(&mut self, block: &NewBlock) -> Result<RowId, IndexerError> {
        let result = sqlx::query(
            "INSERT INTO blocks (hash, prev_hash, prev_block, height, merkle_root, time, bits,
                                 nonce, version, size, tx_count, chain_work, in_longest)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&block.hash)
        .bind(&block.prev_hash)
        .bind(block.prev_id)
        .bind(block.anchor.map(|a| a.height as i64))
        .bind(&block.merkle_root)
        .bind(block.time as i64)
        .bind(block.bits as i64)
        .bind(block.nonce as i64)
        .bind(block.version as i64)
        .bind(block.size as i64)
        .bind(block.tx_count as i64)
        .bind(block.anchor.map(|a| encode_work(a.chain_work)))
        .bind(block.anchor.map(|_| 0i64))
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        debug!(hash = %block.hash, anchored = block.anchor.is_some(), "block row inserted");
        Ok(result.last_insert_rowid())
    }

    async fn anchor_block(
        &mut self,
        id: RowId,
        prev_id: RowId,
        anchor: &Anchor,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "UPDATE blocks SET prev_block = ?, height = ?, chain_work = ?, in_longest = 0
             WHERE id = ?",
        )
        .bind(prev_id)
        .bind(anchor.height as i64)
        .bind(encode_work(anchor.chain_work))
        .bind(id)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;

        sqlx::query("UPDATE txs SET valid = 1 WHERE block_id = ?")
            .bind(id)
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "UPDATE tx_outs SET valid = 1
             WHERE tx_id IN (SELECT id FROM txs WHERE block_id = ?)",
        )
        .bind(id)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn set_in_longest(
        &mut self,
        id: RowId,
        in_longest: Option<bool>,
    ) -> Result<(), IndexerError> {
        sqlx::query("UPDATE blocks SET in_longest = ? WHERE id = ?")
            .bind(in_longest.map(i64::from))
            .bind(id)
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn insert_tx(&mut self, tx: &NewTx) -> Result<RowId, IndexerError> {
        let result = sqlx::query(
            "INSERT INTO txs (hash, block_id, version, locktime, tx_type, size, time, valid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tx.hash)
        .bind(tx.block_id)
        .bind(tx.version as i64)
        .bind(tx.lock_time as i64)
        .bind(u32::from(tx.tx_type) as i64)
        .bind(tx.size as i64)
        .bind(tx.time as i64)
        .bind(tx.valid)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn txs_by_hash(&mut self, hash: &str) -> Result<Vec<(RowId, RowId)>, IndexerError> {
        let rows = sqlx::query("SELECT id, block_id FROM txs WHERE hash = ? ORDER BY id")
            .bind(hash)
            .fetch_all(self.conn()?)
            .await
            .map_err(storage_err)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("block_id")))
            .collect())
    }

    async fn txout_id(
        &mut self,
        tx_id: RowId,
        position: u32,
    ) -> Result<Option<RowId>, IndexerError> {
        let row = sqlx::query("SELECT id FROM tx_outs WHERE tx_id = ? AND position = ?")
            .bind(tx_id)
            .bind(position as i64)
            .fetch_optional(self.conn()?)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| row.get("id")))
    }

    async fn insert_txout(&mut self, out: &NewTxOut) -> Result<RowId, IndexerError> {
        let value = i64::try_from(out.value).map_err(|_| {
            IndexerError::Storage(format!(
                "output {}:{} value {} exceeds the INTEGER column range",
                out.tx_id, out.position, out.value
            ))
        })?;
        sqlx::query("INSERT OR IGNORE INTO addresses (address) VALUES (?)")
            .bind(&out.address)
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;
        let address_id: RowId = sqlx::query("SELECT id FROM addresses WHERE address = ?")
            .bind(&out.address)
            .fetch_one(self.conn()?)
            .await
            .map_err(storage_err)?
            .get("id");

        let result = sqlx::query(
            "INSERT INTO tx_outs (tx_id, position, value, script, address_id, color, spent, valid)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(out.tx_id)
        .bind(out.position as i64)
        .bind(value)
        .bind(&out.script)
        .bind(address_id)
        .bind(out.color as i64)
        .bind(out.valid)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn insert_txin(&mut self, input: &NewTxIn) -> Result<RowId, IndexerError> {
        let result = sqlx::query(
            "INSERT INTO tx_ins (tx_id, position, txout_id, script_sig, sequence)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(input.tx_id)
        .bind(input.position as i64)
        .bind(input.txout_id)
        .bind(&input.script_sig)
        .bind(input.sequence as i64)
        .execute(self.conn()?)
        .await
        .map_err(storage_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn set_txin_txout(
        &mut self,
        txin_id: RowId,
        txout_id: RowId,
    ) -> Result<(), IndexerError> {
        sqlx::query("UPDATE tx_ins SET txout_id = ? WHERE id = ?")
            .bind(txout_id)
            .bind(txin_id)
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn refresh_spent(&mut self, block_ids: &[RowId]) -> Result<(), IndexerError> {
        for chunk in block_ids.chunks(SPENT_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "WITH scope (id) AS (
                     SELECT o.id FROM tx_outs o JOIN txs t ON t.id = o.tx_id
                     WHERE t.block_id IN ({placeholders})
                     UNION
                     SELECT i.txout_id FROM tx_ins i JOIN txs t ON t.id = i.tx_id
                     WHERE t.block_id IN ({placeholders}) AND i.txout_id IS NOT NULL
                 )
                 UPDATE tx_outs SET spent = CASE
                     WHEN (SELECT b.in_longest FROM txs t JOIN blocks b ON b.id = t.block_id
                           WHERE t.id = tx_outs.tx_id) = 1
                     THEN EXISTS (
                         SELECT 1 FROM tx_ins i
                         JOIN txs t ON t.id = i.tx_id
                         JOIN blocks b ON b.id = t.block_id
                         WHERE i.txout_id = tx_outs.id AND b.in_longest = 1
                     )
                     ELSE NULL
                 END
                 WHERE id IN (SELECT id FROM scope)"
            );
            let mut query = sqlx::query(&sql);
            for id in chunk.iter().chain(chunk.iter()) {
                query = query.bind(*id);
            }
            let result = query.execute(self.conn()?).await.map_err(storage_err)?;
            debug!(
                blocks = chunk.len(),
                outputs = result.rows_affected(),
                "spent flags refreshed"
            );
        }
        Ok(())
    }

    async fn save_cursor(&mut self, cursor: &BlkCursor) -> Result<RowId, IndexerError> {
        match cursor.id {
            Some(id) => {
                sqlx::query(
                    "UPDATE datadirs SET blkfile_number = ?, blkfile_offset = ? WHERE id = ?",
                )
                .bind(cursor.blkfile_number as i64)
                .bind(cursor.blkfile_offset as i64)
                .bind(id)
                .execute(self.conn()?)
                .await
                .map_err(storage_err)?;
                Ok(id)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO datadirs (dirname, blkfile_number, blkfile_offset, created_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&cursor.dirname)
                .bind(cursor.blkfile_number as i64)
                .bind(cursor.blkfile_offset as i64)
                .bind(cursor.created_at)
                .execute(self.conn()?)
                .await
                .map_err(storage_err)?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    async fn replace_orphans(&mut self, snapshot: &OrphanSnapshot) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM orphans")
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;
        sqlx::query("DELETE FROM orphan_txins")
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;

        for link in &snapshot.links {
            sqlx::query("INSERT INTO orphans (parent_hash, block_hash) VALUES (?, ?)")
                .bind(&link.parent_hash)
                .bind(&link.block_hash)
                .execute(self.conn()?)
                .await
                .map_err(storage_err)?;
        }
        for input in &snapshot.inputs {
            sqlx::query(
                "INSERT INTO orphan_txins (txin_id, block_hash, prev_hash, prev_position)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(input.txin_id)
            .bind(&input.block_hash)
            .bind(&input.prev_hash)
            .bind(input.prev_position as i64)
            .execute(self.conn()?)
            .await
            .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| IndexerError::Storage("transaction already committed".into()))?;
        tx.commit().await.map_err(storage_err)
    }
}
