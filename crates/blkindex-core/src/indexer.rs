//! Ingestion driver: blk-files → chain store.
//!
//! # Update pass
//! 1. Load the newest cursor for the blk directory (or start at
//!    `blk00000.dat`, offset 0).
//! 2. Decode records from the cursor offset.
//! 3. Every `batch_size` blocks, commit one store transaction:
//!    persist rows → resolve main chain → refresh `spent` → advance cursor →
//!    checkpoint orphans.
//! 4. When the file has no more complete records, move to the next numbered
//!    file if it exists, otherwise stop.
//!
//! A record that fails to decode ends the current file: the blocks before it
//! are committed and the pass moves on to the next file. The error is only
//! returned when there is no next file to move to.
//!
//! # Daemon
//! [`BlockIndexer::run_until`] repeats update passes every `poll_interval_ms`
//! until the shutdown future resolves.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cursor::BlkCursor;
use crate::error::IndexerError;
use crate::orphan::OrphanTracker;
use crate::parser::BlkReader;
use crate::persist::BlockPersister;
use crate::reorg::ChainResolver;
use crate::store::ChainStore;
use crate::types::RawBlock;

// ─── Network ─────────────────────────────────────────────────────────────────

/// Which node network a data directory belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Main,
    Testnet,
    Regtest,
}

impl Network {
    /// Location of the blk-files relative to the node data directory.
    pub fn blocks_subdir(&self) -> &'static str {
        match self {
            Self::Main => "blocks",
            Self::Testnet => "testnet3/blocks",
            Self::Regtest => "regtest/blocks",
        }
    }

    pub fn blk_dir(&self, datadir: impl AsRef<Path>) -> PathBuf {
        datadir.as_ref().join(self.blocks_subdir())
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Testnet => write!(f, "testnet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::Main),
            "testnet" | "testnet3" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(IndexerError::Config(format!("unknown network '{other}'"))),
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration for a [`BlockIndexer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Directory holding `blkNNNNN.dat` files.
    pub blk_dir: PathBuf,
    /// Blocks committed per store transaction.
    pub batch_size: usize,
    /// Daemon polling interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Blocking workers for transaction preparation. `0` = inline.
    pub persist_workers: usize,
    /// Expected record magic. `None` accepts any.
    pub magic: Option<u32>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            blk_dir: Network::Main.blk_dir("."),
            batch_size: 50,
            poll_interval_ms: 1000,
            persist_workers: 0,
            magic: None,
        }
    }
}

impl IndexerConfig {
    /// Defaults for the blk directory of `network` under `datadir`.
    pub fn for_network(datadir: impl AsRef<Path>, network: Network) -> Self {
        Self {
            blk_dir: network.blk_dir(datadir),
            ..Self::default()
        }
    }

    /// Cursor key for this configuration.
    pub fn dirname(&self) -> String {
        self.blk_dir.display().to_string()
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Summary of one [`BlockIndexer::update`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Store transactions committed.
    pub batches: usize,
    /// Records decoded from blk-files.
    pub blocks_read: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub orphaned: usize,
    pub anchored: usize,
    pub unresolved_inputs: usize,
    /// Batches whose resolution demoted main-chain blocks.
    pub reorgs: usize,
    pub max_reorg_depth: usize,
    /// blk-files switched to during the pass.
    pub files_switched: usize,
    /// blk-files left behind at an undecodable record.
    pub abandoned_files: usize,
    /// Main-chain tip after the last batch.
    pub tip: Option<String>,
    /// Cursor position at the end of the pass.
    pub blkfile_number: u32,
    pub blkfile_offset: u64,
}

// ─── Indexer ─────────────────────────────────────────────────────────────────

/// Reads blk-files and maintains the chain store.
pub struct BlockIndexer<S: ChainStore> {
    store: S,
    config: IndexerConfig,
    orphans: OrphanTracker,
    persister: BlockPersister,
    resolver: ChainResolver,
}

impl<S: ChainStore> BlockIndexer<S> {
    /// Create an indexer over `store`, reloading the orphan checkpoint.
    pub async fn open(store: S, config: IndexerConfig) -> Result<Self, IndexerError> {
        config.validate()?;
        let orphans = OrphanTracker::from_snapshot(store.load_orphans().await?);
        if !orphans.is_empty() {
            info!(
                orphans = orphans.len(),
                pending_inputs = orphans.pending_inputs(),
                "orphan checkpoint loaded"
            );
        }
        Ok(Self {
            persister: BlockPersister::new(config.persist_workers),
            resolver: ChainResolver::new(),
            store,
            config,
            orphans,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn orphans(&self) -> &OrphanTracker {
        &self.orphans
    }

    /// Consume the indexer and return its store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Ingest every complete record available on disk.
    ///
    /// A decode error commits the blocks preceding the bad record. If a next
    /// blk-file exists the pass continues there; otherwise the error is
    /// returned with the cursor at the start of the bad record.
    pub async fn update(&mut self) -> Result<UpdateReport, IndexerError> {
        let dirname = self.config.dirname();
        let mut cursor = match self.store.latest_cursor(&dirname).await? {
            Some(cursor) => cursor,
            None => BlkCursor::new(dirname),
        };
        let mut report = UpdateReport::default();

        loop {
            let path = cursor.file_path();
            let Some(reader) = BlkReader::open(&path, cursor.blkfile_offset).await? else {
                debug!(file = %path.display(), "blk-file not present");
                break;
            };
            let mut reader = reader.with_magic(self.config.magic);
            let mut batch: Vec<RawBlock> = Vec::with_capacity(self.config.batch_size);
            let mut parse_error = None;

            loop {
                match reader.next_block() {
                    Ok(Some(block)) => {
                        report.blocks_read += 1;
                        batch.push(block);
                        if batch.len() >= self.config.batch_size {
                            let blocks = std::mem::take(&mut batch);
                            self.commit_batch(&mut cursor, reader.offset(), &blocks, &mut report)
                                .await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        parse_error = Some(e);
                        break;
                    }
                }
            }
            if !batch.is_empty() {
                self.commit_batch(&mut cursor, reader.offset(), &batch, &mut report)
                    .await?;
            }

            let next = cursor.next_file();
            let next_path = next.file_path();
            let exists = tokio::fs::try_exists(&next_path)
                .await
                .map_err(|source| IndexerError::Io {
                    path: next_path.clone(),
                    source,
                })?;
            if !exists {
                if let Some(e) = parse_error {
                    return Err(e);
                }
                break;
            }
            if let Some(e) = parse_error {
                warn!(
                    error = %e,
                    next = next.blkfile_number,
                    "abandoning rest of blk-file"
                );
                report.abandoned_files += 1;
            }

            let mut txn = self.store.begin().await?;
            let id = txn.save_cursor(&next).await?;
            txn.commit().await?;
            info!(
                from = cursor.blkfile_number,
                to = next.blkfile_number,
                "switched to next blk-file"
            );
            cursor = BlkCursor { id: Some(id), ..next };
            report.files_switched += 1;
        }

        report.blkfile_number = cursor.blkfile_number;
        report.blkfile_offset = cursor.blkfile_offset;
        Ok(report)
    }

    /// Commit `blocks` and move the cursor to `offset`, all in one
    /// transaction. On failure neither the store nor the tracker change.
    async fn commit_batch(
        &mut self,
        cursor: &mut BlkCursor,
        offset: u64,
        blocks: &[RawBlock],
        report: &mut UpdateReport,
    ) -> Result<(), IndexerError> {
        let mut orphans = self.orphans.clone();
        let mut txn = self.store.begin().await?;

        let persisted = self
            .persister
            .persist(txn.as_mut(), &mut orphans, blocks)
            .await?;
        let mut touched = persisted.touched.clone();
        let outcome = self.resolver.resolve(txn.as_mut(), &mut touched).await?;
        touched.sort_unstable();
        touched.dedup();
        txn.refresh_spent(&touched).await?;

        let mut next = cursor.clone();
        next.advance(offset);
        let cursor_id = txn.save_cursor(&next).await?;
        orphans.checkpoint(txn.as_mut()).await?;
        txn.commit().await?;

        next.id = Some(cursor_id);
        *cursor = next;
        self.orphans = orphans;

        report.batches += 1;
        report.inserted += persisted.inserted;
        report.skipped += persisted.skipped;
        report.orphaned += persisted.orphaned;
        report.anchored += persisted.anchored;
        report.unresolved_inputs += persisted.unresolved_inputs;
        if outcome.is_reorg() {
            report.reorgs += 1;
            report.max_reorg_depth = report.max_reorg_depth.max(outcome.depth());
        }
        if outcome.tip.is_some() {
            report.tip = outcome.tip.clone();
        }

        info!(
            file = cursor.blkfile_number,
            offset,
            blocks = blocks.len(),
            inserted = persisted.inserted,
            orphans = self.orphans.len(),
            tip = ?outcome.tip,
            "batch committed"
        );
        Ok(())
    }

    /// Run update passes until `shutdown` resolves.
    ///
    /// Errors are logged and retried after the poll interval; a fork conflict
    /// stops the loop.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), IndexerError>
    where
        F: Future<Output = ()>,
    {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        tokio::pin!(shutdown);

        info!(
            blk_dir = %self.config.blk_dir.display(),
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "indexer started"
        );

        loop {
            match self.update().await {
                Ok(report) if report.blocks_read > 0 => info!(
                    blocks = report.blocks_read,
                    inserted = report.inserted,
                    reorgs = report.reorgs,
                    tip = ?report.tip,
                    "update complete"
                ),
                Ok(_) => debug!("no new blocks"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "indexer stopped");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "update failed, retrying"),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{append_blk_file, blk_bytes, write_blk_file, ChainBuilder};
    use crate::memory::MemoryChainStore;

    fn config(dir: &Path) -> IndexerConfig {
        IndexerConfig {
            blk_dir: dir.to_path_buf(),
            batch_size: 4,
            ..IndexerConfig::default()
        }
    }

    #[test]
    fn network_directories() {
        let cfg = IndexerConfig::for_network("/data", Network::Testnet);
        assert_eq!(cfg.blk_dir, PathBuf::from("/data/testnet3/blocks"));
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!("moon".parse::<Network>().is_err());
        assert_eq!(IndexerConfig::default().batch_size, 50);
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let cfg = IndexerConfig {
            batch_size: 0,
            ..IndexerConfig::default()
        };
        let err = BlockIndexer::open(MemoryChainStore::new(), cfg)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[tokio::test]
    async fn ingests_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ChainBuilder::new();
        let blocks = builder.linear(10);
        write_blk_file(dir.path(), 0, &blocks).unwrap();

        let store = MemoryChainStore::new();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.inserted, 10);
        assert_eq!(report.batches, 3);
        assert_eq!(report.tip, Some(blocks[9].hash().to_hex()));
        assert_eq!(store.main_chain().len(), 10);

        let more = builder.extend(&blocks[9], 3);
        append_blk_file(dir.path(), 0, &more).unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.blocks_read, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(store.main_chain().len(), 13);
        assert_eq!(store.cursors(&indexer.config().dirname()).len(), 1);
    }

    #[tokio::test]
    async fn switches_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = ChainBuilder::new().linear(6);
        write_blk_file(dir.path(), 0, &blocks[..3]).unwrap();
        write_blk_file(dir.path(), 1, &blocks[3..]).unwrap();

        let store = MemoryChainStore::new();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.inserted, 6);
        assert_eq!(report.files_switched, 1);
        assert_eq!(report.blkfile_number, 1);

        let cursors = store.cursors(&indexer.config().dirname());
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[1].blkfile_number, 1);
        assert_eq!(cursors[1].blkfile_offset, blk_bytes(&blocks[3..]).len() as u64);
    }

    #[tokio::test]
    async fn parse_error_commits_preceding_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = ChainBuilder::new().linear(3);
        let mut data = blk_bytes(&blocks);
        let good_len = data.len() as u64;
        // Complete record whose payload is too short for a header.
        data.extend_from_slice(&crate::fixtures::TEST_MAGIC.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        std::fs::write(dir.path().join("blk00000.dat"), data).unwrap();

        let store = MemoryChainStore::new();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        let err = indexer.update().await.unwrap_err();
        assert!(err.is_parse());
        assert_eq!(store.main_chain().len(), 3);
        let cursor = store
            .cursors(&indexer.config().dirname())
            .pop()
            .unwrap();
        assert_eq!(cursor.blkfile_offset, good_len);
    }

    #[tokio::test]
    async fn corrupt_record_moves_on_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = ChainBuilder::new().linear(6);
        let mut data = blk_bytes(&blocks[..3]);
        data.extend_from_slice(&crate::fixtures::TEST_MAGIC.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        std::fs::write(dir.path().join("blk00000.dat"), data).unwrap();
        write_blk_file(dir.path(), 1, &blocks[3..]).unwrap();

        let store = MemoryChainStore::new();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.inserted, 6);
        assert_eq!(report.abandoned_files, 1);
        assert_eq!(report.files_switched, 1);
        assert_eq!(report.blkfile_number, 1);
        assert_eq!(report.tip, Some(blocks[5].hash().to_hex()));
        assert_eq!(store.main_chain().len(), 6);

        // The bad record is not revisited.
        let report = indexer.update().await.unwrap();
        assert_eq!(report.blocks_read, 0);
        assert_eq!(report.abandoned_files, 0);
    }

    #[tokio::test]
    async fn orphans_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ChainBuilder::new();
        let blocks = builder.linear(3);
        write_blk_file(dir.path(), 0, [&blocks[0], &blocks[2]]).unwrap();

        let store = MemoryChainStore::new();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        indexer.update().await.unwrap();
        assert_eq!(indexer.orphans().len(), 1);
        drop(indexer);

        append_blk_file(dir.path(), 0, [&blocks[1]]).unwrap();
        let mut indexer = BlockIndexer::open(store.clone(), config(dir.path()))
            .await
            .unwrap();
        assert_eq!(indexer.orphans().len(), 1);
        let report = indexer.update().await.unwrap();
        assert_eq!(report.anchored, 1);
        assert!(indexer.orphans().is_empty());
        assert_eq!(store.main_chain().len(), 3);
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        write_blk_file(dir.path(), 0, &ChainBuilder::new().linear(2)).unwrap();
        let store = MemoryChainStore::new();
        let mut cfg = config(dir.path());
        cfg.poll_interval_ms = 10;
        let mut indexer = BlockIndexer::open(store.clone(), cfg).await.unwrap();

        indexer
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(store.main_chain().len(), 2);
    }
}
