//! `blkindex run`: ingest blk-files once or as a daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use blkindex_core::{BlockIndexer, IndexerConfig, Network};
use blkindex_storage::SqliteChainStore;

pub struct RunArgs {
    pub datadir: PathBuf,
    pub network: Network,
    pub blk_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub poll_ms: u64,
    pub workers: usize,
    pub magic: Option<String>,
    pub once: bool,
}

fn parse_magic(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid magic '{s}'"))
}

impl RunArgs {
    fn config(&self) -> Result<IndexerConfig> {
        let mut config = IndexerConfig::for_network(&self.datadir, self.network);
        if let Some(dir) = &self.blk_dir {
            config.blk_dir = dir.clone();
        }
        config.batch_size = self.batch_size;
        config.poll_interval_ms = self.poll_ms;
        config.persist_workers = self.workers;
        config.magic = self.magic.as_deref().map(parse_magic).transpose()?;
        Ok(config)
    }
}

pub async fn run(db: &str, args: RunArgs) -> Result<()> {
    let config = args.config()?;
    let store = SqliteChainStore::open(db)
        .await
        .with_context(|| format!("opening database {db}"))?;
    let mut indexer = BlockIndexer::open(store, config)
        .await
        .context("starting indexer")?;

    if args.once {
        let report = indexer.update().await.context("update pass failed")?;
        info!(
            blocks = report.blocks_read,
            inserted = report.inserted,
            skipped = report.skipped,
            orphans = indexer.orphans().len(),
            reorgs = report.reorgs,
            tip = ?report.tip,
            "update pass complete"
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    indexer
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("indexer stopped")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            datadir: PathBuf::from("/node"),
            network: Network::Regtest,
            blk_dir: None,
            batch_size: 10,
            poll_ms: 250,
            workers: 2,
            magic: Some("0xdab5bffa".into()),
            once: true,
        }
    }

    #[test]
    fn builds_config_from_flags() {
        let config = args().config().unwrap();
        assert_eq!(config.blk_dir, PathBuf::from("/node/regtest/blocks"));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.persist_workers, 2);
        assert_eq!(config.magic, Some(0xdab5_bffa));
    }

    #[test]
    fn blk_dir_overrides_network() {
        let mut args = args();
        args.blk_dir = Some(PathBuf::from("/tmp/blocks"));
        args.magic = None;
        let config = args.config().unwrap();
        assert_eq!(config.blk_dir, PathBuf::from("/tmp/blocks"));
        assert_eq!(config.magic, None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(parse_magic("xyz").is_err());
        assert_eq!(parse_magic("f9beb4d9").unwrap(), 0xf9be_b4d9);
    }
}
