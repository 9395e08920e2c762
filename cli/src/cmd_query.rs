//! Read-only commands: `status`, `block`, `tx`, `address`.

use anyhow::{Context, Result};
use serde::Serialize;

use blkindex_storage::SqliteChainStore;

async fn open(db: &str) -> Result<SqliteChainStore> {
    SqliteChainStore::open(db)
        .await
        .with_context(|| format!("opening database {db}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn status(db: &str, json: bool) -> Result<()> {
    let store = open(db).await?;
    let status = store.status().await?;
    if json {
        return print_json(&status);
    }
    println!("Blocks:      {}", status.blocks);
    println!("  main:      {}", status.main_blocks);
    println!("  fork:      {}", status.fork_blocks);
    println!("  orphan:    {}", status.orphan_blocks);
    println!("Txs:         {}", status.txs);
    println!("Addresses:   {}", status.addresses);
    match status.tip {
        Some(tip) => {
            println!("Tip:         {} (height {})", tip.hash, tip.height);
            println!("Chain work:  0x{}", tip.chain_work.trim_start_matches('0'));
        }
        None => println!("Tip:         none"),
    }
    if !status.conflicting_heights.is_empty() {
        println!("Conflicts:   main-chain heights {:?}", status.conflicting_heights);
    }
    Ok(())
}

#[derive(Serialize)]
struct BlockWithTxs {
    #[serde(flatten)]
    block: blkindex_storage::BlockView,
    #[serde(skip_serializing_if = "Option::is_none")]
    txs: Option<Vec<blkindex_storage::TxView>>,
}

pub async fn block(db: &str, id: &str, with_txs: bool) -> Result<()> {
    let store = open(db).await?;
    let found = match id.parse::<u64>() {
        Ok(height) if id.len() < 64 => store.block_by_height(height).await?,
        _ => store.block_by_hash(id).await?,
    };
    let block = found.with_context(|| format!("block {id} not found"))?;
    let txs = if with_txs {
        Some(store.block_txs(&block.hash).await?)
    } else {
        None
    };
    print_json(&BlockWithTxs { block, txs })
}

pub async fn tx(db: &str, hash: &str) -> Result<()> {
    let store = open(db).await?;
    let tx = store
        .tx_by_hash(hash)
        .await?
        .with_context(|| format!("transaction {hash} not found"))?;
    print_json(&tx)
}

pub async fn address(db: &str, address: &str, color: Option<u32>, utxos: bool) -> Result<()> {
    let store = open(db).await?;
    if utxos {
        print_json(&store.utxos(address, color).await?)
    } else {
        print_json(&store.balance(address).await?)
    }
}
