//! End-to-end ingestion against the SQLite store.

use std::path::Path;

use blkindex_core::address::script_to_address;
use blkindex_core::fixtures::{append_blk_file, p2pkh_script, write_blk_file, ChainBuilder};
use blkindex_core::store::Branch;
use blkindex_core::{BlockIndexer, ChainStore, IndexerConfig, UpdateReport};
use blkindex_storage::SqliteChainStore;

fn config(dir: &Path, batch_size: usize) -> IndexerConfig {
    IndexerConfig {
        blk_dir: dir.to_path_buf(),
        batch_size,
        ..IndexerConfig::default()
    }
}

async fn index(store: &SqliteChainStore, cfg: IndexerConfig) -> UpdateReport {
    let mut indexer = BlockIndexer::open(store.clone(), cfg).await.unwrap();
    indexer.update().await.unwrap()
}

async fn branch_of(store: &SqliteChainStore, hash: &str) -> Branch {
    store.block_by_hash(hash).await.unwrap().unwrap().branch
}

#[tokio::test]
async fn linear_chain_is_fully_main() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = ChainBuilder::new().linear(140);
    write_blk_file(dir.path(), 0, &blocks).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    let report = index(&store, config(dir.path(), 50)).await;
    assert_eq!(report.inserted, 140);
    assert_eq!(report.batches, 3);
    assert_eq!(report.reorgs, 0);

    let status = store.status().await.unwrap();
    assert_eq!(status.main_blocks, 140);
    assert_eq!(status.fork_blocks, 0);
    assert_eq!(status.orphan_blocks, 0);
    let tip = status.tip.unwrap();
    assert_eq!(tip.height, 139);
    assert_eq!(tip.hash, blocks[139].hash().to_hex());

    let mut prev_work = String::new();
    for (height, block) in blocks.iter().enumerate() {
        let view = store.block_by_height(height as u64).await.unwrap().unwrap();
        assert_eq!(view.hash, block.hash().to_hex());
        let work = view.chain_work.unwrap();
        assert!(work > prev_work, "chain work must grow with height");
        prev_work = work;
    }

    let genesis = store.block_by_height(0).await.unwrap().unwrap();
    assert_eq!(genesis.confirmations, 140);
    assert_eq!(store.block_count().await.unwrap(), 140);

    let named = store
        .tx_by_hash(&blocks[69].txs[0].txid().to_hex())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(named.block_height, Some(69));
    assert_eq!(named.block_hash, blocks[69].hash().to_hex());
    assert_eq!(named.branch, Branch::Main);
    assert!(status.conflicting_heights.is_empty());
}

#[tokio::test]
async fn equal_work_siblings_resolve_by_hash_then_by_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let genesis = builder.genesis();
    let a1 = builder.child_of(&genesis);
    let b1 = builder.child_of(&genesis);
    write_blk_file(dir.path(), 0, [&genesis, &a1, &b1]).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    index(&store, config(dir.path(), 10)).await;

    let (a1_hash, b1_hash) = (a1.hash().to_hex(), b1.hash().to_hex());
    let (winner, loser, loser_block) = if a1_hash < b1_hash {
        (a1_hash, b1_hash, &b1)
    } else {
        (b1_hash, a1_hash, &a1)
    };
    assert_eq!(branch_of(&store, &winner).await, Branch::Main);
    assert_eq!(branch_of(&store, &loser).await, Branch::Fork);
    let at_one = store.block_by_height(1).await.unwrap().unwrap();
    assert_eq!(at_one.hash, winner);
    let fork_view = store.block_by_hash(&loser).await.unwrap().unwrap();
    assert_eq!(fork_view.height, Some(1));
    assert_eq!(fork_view.confirmations, 0);

    // One more block on the losing side outweighs the winner.
    let extra = builder.child_of(loser_block);
    append_blk_file(dir.path(), 0, [&extra]).unwrap();
    let report = index(&store, config(dir.path(), 10)).await;
    assert_eq!(report.reorgs, 1);
    assert_eq!(report.max_reorg_depth, 1);
    assert_eq!(branch_of(&store, &winner).await, Branch::Fork);
    assert_eq!(branch_of(&store, &loser).await, Branch::Main);
    assert_eq!(store.tip().await.unwrap().unwrap().hash, extra.hash().to_hex());

    let status = store.status().await.unwrap();
    assert_eq!(status.main_blocks, 3);
    assert_eq!(status.fork_blocks, 1);
    assert!(store.main_height_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn reorg_recomputes_spent_flags() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let genesis = builder.genesis();
    let mint = builder.mint_tx(1, 500, 7);
    let m = builder.block(genesis.hash(), vec![mint.clone()]);
    let spend = builder.spend_tx(&mint, 0, 2);
    let a1 = builder.block(m.hash(), vec![spend.clone()]);
    write_blk_file(dir.path(), 0, [&genesis, &m, &a1]).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    index(&store, config(dir.path(), 10)).await;

    let alice = script_to_address(&p2pkh_script(1));
    let bob = script_to_address(&p2pkh_script(2));
    let minted = store.tx_by_hash(&mint.txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(minted.outputs[0].spent, Some(true));
    assert!(store.utxos(&alice, None).await.unwrap().is_empty());
    assert_eq!(store.utxos(&bob, Some(7)).await.unwrap().len(), 1);

    // A heavier branch from `m` without the spend.
    let fork = builder.extend(&m, 2);
    append_blk_file(dir.path(), 0, &fork).unwrap();
    let report = index(&store, config(dir.path(), 10)).await;
    assert_eq!(report.reorgs, 1);

    let minted = store.tx_by_hash(&mint.txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(minted.outputs[0].spent, Some(false));
    let spent_on_fork = store.tx_by_hash(&spend.txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(spent_on_fork.branch, Branch::Fork);
    assert_eq!(spent_on_fork.outputs[0].spent, None);

    let utxos = store.utxos(&alice, Some(7)).await.unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 500);
    assert!(store.utxos(&bob, None).await.unwrap().is_empty());
    assert!(store.main_height_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn orphans_anchor_when_parent_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let genesis = builder.genesis();
    let b1 = builder.child_of(&genesis);
    let spend = builder.spend_tx(&b1.txs[0], 0, 4);
    let b2 = builder.block(b1.hash(), vec![spend.clone()]);
    let b3 = builder.child_of(&b2);
    write_blk_file(dir.path(), 0, [&genesis, &b3, &b2, &b1]).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    // One block per batch so orphans cross transaction boundaries.
    let report = index(&store, config(dir.path(), 1)).await;
    assert_eq!(report.orphaned, 2);
    assert_eq!(report.anchored, 2);

    let status = store.status().await.unwrap();
    assert_eq!(status.main_blocks, 4);
    assert_eq!(status.orphan_blocks, 0);
    assert_eq!(store.tip().await.unwrap().unwrap().hash, b3.hash().to_hex());
    let checkpoint = store.load_orphans().await.unwrap();
    assert!(checkpoint.links.is_empty());
    assert!(checkpoint.inputs.is_empty());

    let tx = store.tx_by_hash(&spend.txid().to_hex()).await.unwrap().unwrap();
    assert!(tx.valid);
    assert_eq!(tx.block_height, Some(2));
    assert_eq!(tx.inputs[0].prev_tx, Some(b1.txs[0].txid().to_hex()));
    let funding = store.tx_by_hash(&b1.txs[0].txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(funding.outputs[0].spent, Some(true));
}

#[tokio::test]
async fn unknown_parent_stays_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let genesis = builder.genesis();
    let missing = builder.child_of(&genesis);
    let stray = builder.child_of(&missing);
    write_blk_file(dir.path(), 0, [&genesis, &stray]).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    index(&store, config(dir.path(), 10)).await;
    let view = store.block_by_hash(&stray.hash().to_hex()).await.unwrap().unwrap();
    assert_eq!(view.branch, Branch::Orphan);
    assert_eq!(view.height, None);
    assert_eq!(view.chain_work, None);
    assert_eq!(store.status().await.unwrap().orphan_blocks, 1);
}

#[tokio::test]
async fn mint_output_spent_later() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let mut blocks = builder.linear(2);
    let mint = builder.mint_tx(5, 1_000, 3);
    blocks.push(builder.block(blocks[1].hash(), vec![mint.clone()]));
    let more = builder.extend(&blocks[2], 3);
    blocks.extend(more);
    write_blk_file(dir.path(), 0, &blocks).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    index(&store, config(dir.path(), 2)).await;

    let minted = store.tx_by_hash(&mint.txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(minted.tx_type, blkindex_core::TxType::Mint);
    assert_eq!(minted.inputs[0].prev_tx, None);
    assert_eq!(minted.outputs[0].spent, Some(false));
    let minter = script_to_address(&p2pkh_script(5));
    assert_eq!(store.balance(&minter).await.unwrap()[0].value, 1_000);

    let spend = builder.spend_tx(&mint, 0, 6);
    let spending = builder.block(blocks[5].hash(), vec![spend]);
    append_blk_file(dir.path(), 0, [&spending]).unwrap();
    let report = index(&store, config(dir.path(), 2)).await;
    assert_eq!(report.inserted, 1);

    let minted = store.tx_by_hash(&mint.txid().to_hex()).await.unwrap().unwrap();
    assert_eq!(minted.outputs[0].spent, Some(true));
    assert!(store.balance(&minter).await.unwrap().is_empty());

    let receiver = script_to_address(&p2pkh_script(6));
    let balance = store.balance(&receiver).await.unwrap();
    assert_eq!(balance.len(), 1);
    assert_eq!(balance[0].color, 3);
    assert_eq!(balance[0].value, 1_000);
}

#[tokio::test]
async fn reingesting_known_blocks_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let db = db_dir.path().join("chain.db");
    let blocks = ChainBuilder::new().linear(12);
    write_blk_file(dir.path(), 0, &blocks).unwrap();

    let store = SqliteChainStore::open(db.to_str().unwrap()).await.unwrap();
    index(&store, config(dir.path(), 5)).await;
    let before = store.status().await.unwrap();
    drop(store);

    // Reopen: the cursor resumes at the end of the file.
    let store = SqliteChainStore::open(db.to_str().unwrap()).await.unwrap();
    let report = index(&store, config(dir.path(), 5)).await;
    assert_eq!(report.blocks_read, 0);

    // A second directory holding the same blocks (cursor lost) changes nothing.
    let copy = tempfile::tempdir().unwrap();
    write_blk_file(copy.path(), 0, &blocks).unwrap();
    let report = index(&store, config(copy.path(), 5)).await;
    assert_eq!(report.blocks_read, 12);
    assert_eq!(report.skipped, 12);
    assert_eq!(report.inserted, 0);
    assert_eq!(store.status().await.unwrap(), before);
}

#[tokio::test]
async fn next_blk_file_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let blocks = builder.linear(8);
    write_blk_file(dir.path(), 0, &blocks[..5]).unwrap();

    let store = SqliteChainStore::in_memory().await.unwrap();
    let report = index(&store, config(dir.path(), 50)).await;
    assert_eq!(report.blkfile_number, 0);

    write_blk_file(dir.path(), 1, &blocks[5..]).unwrap();
    let report = index(&store, config(dir.path(), 50)).await;
    assert_eq!(report.files_switched, 1);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.blkfile_number, 1);

    let cfg = config(dir.path(), 50);
    let cursor = store.latest_cursor(&cfg.dirname()).await.unwrap().unwrap();
    assert_eq!(cursor.blkfile_number, 1);
    assert_eq!(store.status().await.unwrap().main_blocks, 8);
}

#[tokio::test]
async fn parallel_preparation_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ChainBuilder::new();
    let mut blocks = builder.linear(3);
    for seed in 10..20u8 {
        let mint = builder.mint_tx(seed, seed as u64 * 100, seed as u32 % 3);
        let parent = blocks.last().unwrap().hash();
        blocks.push(builder.block(parent, vec![mint]));
    }
    write_blk_file(dir.path(), 0, &blocks).unwrap();

    let sequential = SqliteChainStore::in_memory().await.unwrap();
    index(&sequential, config(dir.path(), 4)).await;

    let parallel = SqliteChainStore::in_memory().await.unwrap();
    let mut cfg = config(dir.path(), 4);
    cfg.persist_workers = 4;
    index(&parallel, cfg).await;

    assert_eq!(
        sequential.status().await.unwrap(),
        parallel.status().await.unwrap()
    );
    for seed in 10..20u8 {
        let address = script_to_address(&p2pkh_script(seed));
        assert_eq!(
            sequential.balance(&address).await.unwrap(),
            parallel.balance(&address).await.unwrap()
        );
    }
}
