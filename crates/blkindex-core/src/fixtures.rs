//! Helpers for building synthetic chains and blk-files.
//!
//! Blocks use an easy target and are never mined; the indexer does not
//! validate proof-of-work, it only accounts for it.

use std::path::{Path, PathBuf};

use crate::cursor::blk_file_name;
use crate::types::{BlockHeader, Hash256, RawBlock, RawTx, TxInput, TxOutput, TxType};

/// Magic used for synthetic records.
pub const TEST_MAGIC: u32 = 0xd9b4_bef9;

/// Regtest-style target: every block adds a work of 2.
pub const EASY_BITS: u32 = 0x207f_ffff;

/// P2PKH script paying to a deterministic key hash derived from `seed`.
pub fn p2pkh_script(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Builds blocks and transactions with unique hashes.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    counter: u32,
    time: u32,
    bits: u32,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            counter: 0,
            time: 1_469_608_003,
            bits: EASY_BITS,
        }
    }

    /// Use `bits` for every block built from now on.
    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    fn tick(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    /// A MINT transaction creating `value` units of `color` for `seed`.
    pub fn mint_tx(&mut self, seed: u8, value: u64, color: u32) -> RawTx {
        let n = self.tick();
        RawTx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: Hash256::ZERO,
                prev_index: u32::MAX,
                script_sig: n.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value,
                script_pubkey: p2pkh_script(seed),
                color,
            }],
            lock_time: 0,
            tx_type: TxType::Mint,
        }
    }

    /// A NORMAL transaction spending `prev:index` into one output for `seed`.
    pub fn spend_tx(&mut self, prev: &RawTx, index: u32, seed: u8) -> RawTx {
        let n = self.tick();
        let spent = &prev.outputs[index as usize];
        RawTx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: prev.txid(),
                prev_index: index,
                script_sig: n.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: spent.value,
                script_pubkey: p2pkh_script(seed),
                color: spent.color,
            }],
            lock_time: 0,
            tx_type: TxType::Normal,
        }
    }

    /// A block on top of `prev` carrying `txs`.
    pub fn block(&mut self, prev: Hash256, txs: Vec<RawTx>) -> RawBlock {
        let nonce = self.tick();
        self.time += 60;
        let mut ids = Vec::with_capacity(txs.len() * 32);
        for tx in &txs {
            ids.extend_from_slice(&tx.txid().0);
        }
        let mut block = RawBlock {
            magic: TEST_MAGIC,
            size: 0,
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: Hash256::double_sha256(&ids),
                time: self.time,
                bits: self.bits,
                nonce,
            },
            txs,
            signature: Vec::new(),
        };
        block.size = (block.to_record().len() - 8) as u32;
        block
    }

    /// A genesis block with a single mint.
    pub fn genesis(&mut self) -> RawBlock {
        let mint = self.mint_tx(0, 50_0000_0000, 0);
        self.block(Hash256::ZERO, vec![mint])
    }

    /// A child of `parent` carrying only a fresh mint.
    pub fn child_of(&mut self, parent: &RawBlock) -> RawBlock {
        let mint = self.mint_tx(0, 50_0000_0000, 0);
        self.block(parent.hash(), vec![mint])
    }

    /// `len` linked blocks starting with a genesis block.
    pub fn linear(&mut self, len: usize) -> Vec<RawBlock> {
        let mut blocks: Vec<RawBlock> = Vec::with_capacity(len);
        for _ in 0..len {
            let block = match blocks.last() {
                Some(parent) => self.child_of(parent),
                None => self.genesis(),
            };
            blocks.push(block);
        }
        blocks
    }

    /// `len` linked blocks on top of `parent`.
    pub fn extend(&mut self, parent: &RawBlock, len: usize) -> Vec<RawBlock> {
        let mut blocks: Vec<RawBlock> = Vec::with_capacity(len);
        for _ in 0..len {
            let block = self.child_of(blocks.last().unwrap_or(parent));
            blocks.push(block);
        }
        blocks
    }
}

/// Concatenated blk-file records for `blocks`.
pub fn blk_bytes<'a>(blocks: impl IntoIterator<Item = &'a RawBlock>) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend(block.to_record());
    }
    out
}

/// Write `blocks` as `blkNNNNN.dat` under `dir`.
pub fn write_blk_file<'a>(
    dir: &Path,
    number: u32,
    blocks: impl IntoIterator<Item = &'a RawBlock>,
) -> std::io::Result<PathBuf> {
    let path = dir.join(blk_file_name(number));
    std::fs::write(&path, blk_bytes(blocks))?;
    Ok(path)
}

/// Append `blocks` to an existing (or new) `blkNNNNN.dat` under `dir`.
pub fn append_blk_file<'a>(
    dir: &Path,
    number: u32,
    blocks: impl IntoIterator<Item = &'a RawBlock>,
) -> std::io::Result<PathBuf> {
    use std::io::Write;

    let path = dir.join(blk_file_name(number));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(&blk_bytes(blocks))?;
    Ok(path)
}
