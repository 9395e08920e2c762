//! Little-endian wire codec for blk-file records.
//!
//! Integers are fixed-width little-endian; lengths and counts use the
//! 1/3/5/9-byte varint (`< 0xfd` inline, `0xfd` → u16, `0xfe` → u32,
//! `0xff` → u64). Hashes are copied as-is (on-disk order).

use crate::error::DecodeError;
use crate::types::{BlockHeader, Hash256, RawBlock, RawTx, TxInput, TxOutput};

/// Upper bound on any declared element count or script length.
///
/// A record is never larger than its `size` prefix, so anything beyond the
/// bytes left is malformed; this keeps allocations bounded before that check.
const MAX_VEC_LEN: u64 = 32 * 1024 * 1024;

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        Ok(Hash256(self.read_array()?))
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    /// Read a varint length followed by that many bytes.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Read a varint used as a length or count, rejecting impossible values.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let at = self.pos;
        let len = self.read_varint()?;
        if len > MAX_VEC_LEN || len as usize > self.remaining() {
            return Err(DecodeError::Malformed {
                offset: at,
                reason: format!("length prefix {len} exceeds the {} bytes left", self.remaining()),
            });
        }
        Ok(len as usize)
    }
}

// ─── Writer helpers ──────────────────────────────────────────────────────────

pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

// ─── Encode / Decode ─────────────────────────────────────────────────────────

pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

impl Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_hash.0);
        out.extend_from_slice(&self.merkle_root.0);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decode for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: r.read_u32()?,
            prev_hash: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }
}

impl Encode for TxInput {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.prev_hash.0);
        out.extend_from_slice(&self.prev_index.to_le_bytes());
        write_var_bytes(out, &self.script_sig);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decode for TxInput {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            prev_hash: r.read_hash()?,
            prev_index: r.read_u32()?,
            script_sig: r.read_var_bytes()?,
            sequence: r.read_u32()?,
        })
    }
}

impl Encode for TxOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, &self.script_pubkey);
        out.extend_from_slice(&self.color.to_le_bytes());
    }
}

impl Decode for TxOutput {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: r.read_u64()?,
            script_pubkey: r.read_var_bytes()?,
            color: r.read_u32()?,
        })
    }
}

impl Encode for RawTx {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(out);
        }
        write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(out);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out.extend_from_slice(&u32::from(self.tx_type).to_le_bytes());
    }
}

impl Decode for RawTx {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.read_u32()?;
        let n_in = r.read_len()?;
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            inputs.push(TxInput::decode(r)?);
        }
        let n_out = r.read_len()?;
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            outputs.push(TxOutput::decode(r)?);
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: r.read_u32()?,
            tx_type: r.read_u32()?.into(),
        })
    }
}

/// Encodes the block payload only (header, txs, signature), without the
/// `{magic}{size}` record prefix.
impl Encode for RawBlock {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        write_varint(out, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(out);
        }
        write_var_bytes(out, &self.signature);
    }
}

impl RawBlock {
    /// Full blk-file record: `{magic:4}{size:4}{payload}`.
    pub fn to_record(&self) -> Vec<u8> {
        let payload = self.to_bytes();
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode a block payload whose record prefix has already been read.
    pub fn decode_payload(magic: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let header = BlockHeader::decode(&mut r)?;
        let tx_count = r.read_len()?;
        let mut txs = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            txs.push(RawTx::decode(&mut r)?);
        }
        let signature = if r.is_empty() {
            Vec::new()
        } else {
            r.read_var_bytes()?
        };
        Ok(Self {
            magic,
            size: payload.len() as u32,
            header,
            txs,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxType;

    #[test]
    fn varint_prefix_widths() {
        for (value, len) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x1_0000, 5), (0x1_0000_0000, 9)] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out.len(), len, "value {value:#x}");
            assert_eq!(Reader::new(&out).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn truncated_read_reports_offset() {
        let data = [1u8, 2, 3];
        let mut r = Reader::new(&data);
        r.read_u8().unwrap();
        assert_eq!(
            r.read_u32(),
            Err(DecodeError::Truncated { offset: 1, needed: 4 })
        );
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        let mut data = Vec::new();
        write_varint(&mut data, 1000);
        data.extend_from_slice(&[0u8; 10]);
        let err = Reader::new(&data).read_var_bytes().unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { offset: 0, .. }));
    }

    #[test]
    fn tx_decodes_what_it_encodes() {
        let tx = RawTx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: Hash256([7u8; 32]),
                prev_index: 3,
                script_sig: vec![0xaa; 71],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
                color: 2,
            }],
            lock_time: 0,
            tx_type: TxType::Normal,
        };
        let bytes = tx.to_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(RawTx::decode(&mut r).unwrap(), tx);
        assert!(r.is_empty());
    }

    #[test]
    fn block_signature_is_optional() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256([1u8; 32]),
            time: 1_469_608_003,
            bits: 0x1e0f_ffff,
            nonce: 155_279,
        };
        let bare = RawBlock {
            magic: 0xd9b4_bef9,
            size: 0,
            header: header.clone(),
            txs: vec![],
            signature: vec![],
        };
        let payload = bare.to_bytes();
        assert_eq!(payload.last(), Some(&0u8));
        let decoded = RawBlock::decode_payload(bare.magic, &payload).unwrap();
        assert!(decoded.signature.is_empty());
        assert_eq!(decoded.header, header);

        // Records that end right after the last tx carry no signature at all.
        let unsigned = &payload[..payload.len() - 1];
        let decoded = RawBlock::decode_payload(bare.magic, unsigned).unwrap();
        assert!(decoded.signature.is_empty());
        assert_eq!(decoded.size as usize, unsigned.len());

        let signed = RawBlock {
            signature: vec![0x30, 0x44, 0x02],
            ..bare
        };
        let decoded = RawBlock::decode_payload(signed.magic, &signed.to_bytes()).unwrap();
        assert_eq!(decoded.signature, vec![0x30, 0x44, 0x02]);
    }
}
