//! Output script → address string.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

const P2PKH_VERSION: u8 = 0x00;
const P2SH_VERSION: u8 = 0x05;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Base58Check with a one-byte version prefix.
pub fn encode_address(version: u8, payload: &[u8; 20]) -> String {
    let mut data = Vec::with_capacity(21);
    data.push(version);
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}

/// Derive the address an output pays to.
///
/// Recognizes pay-to-pubkey-hash, pay-to-pubkey (compressed and
/// uncompressed) and pay-to-script-hash. Every other script, including
/// `OP_RETURN` data carriers, maps to the empty string.
pub fn script_to_address(script: &[u8]) -> String {
    match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            encode_address(P2PKH_VERSION, &to_array(hash))
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            encode_address(P2SH_VERSION, &to_array(hash))
        }
        [push, pubkey @ .., OP_CHECKSIG]
            if (*push == 33 || *push == 65) && pubkey.len() == *push as usize =>
        {
            encode_address(P2PKH_VERSION, &hash160(pubkey))
        }
        _ => String::new(),
    }
}

fn to_array(hash: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(hash);
    out
}
