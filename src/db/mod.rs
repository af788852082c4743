//! Storage: one trait covering the header store, transaction store, and
//! wallet registry primitives, with a SQLite production implementation
//! and an in-memory one for tests.

pub mod memory;
pub mod sqlite;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::merkle::Bump;
use crate::script::ScriptHash;
use crate::wallet::account::Redeemable;

pub use self::memory::MemoryDatabase;
pub use self::sqlite::SqliteDatabase;

/// On-disk status byte for a mined transaction.
pub const STATUS_MINED: u8 = 0b1000_0000;
/// On-disk status byte for a pending transaction. Any value other than
/// [`STATUS_MINED`] reads back as pending.
pub const STATUS_PENDING: u8 = 0b1111_0101;

/// Confirmation status of a stored transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Mined { height: u64 },
}

impl TxStatus {
    pub fn is_mined(&self) -> bool {
        matches!(self, TxStatus::Mined { .. })
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            TxStatus::Pending => STATUS_PENDING,
            TxStatus::Mined { .. } => STATUS_MINED,
        }
    }

    pub fn from_parts(status: u8, height: Option<u64>) -> TxStatus {
        match (status, height) {
            (STATUS_MINED, Some(height)) => TxStatus::Mined { height },
            _ => TxStatus::Pending,
        }
    }

    pub fn height(&self) -> Option<u64> {
        match self {
            TxStatus::Mined { height } => Some(*height),
            TxStatus::Pending => None,
        }
    }
}

/// A stored raw transaction and its status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    pub raw: Vec<u8>,
    pub status: TxStatus,
}

/// A stored block: header plus whatever of its Merkle tree has arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    pub height: u64,
    pub header: Header,
    pub bump: Option<Bump>,
}

impl BlockEntry {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn merkle_root(&self) -> TxMerkleNode {
        self.header.merkle_root
    }
}

/// The spending side of a redemption link: (txid, input index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inpoint {
    pub txid: Txid,
    pub index: u32,
}

impl Inpoint {
    pub fn new(txid: Txid, index: u32) -> Self {
        Inpoint { txid, index }
    }
}

/// The stored form of a key sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Key expression text.
    pub key: String,
    /// Derivation rule, rendered as a path.
    pub path: String,
    pub next: u32,
}

/// 36-byte outpoint encoding: txid little-endian then index little-endian.
pub fn write_outpoint(outpoint: &OutPoint) -> [u8; 36] {
    let bytes = consensus::serialize(outpoint);
    bytes.try_into().expect("outpoint serializes to 36 bytes")
}

pub fn read_outpoint(data: &[u8]) -> Result<OutPoint> {
    if data.len() != 36 {
        return Err(Error::InvalidSyntax(format!(
            "outpoint must be 36 bytes, got {}",
            data.len()
        )));
    }
    Ok(consensus::deserialize(data)?)
}

/// Same 36-byte shape for the spending side.
pub fn write_inpoint(inpoint: &Inpoint) -> [u8; 36] {
    write_outpoint(&OutPoint::new(inpoint.txid, inpoint.index))
}

pub fn read_inpoint(data: &[u8]) -> Result<Inpoint> {
    let outpoint = read_outpoint(data)?;
    Ok(Inpoint::new(outpoint.txid, outpoint.vout))
}

/// Every operation the header store, transaction store, and wallet
/// registry need from persistence. One production implementation exists,
/// backed by SQLite; tests run against an in-memory one behind the same
/// trait.
pub trait Database {
    // ----- blocks and proofs -----

    /// Insert or replace the header at a height.
    fn insert_block(&mut self, height: u64, header: &Header) -> Result<()>;

    fn block_by_height(&self, height: u64) -> Result<Option<BlockEntry>>;

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockEntry>>;

    fn block_by_root(&self, root: &TxMerkleNode) -> Result<Option<BlockEntry>>;

    /// The entry at the maximum stored height.
    fn latest_block(&self) -> Result<Option<BlockEntry>>;

    fn remove_block(&mut self, height: u64) -> Result<()>;

    /// Attach or replace the block's Merkle tree.
    fn set_block_bump(&mut self, height: u64, bump: Option<&Bump>) -> Result<()>;

    /// The height of the block whose Merkle tree covers a txid, if any.
    fn block_covering(&self, txid: &Txid) -> Result<Option<u64>>;

    // ----- transactions -----

    /// Insert or replace a raw transaction.
    fn put_transaction(&mut self, txid: &Txid, raw: &[u8], status: TxStatus) -> Result<()>;

    fn transaction(&self, txid: &Txid) -> Result<Option<TxRecord>>;

    fn set_transaction_status(&mut self, txid: &Txid, status: TxStatus) -> Result<()>;

    /// Remove the raw transaction row. Status rules live a layer up.
    fn delete_transaction(&mut self, txid: &Txid) -> Result<()>;

    fn transactions_at_height(&self, height: u64) -> Result<Vec<Txid>>;

    fn unconfirmed(&self) -> Result<Vec<Txid>>;

    // ----- scripts, outputs, addresses, redemptions -----

    fn put_script(&mut self, hash: &ScriptHash, script: &ScriptBuf) -> Result<()>;

    fn script(&self, hash: &ScriptHash) -> Result<Option<ScriptBuf>>;

    fn add_output(&mut self, hash: &ScriptHash, outpoint: &OutPoint) -> Result<()>;

    fn outputs_by_script_hash(&self, hash: &ScriptHash) -> Result<Vec<OutPoint>>;

    fn delete_output(&mut self, outpoint: &OutPoint) -> Result<()>;

    fn add_address(&mut self, address: &str, hash: &ScriptHash) -> Result<()>;

    fn script_hashes_by_address(&self, address: &str) -> Result<Vec<ScriptHash>>;

    fn set_redemption(&mut self, outpoint: &OutPoint, inpoint: &Inpoint) -> Result<()>;

    fn redemption(&self, outpoint: &OutPoint) -> Result<Option<Inpoint>>;

    /// Remove every redemption whose spending side is the given txid.
    fn delete_redemptions_by_spender(&mut self, txid: &Txid) -> Result<()>;

    // ----- wallets -----

    fn create_wallet(&mut self, name: &str) -> Result<()>;

    fn wallet_exists(&self, name: &str) -> Result<bool>;

    fn list_wallets(&self) -> Result<Vec<String>>;

    fn set_key(&mut self, wallet: &str, name: &str, expression: &str) -> Result<()>;

    fn key(&self, wallet: &str, name: &str) -> Result<Option<String>>;

    fn keys(&self, wallet: &str) -> Result<Vec<(String, String)>>;

    fn set_sequence(&mut self, wallet: &str, name: &str, record: &SequenceRecord) -> Result<()>;

    fn sequence(&self, wallet: &str, name: &str) -> Result<Option<SequenceRecord>>;

    fn sequences(&self, wallet: &str) -> Result<Vec<(String, SequenceRecord)>>;

    fn add_unused(&mut self, wallet: &str, recipient: &str) -> Result<()>;

    fn remove_unused(&mut self, wallet: &str, recipient: &str) -> Result<()>;

    fn unused(&self, wallet: &str) -> Result<Vec<String>>;

    // ----- global key maps -----

    fn set_to_private(&mut self, public: &str, private: &str) -> Result<()>;

    fn to_private(&self, public: &str) -> Result<Option<String>>;

    fn set_invert_hash(&mut self, function: &str, digest: &[u8], preimage: &[u8]) -> Result<()>;

    fn invert_hash(&self, function: &str, digest: &[u8]) -> Result<Option<Vec<u8>>>;

    // ----- accounts -----

    fn set_account_entry(
        &mut self,
        wallet: &str,
        outpoint: &OutPoint,
        entry: &Redeemable,
    ) -> Result<()>;

    fn delete_account_entry(&mut self, wallet: &str, outpoint: &OutPoint) -> Result<()>;

    fn account_entries(&self, wallet: &str) -> Result<Vec<(OutPoint, Redeemable)>>;

    // ----- payments -----

    /// The wallet's payment state as a JSON document.
    fn payments(&self, wallet: &str) -> Result<Option<String>>;

    fn set_payments(&mut self, wallet: &str, json: &str) -> Result<()>;
}

/// Wallet names are symbols: a letter, then letters, digits, underscores.
pub fn valid_wallet_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::{sha256d, Hash};

    use super::*;

    #[test]
    fn outpoint_codec_round_trip() {
        let outpoint = OutPoint::new(Txid::from_raw_hash(sha256d::Hash::hash(b"tx")), 7);
        assert_eq!(read_outpoint(&write_outpoint(&outpoint)).unwrap(), outpoint);
    }

    #[test]
    fn outpoint_layout_is_txid_then_index() {
        let txid = Txid::from_raw_hash(sha256d::Hash::hash(b"tx"));
        let bytes = write_outpoint(&OutPoint::new(txid, 0x01020304));
        assert_eq!(&bytes[..32], txid.to_raw_hash().as_byte_array());
        assert_eq!(&bytes[32..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn wallet_name_validation() {
        assert!(valid_wallet_name("alpha"));
        assert!(valid_wallet_name("A1_b2"));
        assert!(!valid_wallet_name(""));
        assert!(!valid_wallet_name("1st"));
        assert!(!valid_wallet_name("has-dash"));
        assert!(!valid_wallet_name("has space"));
    }

    #[test]
    fn status_byte_round_trip() {
        assert_eq!(TxStatus::Pending.to_byte(), STATUS_PENDING);
        assert_eq!(TxStatus::Mined { height: 5 }.to_byte(), STATUS_MINED);
        assert_eq!(
            TxStatus::from_parts(STATUS_MINED, Some(5)),
            TxStatus::Mined { height: 5 }
        );
        // Any unknown status byte reads back as pending.
        assert_eq!(TxStatus::from_parts(0x33, Some(5)), TxStatus::Pending);
        assert_eq!(TxStatus::from_parts(STATUS_PENDING, None), TxStatus::Pending);
    }
}
