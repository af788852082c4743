//! Wire types for the block explorer and transaction processor the
//! production client talks to.

use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};

use super::{NetResult, NetworkError};

/// A block header as the explorer reports it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChainHeader {
    pub hash: String,
    pub height: u64,
    pub version: i32,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: u32,
    pub nonce: u32,
    /// Compact difficulty target, hex encoded.
    pub bits: String,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
}

impl ChainHeader {
    /// Reassemble the consensus header from the reported fields.
    pub fn header(&self) -> NetResult<Header> {
        let parse_hash = |text: &str, what: &str| {
            text.parse::<BlockHash>()
                .map_err(|e| NetworkError::Parse(format!("{what}: {e}")))
        };
        let prev_blockhash = match &self.previous_block_hash {
            Some(hash) => parse_hash(hash, "previousblockhash")?,
            None => BlockHash::all_zeros(),
        };
        let merkle_root = self
            .merkle_root
            .parse::<TxMerkleNode>()
            .map_err(|e| NetworkError::Parse(format!("merkleroot: {e}")))?;
        let bits = u32::from_str_radix(&self.bits, 16)
            .map_err(|e| NetworkError::Parse(format!("bits: {e}")))?;
        let header = Header {
            version: Version::from_consensus(self.version),
            prev_blockhash,
            merkle_root,
            time: self.time,
            bits: CompactTarget::from_consensus(bits),
            nonce: self.nonce,
        };
        // The reported hash must match the reassembled header.
        let expected = parse_hash(&self.hash, "hash")?;
        if header.block_hash() != expected {
            return Err(NetworkError::Parse(format!(
                "header fields do not hash to {expected}"
            )));
        }
        Ok(header)
    }
}

/// A Merkle inclusion proof in the shape explorers serve: the block, the
/// transaction's index, and the sibling node per level, with `"*"`
/// standing for a right-edge duplicate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxMerkleProof {
    pub index: u64,
    #[serde(rename = "txOrId")]
    pub tx_or_id: String,
    /// The containing block hash.
    pub target: String,
    pub nodes: Vec<String>,
}

/// One entry of an address or script history listing.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    /// Absent or non-positive while unconfirmed.
    #[serde(default)]
    pub height: Option<i64>,
}

/// The processor's mining fee policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeePolicy {
    #[serde(rename = "miningFee")]
    pub mining_fee: MiningFee,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MiningFee {
    pub satoshis: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeeQuoteResponse {
    pub policy: FeePolicy,
}

/// The processor's verdict on one submitted transaction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitStatus {
    #[serde(default)]
    pub txid: Option<String>,
    /// e.g. `SEEN_ON_NETWORK`, `REJECTED`.
    #[serde(rename = "txStatus", default)]
    pub tx_status: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(rename = "extraInfo", default)]
    pub extra_info: Option<String>,
}

/// Body for a single-transaction submission.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitTx {
    #[serde(rename = "rawTx")]
    pub raw_tx: String,
}
