//! SPV confirmations: the time order over possibly-unconfirmed events and
//! the fully expanded proof bundled with a stored transaction.

use std::cmp::Ordering;
use std::fmt;

use bitcoin::block::Header;
use bitcoin::{TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};

/// A point in time that may be unconfirmed.
///
/// Unconfirmed sorts after every confirmed timestamp, so pending activity
/// always lands at the end of a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum When {
    Confirmed(u32),
    Unconfirmed,
}

impl When {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, When::Confirmed(_))
    }
}

impl Ord for When {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (When::Confirmed(a), When::Confirmed(b)) => a.cmp(b),
            (When::Confirmed(_), When::Unconfirmed) => Ordering::Less,
            (When::Unconfirmed, When::Confirmed(_)) => Ordering::Greater,
            (When::Unconfirmed, When::Unconfirmed) => Ordering::Equal,
        }
    }
}

impl PartialOrd for When {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            When::Confirmed(t) => write!(f, "{t}"),
            When::Unconfirmed => write!(f, "unconfirmed"),
        }
    }
}

/// Everything needed to replay a mined transaction's inclusion proof:
/// height, header, position in the block, and the expanded Merkle branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub height: u64,
    pub header: Header,
    /// Position of the transaction within its block.
    pub index: u64,
    /// Sibling hashes from the leaf to the root.
    pub branch: Vec<TxMerkleNode>,
}

impl Confirmation {
    /// Whether the branch rehashes from `txid` to the header's Merkle root.
    pub fn validate(&self, txid: &Txid) -> bool {
        use bitcoin::hashes::{sha256d, Hash};
        let mut working = TxMerkleNode::from_raw_hash(txid.to_raw_hash());
        let mut index = self.index;
        for sibling in &self.branch {
            let mut data = [0u8; 64];
            if index & 1 == 0 {
                data[..32].copy_from_slice(working.as_byte_array());
                data[32..].copy_from_slice(sibling.as_byte_array());
            } else {
                data[..32].copy_from_slice(sibling.as_byte_array());
                data[32..].copy_from_slice(working.as_byte_array());
            }
            working = TxMerkleNode::from_raw_hash(sha256d::Hash::hash(&data));
            index >>= 1;
        }
        working == self.header.merkle_root
    }

    pub fn when(&self) -> When {
        When::Confirmed(self.header.time)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::{sha256d, Hash};

    use super::*;
    use crate::merkle::{merkle_branch, merkle_root};

    #[test]
    fn unconfirmed_sorts_last() {
        let mut whens = vec![
            When::Unconfirmed,
            When::Confirmed(20),
            When::Confirmed(10),
        ];
        whens.sort();
        assert_eq!(
            whens,
            vec![When::Confirmed(10), When::Confirmed(20), When::Unconfirmed]
        );
    }

    #[test]
    fn confirmation_validates_against_the_root() {
        let txids: Vec<Txid> = (0..5u8)
            .map(|n| Txid::from_raw_hash(sha256d::Hash::hash(&[n])))
            .collect();
        let root = merkle_root(&txids).unwrap();
        let header = Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: bitcoin::BlockHash::all_zeros(),
            merkle_root: root,
            time: 1_700_000_000,
            bits: bitcoin::CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        let confirmation = Confirmation {
            height: 100,
            header,
            index: 3,
            branch: merkle_branch(&txids, 3),
        };
        assert!(confirmation.validate(&txids[3]));
        assert!(!confirmation.validate(&txids[1]));
    }
}
