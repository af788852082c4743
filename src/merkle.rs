//! The BUMP structure: one level-indexed Merkle proof per block, shared by
//! every txid it covers.
//!
//! A BUMP begins life as the fragment proving a single txid and grows as
//! more branches for the same block are merged in. Merging is commutative:
//! inserting a transaction and then its path fragments reaches the same
//! state as the reverse order.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{TxMerkleNode, Txid};

use crate::error::{Error, Result};
use crate::wire::{put_var_int, Cursor};

const FLAG_DATA: u8 = 0x00;
const FLAG_DUPLICATE: u8 = 0x01;
const FLAG_TXID: u8 = 0x02;

/// One entry at one level of the proof tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BumpLeaf {
    /// Position at this level, counting from the left edge of the block.
    pub offset: u64,
    /// The node hash; absent when this leaf duplicates its left sibling.
    pub hash: Option<TxMerkleNode>,
    /// Whether the hash is a txid this proof exists to cover.
    pub is_txid: bool,
}

impl BumpLeaf {
    fn duplicate(offset: u64) -> Self {
        BumpLeaf {
            offset,
            hash: None,
            is_txid: false,
        }
    }
}

/// A level-indexed set of Merkle path fragments for one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bump {
    pub block_height: u64,
    /// `levels[0]` holds txid leaves and their siblings; each higher level
    /// holds the siblings along the paths to the root. The root itself is
    /// never stored.
    pub levels: Vec<Vec<BumpLeaf>>,
}

fn combine(left: &TxMerkleNode, right: &TxMerkleNode) -> TxMerkleNode {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_byte_array());
    data[32..].copy_from_slice(right.as_byte_array());
    TxMerkleNode::from_raw_hash(sha256d::Hash::hash(&data))
}

fn node_of(txid: &Txid) -> TxMerkleNode {
    TxMerkleNode::from_raw_hash(txid.to_raw_hash())
}

impl Bump {
    /// Build the fragment proving one txid from a classic Merkle branch.
    ///
    /// `branch[i]` is the sibling at level `i`; a sibling equal to the
    /// running hash on the right edge of an odd level is recorded as a
    /// duplicate leaf.
    pub fn from_branch(
        block_height: u64,
        tx_index: u64,
        txid: &Txid,
        branch: &[TxMerkleNode],
    ) -> Bump {
        let mut levels = Vec::with_capacity(branch.len());
        let mut working = node_of(txid);
        for (level, sibling) in branch.iter().enumerate() {
            let offset = tx_index >> level;
            let sibling_offset = offset ^ 1;
            let mut entries = Vec::with_capacity(2);
            if level == 0 {
                entries.push(BumpLeaf {
                    offset,
                    hash: Some(working),
                    is_txid: true,
                });
            }
            // A right-edge node pairs with itself; record that as a
            // duplicate rather than repeating the hash.
            if offset & 1 == 0 && *sibling == working {
                entries.push(BumpLeaf::duplicate(sibling_offset));
                working = combine(&working, &working);
            } else {
                entries.push(BumpLeaf {
                    offset: sibling_offset,
                    hash: Some(*sibling),
                    is_txid: false,
                });
                working = if offset & 1 == 0 {
                    combine(&working, sibling)
                } else {
                    combine(sibling, &working)
                };
            }
            entries.sort_by_key(|l| l.offset);
            levels.push(entries);
        }
        Bump {
            block_height,
            levels,
        }
    }

    /// As [`Bump::from_branch`], but with explicit duplicate markers: a
    /// `None` sibling means the node pairs with itself on the right edge.
    pub fn from_branch_nodes(
        block_height: u64,
        tx_index: u64,
        txid: &Txid,
        nodes: &[Option<TxMerkleNode>],
    ) -> Result<Bump> {
        let mut levels = Vec::with_capacity(nodes.len());
        let mut working = node_of(txid);
        for (level, sibling) in nodes.iter().enumerate() {
            let offset = tx_index >> level;
            let sibling_offset = offset ^ 1;
            let mut entries = Vec::with_capacity(2);
            if level == 0 {
                entries.push(BumpLeaf {
                    offset,
                    hash: Some(working),
                    is_txid: true,
                });
            }
            match sibling {
                None => {
                    if offset & 1 != 0 {
                        // Only a right-edge (even offset) node can
                        // duplicate itself.
                        return Err(Error::MerkleMismatch);
                    }
                    entries.push(BumpLeaf::duplicate(sibling_offset));
                    working = combine(&working, &working);
                }
                Some(hash) => {
                    entries.push(BumpLeaf {
                        offset: sibling_offset,
                        hash: Some(*hash),
                        is_txid: false,
                    });
                    working = if offset & 1 == 0 {
                        combine(&working, hash)
                    } else {
                        combine(hash, &working)
                    };
                }
            }
            entries.sort_by_key(|l| l.offset);
            levels.push(entries);
        }
        Ok(Bump {
            block_height,
            levels,
        })
    }

    /// Height of the proven tree; zero for a single-transaction block.
    pub fn tree_height(&self) -> usize {
        self.levels.len()
    }

    /// The txids this proof covers.
    pub fn txids(&self) -> Vec<Txid> {
        match self.levels.first() {
            None => Vec::new(),
            Some(level) => level
                .iter()
                .filter(|l| l.is_txid)
                .filter_map(|l| l.hash)
                .map(|h| Txid::from_raw_hash(h.to_raw_hash()))
                .collect(),
        }
    }

    /// Position of a covered transaction within its block.
    pub fn tx_index(&self, txid: &Txid) -> Option<u64> {
        let node = node_of(txid);
        self.levels.first()?.iter().find_map(|l| {
            (l.is_txid && l.hash == Some(node)).then_some(l.offset)
        })
    }

    fn leaf_at(&self, level: usize, offset: u64) -> Option<&BumpLeaf> {
        self.levels
            .get(level)?
            .iter()
            .find(|l| l.offset == offset)
    }

    /// Rehash the branch for one covered txid up to the root.
    pub fn root_for(&self, txid: &Txid) -> Result<TxMerkleNode> {
        let mut offset = self
            .tx_index(txid)
            .ok_or(Error::MerkleMismatch)?;
        let mut working = node_of(txid);
        for level in 0..self.levels.len() {
            working = self.step(level, offset, working)?;
            offset >>= 1;
        }
        Ok(working)
    }

    fn step(&self, level: usize, offset: u64, working: TxMerkleNode) -> Result<TxMerkleNode> {
        let sibling_offset = offset ^ 1;
        let sibling = self
            .leaf_at(level, sibling_offset)
            .ok_or(Error::MerkleMismatch)?;
        let sibling_hash = match sibling.hash {
            Some(h) => h,
            None => working,
        };
        Ok(if offset & 1 == 0 {
            combine(&working, &sibling_hash)
        } else {
            combine(&sibling_hash, &working)
        })
    }

    /// The common root, provided every covered txid rehashes to the same
    /// value. An empty proof (no txid leaves) has no root.
    pub fn root(&self) -> Result<TxMerkleNode> {
        let txids = self.txids();
        let first = txids.first().ok_or(Error::MerkleMismatch)?;
        let root = self.root_for(first)?;
        for txid in &txids[1..] {
            if self.root_for(txid)? != root {
                return Err(Error::MerkleMismatch);
            }
        }
        Ok(root)
    }

    /// The expanded classic Merkle branch for a covered txid: its block
    /// position and the sibling hash at every level.
    pub fn branch(&self, txid: &Txid) -> Result<(u64, Vec<TxMerkleNode>)> {
        let index = self.tx_index(txid).ok_or(Error::MerkleMismatch)?;
        let mut offset = index;
        let mut working = node_of(txid);
        let mut branch = Vec::with_capacity(self.levels.len());
        for level in 0..self.levels.len() {
            let sibling = self
                .leaf_at(level, offset ^ 1)
                .ok_or(Error::MerkleMismatch)?;
            let sibling_hash = sibling.hash.unwrap_or(working);
            branch.push(sibling_hash);
            working = if offset & 1 == 0 {
                combine(&working, &sibling_hash)
            } else {
                combine(&sibling_hash, &working)
            };
            offset >>= 1;
        }
        Ok((index, branch))
    }

    /// Merge another fragment for the same block into this proof.
    ///
    /// Fails with `merkle-mismatch` when the fragments disagree on a node
    /// or no longer rehash to a single root.
    pub fn merge(&mut self, other: &Bump) -> Result<()> {
        if self.block_height != other.block_height
            || self.levels.len() != other.levels.len()
        {
            return Err(Error::MerkleMismatch);
        }
        let before = self.clone();
        for (level, entries) in other.levels.iter().enumerate() {
            for leaf in entries {
                match self
                    .levels[level]
                    .iter_mut()
                    .find(|l| l.offset == leaf.offset)
                {
                    Some(existing) => {
                        if existing.hash != leaf.hash {
                            *self = before;
                            return Err(Error::MerkleMismatch);
                        }
                        existing.is_txid |= leaf.is_txid;
                    }
                    None => self.levels[level].push(leaf.clone()),
                }
            }
            self.levels[level].sort_by_key(|l| l.offset);
        }
        if self.root().is_err() {
            *self = before;
            return Err(Error::MerkleMismatch);
        }
        Ok(())
    }

    /// Wire form: block height, tree height, then per level a leaf count
    /// and (offset, flags, hash unless duplicate) entries ordered by
    /// offset.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_var_int(&mut out, self.block_height);
        out.push(self.levels.len() as u8);
        for level in &self.levels {
            put_var_int(&mut out, level.len() as u64);
            for leaf in level {
                put_var_int(&mut out, leaf.offset);
                match leaf.hash {
                    None => out.push(FLAG_DUPLICATE),
                    Some(hash) => {
                        out.push(if leaf.is_txid { FLAG_TXID } else { FLAG_DATA });
                        out.extend_from_slice(hash.as_byte_array());
                    }
                }
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Bump> {
        let mut cursor = Cursor::new(data);
        let bump = Bump::read(&mut cursor)?;
        if !cursor.done() {
            return Err(Error::InvalidSyntax("trailing bytes after proof".into()));
        }
        Ok(bump)
    }

    pub(crate) fn read(cursor: &mut Cursor<'_>) -> Result<Bump> {
        let block_height = cursor.var_int()?;
        let tree_height = cursor.u8()? as usize;
        let mut levels = Vec::with_capacity(tree_height);
        for _ in 0..tree_height {
            let count = cursor.var_int()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = cursor.var_int()?;
                let flags = cursor.u8()?;
                let leaf = match flags {
                    FLAG_DUPLICATE => BumpLeaf::duplicate(offset),
                    FLAG_DATA | FLAG_TXID => {
                        let mut raw = [0u8; 32];
                        raw.copy_from_slice(cursor.bytes(32)?);
                        BumpLeaf {
                            offset,
                            hash: Some(TxMerkleNode::from_byte_array(raw)),
                            is_txid: flags == FLAG_TXID,
                        }
                    }
                    other => {
                        return Err(Error::InvalidSyntax(format!(
                            "unknown proof leaf flags {other}"
                        )))
                    }
                };
                entries.push(leaf);
            }
            entries.sort_by_key(|l| l.offset);
            levels.push(entries);
        }
        Ok(Bump {
            block_height,
            levels,
        })
    }
}

/// Compute the Merkle root of a whole block's txids. Test support for
/// building consistent fixtures; the wallet itself only ever sees
/// branches.
pub fn merkle_root(txids: &[Txid]) -> Option<TxMerkleNode> {
    if txids.is_empty() {
        return None;
    }
    let mut level: Vec<TxMerkleNode> = txids.iter().map(node_of).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(combine(left, right));
        }
        level = next;
    }
    Some(level[0])
}

/// The classic Merkle branch for one transaction of a block.
pub fn merkle_branch(txids: &[Txid], tx_index: usize) -> Vec<TxMerkleNode> {
    let mut level: Vec<TxMerkleNode> = txids.iter().map(node_of).collect();
    let mut index = tx_index;
    let mut branch = Vec::new();
    while level.len() > 1 {
        let sibling = index ^ 1;
        branch.push(*level.get(sibling).unwrap_or(&level[index]));
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(combine(left, right));
        }
        level = next;
        index >>= 1;
    }
    branch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u8) -> Txid {
        Txid::from_raw_hash(sha256d::Hash::hash(&[n]))
    }

    fn block(n: u8) -> Vec<Txid> {
        (0..n).map(txid).collect()
    }

    #[test]
    fn single_branch_rehashes_to_the_block_root() {
        let txids = block(7);
        let root = merkle_root(&txids).unwrap();
        for (i, id) in txids.iter().enumerate() {
            let bump = Bump::from_branch(100, i as u64, id, &merkle_branch(&txids, i));
            assert_eq!(bump.root_for(id).unwrap(), root, "tx {i}");
            assert_eq!(bump.tx_index(id), Some(i as u64));
        }
    }

    #[test]
    fn merge_is_commutative() {
        let txids = block(5);
        let a = Bump::from_branch(1, 0, &txids[0], &merkle_branch(&txids, 0));
        let b = Bump::from_branch(1, 3, &txids[3], &merkle_branch(&txids, 3));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab.root().unwrap(), ba.root().unwrap());
        assert_eq!(ab.txids().len(), 2);
        assert_eq!(ab.levels, ba.levels);
    }

    #[test]
    fn merge_rejects_a_branch_from_another_block() {
        let ours = block(4);
        let theirs: Vec<Txid> = (10..14).map(txid).collect();
        let mut bump = Bump::from_branch(1, 0, &ours[0], &merkle_branch(&ours, 0));
        let foreign = Bump::from_branch(1, 1, &theirs[1], &merkle_branch(&theirs, 1));
        let before = bump.clone();
        assert!(matches!(bump.merge(&foreign), Err(Error::MerkleMismatch)));
        // A failed merge leaves the proof untouched.
        assert_eq!(bump, before);
    }

    #[test]
    fn wire_round_trip() {
        let txids = block(6);
        let mut bump = Bump::from_branch(815, 2, &txids[2], &merkle_branch(&txids, 2));
        bump.merge(&Bump::from_branch(815, 5, &txids[5], &merkle_branch(&txids, 5)))
            .unwrap();
        let decoded = Bump::from_bytes(&bump.to_bytes()).unwrap();
        assert_eq!(decoded, bump);
        assert_eq!(decoded.root().unwrap(), bump.root().unwrap());
    }

    #[test]
    fn expanded_branch_matches_the_classic_path() {
        let txids = block(9);
        let bump = Bump::from_branch(10, 8, &txids[8], &merkle_branch(&txids, 8));
        let (index, branch) = bump.branch(&txids[8]).unwrap();
        assert_eq!(index, 8);
        assert_eq!(branch, merkle_branch(&txids, 8));
    }

    #[test]
    fn single_transaction_block() {
        let txids = block(1);
        let bump = Bump::from_branch(5, 0, &txids[0], &[]);
        assert_eq!(bump.tree_height(), 0);
        assert_eq!(bump.root_for(&txids[0]).unwrap(), merkle_root(&txids).unwrap());
    }
}
