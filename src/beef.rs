//! BEEF: transactions bundled with the BUMPs that prove them, in
//! dependency order, so a receiver can verify SPV independently.

use bitcoin::consensus;
use bitcoin::Transaction;

use crate::error::{Error, Result};
use crate::merkle::Bump;
use crate::wire::{put_var_int, Cursor};

/// The leading version word; reads as `0100BEEF` in the raw bytes.
pub const BEEF_VERSION: u32 = 4022206465;

/// One transaction of a bundle, optionally pointing at the BUMP that
/// proves it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeefTx {
    pub tx: Transaction,
    pub bump: Option<usize>,
}

/// A bundle of dependent transactions plus their proofs.
///
/// Transactions appear parents-first; every transaction is either proven
/// by a BUMP or has all of its ancestors in the bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Beef {
    pub bumps: Vec<Bump>,
    pub txs: Vec<BeefTx>,
}

impl Beef {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BEEF_VERSION.to_le_bytes());
        put_var_int(&mut out, self.bumps.len() as u64);
        for bump in &self.bumps {
            out.extend_from_slice(&bump.to_bytes());
        }
        put_var_int(&mut out, self.txs.len() as u64);
        for entry in &self.txs {
            out.extend_from_slice(&consensus::serialize(&entry.tx));
            match entry.bump {
                Some(index) => {
                    out.push(0x01);
                    put_var_int(&mut out, index as u64);
                }
                None => out.push(0x00),
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Beef> {
        let mut cursor = Cursor::new(data);
        let version = u32::from_le_bytes(
            cursor
                .bytes(4)?
                .try_into()
                .expect("4 bytes"),
        );
        if version != BEEF_VERSION {
            return Err(Error::InvalidSyntax(format!(
                "unknown BEEF version {version:#010x}"
            )));
        }
        let bump_count = cursor.var_int()? as usize;
        let mut bumps = Vec::with_capacity(bump_count);
        for _ in 0..bump_count {
            bumps.push(Bump::read(&mut cursor)?);
        }
        let tx_count = cursor.var_int()? as usize;
        let mut txs = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let tx: Transaction = cursor.take()?;
            let bump = match cursor.u8()? {
                0x00 => None,
                0x01 => {
                    let index = cursor.var_int()? as usize;
                    if index >= bumps.len() {
                        return Err(Error::InvalidSyntax(format!(
                            "BEEF bump index {index} out of range"
                        )));
                    }
                    Some(index)
                }
                other => {
                    return Err(Error::InvalidSyntax(format!(
                        "bad has-BUMP byte {other:#04x}"
                    )))
                }
            };
            txs.push(BeefTx { tx, bump });
        }
        if !cursor.done() {
            return Err(Error::InvalidSyntax("trailing bytes after BEEF".into()));
        }
        Ok(Beef { bumps, txs })
    }

    /// Check the structural rules: proven transactions are covered by the
    /// BUMP they reference, and unproven ones only spend transactions that
    /// appear earlier in the bundle.
    pub fn check_structure(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.txs {
            let txid = entry.tx.compute_txid();
            match entry.bump {
                Some(index) => {
                    let bump = &self.bumps[index];
                    if bump.tx_index(&txid).is_none() {
                        return Err(Error::MerkleMismatch);
                    }
                }
                None => {
                    for input in &entry.tx.input {
                        if !seen.contains(&input.previous_output.txid) {
                            return Err(Error::InvalidSyntax(format!(
                                "BEEF transaction {txid} spends unknown parent {}",
                                input.previous_output.txid
                            )));
                        }
                    }
                }
            }
            seen.insert(txid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    use super::*;
    use crate::merkle::{merkle_branch, merkle_root};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![tag]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn child_of(parent: &Transaction) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(parent.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(4000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn sample() -> Beef {
        let parent = coinbase(1);
        let filler: Vec<Txid> = (2..4)
            .map(|n| Txid::from_raw_hash(sha256d::Hash::hash(&[n])))
            .collect();
        let mut txids = vec![parent.compute_txid()];
        txids.extend(filler);
        let child = child_of(&parent);
        let bump = Bump::from_branch(500, 0, &txids[0], &merkle_branch(&txids, 0));
        assert_eq!(bump.root().unwrap(), merkle_root(&txids).unwrap());
        Beef {
            bumps: vec![bump],
            txs: vec![
                BeefTx {
                    tx: parent,
                    bump: Some(0),
                },
                BeefTx {
                    tx: child,
                    bump: None,
                },
            ],
        }
    }

    #[test]
    fn wire_round_trip() {
        let beef = sample();
        let decoded = Beef::from_bytes(&beef.to_bytes()).unwrap();
        assert_eq!(decoded, beef);
    }

    #[test]
    fn structure_check_passes_for_a_valid_bundle() {
        sample().check_structure().unwrap();
    }

    #[test]
    fn structure_check_rejects_orphans() {
        let mut beef = sample();
        beef.txs.remove(0);
        assert!(beef.check_structure().is_err());
    }

    #[test]
    fn version_is_checked() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(Beef::from_bytes(&bytes).is_err());
    }
}
