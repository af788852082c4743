//! The extended transaction format: a canonical transaction with every
//! input's prevout value and script inlined, so a receiver can check fees
//! and a signer can compute digests without any database lookups.

use std::cmp::Ordering;
use std::fmt;

use bitcoin::consensus;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};

use crate::error::{Error, Result};
use crate::wire::{put, put_var_int, Cursor};

/// Marker bytes standing where the input count of a canonical transaction
/// would otherwise begin.
const EXTENDED_MARKER: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0xEF];

/// A fee rate as a ratio, compared by cross-multiplication so fee checks
/// are exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SatsPerByte {
    pub satoshis: u64,
    pub bytes: u64,
}

impl SatsPerByte {
    pub fn new(satoshis: u64, bytes: u64) -> Self {
        SatsPerByte { satoshis, bytes }
    }

    /// The fee needed to cover `size` bytes at this rate, rounded up.
    pub fn fee_for(&self, size: u64) -> u64 {
        if self.bytes == 0 {
            return 0;
        }
        let product = self.satoshis as u128 * size as u128;
        (product.div_ceil(self.bytes as u128)) as u64
    }

    pub fn as_f64(&self) -> f64 {
        if self.bytes == 0 {
            0.0
        } else {
            self.satoshis as f64 / self.bytes as f64
        }
    }
}

impl PartialOrd for SatsPerByte {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SatsPerByte {
    fn cmp(&self, other: &Self) -> Ordering {
        let left = self.satoshis as u128 * other.bytes as u128;
        let right = other.satoshis as u128 * self.bytes as u128;
        left.cmp(&right)
    }
}

impl fmt::Display for SatsPerByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} sat/B", self.satoshis, self.bytes)
    }
}

/// A transaction carrying its prevouts, one per input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedTransaction {
    pub tx: Transaction,
    pub prevouts: Vec<TxOut>,
}

impl ExtendedTransaction {
    pub fn new(tx: Transaction, prevouts: Vec<TxOut>) -> Result<Self> {
        if tx.input.len() != prevouts.len() {
            return Err(Error::InvalidSyntax(format!(
                "{} inputs but {} prevouts",
                tx.input.len(),
                prevouts.len()
            )));
        }
        Ok(ExtendedTransaction { tx, prevouts })
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Total value of the inputs.
    pub fn spent(&self) -> u64 {
        self.prevouts.iter().map(|p| p.value.to_sat()).sum()
    }

    /// Total value of the outputs.
    pub fn sent(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Fee paid; zero if the outputs somehow exceed the inputs.
    pub fn fee(&self) -> u64 {
        self.spent().saturating_sub(self.sent())
    }

    /// Canonical serialized size.
    pub fn size(&self) -> u64 {
        consensus::serialize(&self.tx).len() as u64
    }

    pub fn fee_rate(&self) -> SatsPerByte {
        SatsPerByte::new(self.fee(), self.size())
    }

    /// Canonical serialization, without prevouts.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        consensus::serialize(&self.tx)
    }

    /// The extended wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tx.version.0.to_le_bytes());
        out.extend_from_slice(&EXTENDED_MARKER);
        put_var_int(&mut out, self.tx.input.len() as u64);
        for (input, prevout) in self.tx.input.iter().zip(&self.prevouts) {
            put(&mut out, &input.previous_output);
            put(&mut out, &input.script_sig);
            put(&mut out, &input.sequence);
            out.extend_from_slice(&prevout.value.to_sat().to_le_bytes());
            put(&mut out, &prevout.script_pubkey);
        }
        put_var_int(&mut out, self.tx.output.len() as u64);
        for output in &self.tx.output {
            put(&mut out, output);
        }
        out.extend_from_slice(&self.tx.lock_time.to_consensus_u32().to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 10 || data[4..10] != EXTENDED_MARKER {
            return Err(Error::InvalidSyntax(
                "missing extended transaction marker".into(),
            ));
        }
        let mut cursor = Cursor::new(&data[10..]);
        let version = i32::from_le_bytes(data[..4].try_into().expect("4 bytes"));

        let input_count = cursor.var_int()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        let mut prevouts = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let previous_output = cursor.take()?;
            let script_sig: ScriptBuf = cursor.take()?;
            let sequence = cursor.take()?;
            let value = u64::from_le_bytes(cursor.bytes(8)?.try_into().expect("8 bytes"));
            let script_pubkey: ScriptBuf = cursor.take()?;
            inputs.push(bitcoin::TxIn {
                previous_output,
                script_sig,
                sequence,
                witness: bitcoin::Witness::default(),
            });
            prevouts.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            });
        }
        let output_count = cursor.var_int()? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(cursor.take::<TxOut>()?);
        }
        let lock_time = u32::from_le_bytes(cursor.bytes(4)?.try_into().expect("4 bytes"));
        if !cursor.done() {
            return Err(Error::InvalidSyntax(
                "trailing bytes after extended transaction".into(),
            ));
        }
        Ok(ExtendedTransaction {
            tx: Transaction {
                version: bitcoin::transaction::Version(version),
                lock_time: bitcoin::absolute::LockTime::from_consensus(lock_time),
                input: inputs,
                output: outputs,
            },
            prevouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, TxIn, Witness};

    use super::*;
    use crate::keys::KeyExpr;
    use crate::script;

    fn sample() -> ExtendedTransaction {
        let hash = KeyExpr::parse("secret 123")
            .unwrap()
            .as_pubkey()
            .unwrap()
            .pubkey_hash();
        let script = script::pay_to_address(&hash);
        ExtendedTransaction::new(
            Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: ScriptBuf::from_bytes(vec![0x00; 107]),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(900),
                    script_pubkey: script.clone(),
                }],
            },
            vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: script,
            }],
        )
        .unwrap()
    }

    #[test]
    fn wire_round_trip() {
        let tx = sample();
        let decoded = ExtendedTransaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn fee_arithmetic() {
        let tx = sample();
        assert_eq!(tx.spent(), 1000);
        assert_eq!(tx.sent(), 900);
        assert_eq!(tx.fee(), 100);
    }

    #[test]
    fn canonical_bytes_are_not_extended() {
        let tx = sample();
        assert!(ExtendedTransaction::from_bytes(&tx.to_canonical_bytes()).is_err());
    }

    #[test]
    fn fee_rate_comparison_is_exact() {
        // 1/3 sat/B is below 0.34 sat/B but above 0.33.
        let third = SatsPerByte::new(1, 3);
        assert!(third < SatsPerByte::new(34, 100));
        assert!(third > SatsPerByte::new(33, 100));
        assert_eq!(third.fee_for(100), 34);
    }

    #[test]
    fn prevout_count_must_match() {
        let mut tx = sample();
        tx.prevouts.clear();
        assert!(ExtendedTransaction::new(tx.tx, tx.prevouts).is_err());
    }
}
