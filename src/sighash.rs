//! The signature hash for extended inputs.
//!
//! Bitcoin SV commits to the prevout value and script of every input using
//! the replay-protected digest: the BIP143 preimage layout with the fork
//! id bit set in the hash type. This is why signing consumes the extended
//! transaction form rather than the canonical one.

use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Amount, Script, Transaction};

use crate::error::{Error, Result};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// The hash type every output this wallet signs uses.
pub fn all_forkid() -> u32 {
    SIGHASH_ALL | SIGHASH_FORKID
}

fn sha256d_of(parts: &[Vec<u8>]) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    use bitcoin::hashes::HashEngine;
    for part in parts {
        engine.input(part);
    }
    sha256d::Hash::from_engine(engine)
}

fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value
        .consensus_encode(&mut out)
        .expect("writing to a Vec cannot fail");
    out
}

/// Compute the digest signed for one input of `tx`.
///
/// `script_code` and `value` come from the prevout being spent; for the
/// pay-to-address template the script code is the prevout script itself.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    sighash_type: u32,
) -> Result<sha256d::Hash> {
    let input = tx
        .input
        .get(input_index)
        .ok_or_else(|| Error::InvalidSyntax(format!("no input {input_index}")))?;

    let anyone_can_pay = sighash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = sighash_type & 0x1f;

    let hash_prevouts = if anyone_can_pay {
        sha256d::Hash::all_zeros()
    } else {
        sha256d_of(&tx.input.iter().map(|i| encode(&i.previous_output)).collect::<Vec<_>>())
    };

    let hash_sequence = if anyone_can_pay || base_type == SIGHASH_SINGLE || base_type == SIGHASH_NONE
    {
        sha256d::Hash::all_zeros()
    } else {
        sha256d_of(&tx.input.iter().map(|i| encode(&i.sequence)).collect::<Vec<_>>())
    };

    let hash_outputs = if base_type == SIGHASH_SINGLE {
        match tx.output.get(input_index) {
            Some(output) => sha256d_of(&[encode(output)]),
            None => sha256d::Hash::all_zeros(),
        }
    } else if base_type == SIGHASH_NONE {
        sha256d::Hash::all_zeros()
    } else {
        sha256d_of(&tx.output.iter().map(encode).collect::<Vec<_>>())
    };

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(hash_prevouts.as_byte_array());
    preimage.extend_from_slice(hash_sequence.as_byte_array());
    preimage.extend_from_slice(&encode(&input.previous_output));
    preimage.extend_from_slice(&encode(&script_code.to_owned()));
    preimage.extend_from_slice(&value.to_sat().to_le_bytes());
    preimage.extend_from_slice(&encode(&input.sequence));
    preimage.extend_from_slice(hash_outputs.as_byte_array());
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&sighash_type.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage))
}
