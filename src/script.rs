//! The pay-to-address template: the one output script this wallet creates
//! and recognizes, plus size expectations for the input script that
//! redeems it.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{PubkeyHash, PublicKey, Script, ScriptBuf};

use crate::error::{Error, Result};

/// Largest DER-encoded ECDSA signature plus the sighash byte.
pub const MAX_SIGNATURE_SIZE: u64 = 72;

/// Hash of an output script, the key of the script index.
pub type ScriptHash = sha256::Hash;

/// The index key for an output script.
pub fn script_hash(script: &Script) -> ScriptHash {
    sha256::Hash::hash(script.as_bytes())
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn pay_to_address(hash: &PubkeyHash) -> ScriptBuf {
    ScriptBuf::new_p2pkh(hash)
}

/// The address hash a pay-to-address output pays, if the script matches
/// the template.
pub fn pay_to_address_hash(script: &Script) -> Option<PubkeyHash> {
    if !script.is_p2pkh() {
        return None;
    }
    // OP_DUP OP_HASH160 PUSH20 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
    PubkeyHash::from_slice(&script.as_bytes()[3..23]).ok()
}

/// Expected size of the input script redeeming a pay-to-address output.
pub fn redeem_expected_size(compressed: bool) -> u64 {
    let key_size = if compressed { 33 } else { 65 };
    MAX_SIGNATURE_SIZE + key_size + 2
}

/// `<sig> <pubkey>`, the input script for a pay-to-address output.
pub fn pay_to_address_unlock(signature: &[u8], pubkey: &PublicKey) -> Result<ScriptBuf> {
    let sig = PushBytesBuf::try_from(signature.to_vec())
        .map_err(|_| Error::InvalidSyntax("signature too long to push".into()))?;
    Ok(Builder::new().push_slice(sig).push_key(pubkey).into_script())
}
