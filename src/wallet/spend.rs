//! The spend pipeline: select inputs, design the transaction with
//! placeholder signatures, construct change, permute outputs, check the
//! fee rate, and sign through the `to_private` map.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extended::{ExtendedTransaction, SatsPerByte};
use crate::keys::{KeyExpr, KeySequence, Signing};
use crate::random::random_ordering;
use crate::script;
use crate::sighash::{all_forkid, signature_hash};
use crate::wallet::account::{Account, AccountDiff};
use crate::wallet::change::{make_change, Change, ChangeParams};
use crate::wallet::select::{select_down, SelectParams, Selected};

/// Resolves a public parent expression to the private expression that
/// evaluates to the same point.
pub trait PrivateKeyStore {
    fn to_private(&self, public: &KeyExpr) -> Result<Option<KeyExpr>>;
}

/// Everything a spend is parameterized by.
#[derive(Clone, Copy, Debug)]
pub struct SpendParams {
    pub select: SelectParams,
    pub change: ChangeParams,
    /// How much extra to redeem beyond the payment, as a proportion range
    /// drawn per spend. Both bounds are pulled toward 1 when the wallet
    /// is too small to support them.
    pub min_redeem_proportion: f64,
    pub max_redeem_proportion: f64,
    pub fee_rate: SatsPerByte,
}

impl Default for SpendParams {
    fn default() -> Self {
        SpendParams {
            select: SelectParams::default(),
            change: ChangeParams::default(),
            min_redeem_proportion: 1.0,
            max_redeem_proportion: 1.5,
            fee_rate: SatsPerByte::new(1, 20),
        }
    }
}

/// A finished spend: the signed transactions in dependency order, each
/// with the diff it applies to the account, and the change sequence index
/// after all of them.
#[derive(Clone, Debug)]
pub struct SpendResult {
    pub txs: Vec<(ExtendedTransaction, AccountDiff)>,
    pub next_change_index: u32,
}

fn placeholder_script(size: u64) -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0u8; size as usize])
}

fn assemble_unlock(
    signing: &Signing,
    parts: &[(Vec<u8>, bitcoin::PublicKey)],
) -> Result<ScriptBuf> {
    if signing.unlock_so_far.is_empty() {
        let mut script = Vec::new();
        for (sig, key) in parts {
            script.extend_from_slice(script::pay_to_address_unlock(sig, key)?.as_bytes());
        }
        return Ok(ScriptBuf::from_bytes(script));
    }
    // A partially completed script is finished by prefixing the new
    // signatures.
    let mut script = Vec::new();
    for (sig, _) in parts {
        let push = bitcoin::script::Builder::new()
            .push_slice(
                bitcoin::script::PushBytesBuf::try_from(sig.clone())
                    .map_err(|_| Error::InvalidSyntax("signature too long to push".into()))?,
            )
            .into_script();
        script.extend_from_slice(push.as_bytes());
    }
    script.extend_from_slice(signing.unlock_so_far.as_bytes());
    Ok(ScriptBuf::from_bytes(script))
}

fn sign_inputs<K: PrivateKeyStore>(
    keys: &K,
    tx: &mut Transaction,
    selected: &Selected,
) -> Result<()> {
    for (index, (_, redeemable)) in selected.outputs.iter().enumerate() {
        let sighash = signature_hash(
            tx,
            index,
            &redeemable.prevout.script_pubkey,
            redeemable.prevout.value,
            all_forkid(),
        )?;
        let message = secp256k1::Message::from_digest(sighash.to_byte_array());
        let mut parts = Vec::with_capacity(redeemable.signing.derivations.len());
        for derivation in &redeemable.signing.derivations {
            let private = keys
                .to_private(&derivation.parent)?
                .ok_or_else(|| Error::KeyMissing(derivation.parent.to_string()))?;
            let secret = private.derive(&derivation.path)?.as_secret()?;
            let pubkey = secret.public_key(secp256k1::SECP256K1);
            let signature = secp256k1::SECP256K1.sign_ecdsa(&message, &secret.inner);
            let mut bytes = signature.serialize_der().to_vec();
            bytes.push(all_forkid() as u8);
            parts.push((bytes, pubkey));
        }
        tx.input[index].script_sig = assemble_unlock(&redeemable.signing, &parts)?;
    }
    Ok(())
}

/// Construct, fund, and sign one spend.
///
/// The caller owns persistence: the returned diffs and change index are
/// applied to the wallet only after the transactions are accepted for
/// broadcast.
pub fn spend<K: PrivateKeyStore, R: Rng>(
    keys: &K,
    account: &Account,
    change_sequence: &KeySequence,
    to: &[TxOut],
    params: &SpendParams,
    rng: &mut R,
) -> Result<SpendResult> {
    let value_to_spend: u64 = to.iter().map(|o| o.value.to_sat()).sum();
    if to.is_empty() || value_to_spend == 0 {
        return Err(Error::InvalidSyntax(
            "a spend needs at least one funded target output".into(),
        ));
    }
    let available = account.value();
    if available < value_to_spend {
        return Err(Error::InsufficientFunds {
            available,
            required: value_to_spend,
        });
    }

    // Redeem somewhat more than the payment so the account consolidates
    // over time, scaling the proportion down when the wallet is small.
    let wallet_value_proportion = available as f64 / value_to_spend as f64;
    let max_redeem = if wallet_value_proportion > (params.max_redeem_proportion - 1.0) * 2.0 + 1.0 {
        params.max_redeem_proportion
    } else {
        (wallet_value_proportion - 1.0) / 2.0 + 1.0
    };
    let min_redeem = if max_redeem > (params.min_redeem_proportion - 1.0) * 2.0 + 1.0 {
        params.min_redeem_proportion
    } else {
        (max_redeem - 1.0) / 2.0 + 1.0
    };
    let proportion = if min_redeem >= max_redeem {
        min_redeem
    } else {
        Uniform::new(min_redeem, max_redeem).sample(rng)
    };
    let value_to_redeem = (value_to_spend as f64 * proportion).ceil() as u64;

    let selected = select_down(
        account,
        value_to_redeem.min(available.saturating_sub(1)),
        params.fee_rate,
        &params.select,
        rng,
    )?;

    let inputs: Vec<TxIn> = selected
        .outputs
        .iter()
        .map(|(outpoint, redeemable)| TxIn {
            previous_output: *outpoint,
            script_sig: placeholder_script(redeemable.signing.expected_script_size),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        })
        .collect();
    let prevouts: Vec<TxOut> = selected
        .outputs
        .iter()
        .map(|(_, redeemable)| redeemable.prevout.clone())
        .collect();

    let design_before_change = ExtendedTransaction::new(
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs.clone(),
            output: to.to_vec(),
        },
        prevouts.clone(),
    )?;

    let fee_surplus = design_before_change.fee();
    let required_before = params.fee_rate.fee_for(design_before_change.size());
    if fee_surplus < required_before {
        return Err(Error::InsufficientFunds {
            available,
            required: value_to_spend + required_before,
        });
    }
    let mut change_amount = fee_surplus - required_before;

    // One retry with a smaller change target covers the case where the
    // change construction undershot the fee.
    let mut retried = false;
    loop {
        let change: Change = make_change(
            change_sequence,
            change_amount,
            params.fee_rate,
            &params.change,
            rng,
        )?;

        let mut all_outputs = to.to_vec();
        all_outputs.extend(change.tx_outputs());
        let ordering = random_ordering(all_outputs.len(), rng);
        let permuted: Vec<TxOut> = ordering.iter().map(|&i| all_outputs[i].clone()).collect();

        let design = ExtendedTransaction::new(
            Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: inputs.clone(),
                output: permuted,
            },
            prevouts.clone(),
        )?;

        let required = params.fee_rate.fee_for(design.size());
        if design.fee() < required {
            let deficit = required - design.fee();
            if !retried && change_amount > deficit {
                retried = true;
                change_amount -= deficit;
                continue;
            }
            return Err(Error::FeeRateRegression);
        }

        debug!(
            inputs = design.tx.input.len(),
            outputs = design.tx.output.len(),
            spent = design.spent(),
            sent = design.sent(),
            fee = design.fee(),
            "transaction design complete"
        );

        let mut final_tx = design.tx.clone();
        sign_inputs(keys, &mut final_tx, &selected)?;
        let extended = ExtendedTransaction::new(final_tx, prevouts)?;

        let mut diff = AccountDiff::new(extended.txid());
        for (outpoint, _) in &selected.outputs {
            diff.remove.insert(*outpoint);
        }
        for (j, redeemable) in change.outputs.iter().enumerate() {
            let original = to.len() + j;
            let position = ordering
                .iter()
                .position(|&i| i == original)
                .expect("ordering is a permutation");
            diff.insert.insert(position as u32, redeemable.clone());
        }

        return Ok(SpendResult {
            txs: vec![(extended, diff)],
            next_change_index: change.next_index,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::{Amount, OutPoint, Txid};

    use super::*;
    use crate::keys::parse_path;
    use crate::random::Random;
    use crate::wallet::account::Redeemable;

    const XPRV: &str = "xprv9s21ZrQH143K3yzPZD4Qe6M6hbPVZPrsARe7T1Ly9tJHj7jKFmVreHERV7A9eBZZsB5fzefvChhro43yQgXwAzPpJ9nC9SUWwXnFEa8m4km";

    struct MapKeys(BTreeMap<String, KeyExpr>);

    impl PrivateKeyStore for MapKeys {
        fn to_private(&self, public: &KeyExpr) -> Result<Option<KeyExpr>> {
            Ok(self.0.get(&public.to_string()).cloned())
        }
    }

    fn master() -> KeyExpr {
        KeyExpr::parse(&format!("HD.secret \"{XPRV}\"")).unwrap()
    }

    fn keystore() -> MapKeys {
        let mut map = BTreeMap::new();
        map.insert(master().to_public().unwrap().to_string(), master());
        MapKeys(map)
    }

    fn receive_sequence() -> KeySequence {
        KeySequence::new(master().to_public().unwrap(), parse_path("0").unwrap()).unwrap()
    }

    fn change_sequence() -> KeySequence {
        KeySequence::new(master().to_public().unwrap(), parse_path("1").unwrap()).unwrap()
    }

    /// An account of wallet outputs derived from the receive sequence.
    fn account_of(values: &[u64]) -> Account {
        let sequence = receive_sequence();
        let mut account = Account::new();
        for (i, value) in values.iter().enumerate() {
            let derivation = sequence.derivation_at(i as u32).unwrap();
            let key = derivation.derive().unwrap();
            let hash = key.as_pubkey().unwrap().pubkey_hash();
            let txid = Txid::from_raw_hash(sha256d::Hash::hash(&[i as u8]));
            account.entries.insert(
                OutPoint::new(txid, 0),
                Redeemable::new(
                    TxOut {
                        value: Amount::from_sat(*value),
                        script_pubkey: script::pay_to_address(&hash),
                    },
                    Signing::new(vec![derivation], script::redeem_expected_size(true)),
                ),
            );
        }
        account
    }

    fn target(value: u64) -> Vec<TxOut> {
        let hash = KeyExpr::parse("secret 999")
            .unwrap()
            .as_pubkey()
            .unwrap()
            .pubkey_hash();
        vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script::pay_to_address(&hash),
        }]
    }

    fn params() -> SpendParams {
        SpendParams {
            change: ChangeParams {
                minimum_create_value: 546,
                min_sats_per_output: 1_000,
                max_sats_per_output: 100_000,
                mean_sats_per_output: 20_000,
            },
            fee_rate: SatsPerByte::new(1, 20),
            ..SpendParams::default()
        }
    }

    #[test]
    fn spend_below_fee_threshold_is_insufficient() {
        // One 10k output cannot pay 9999 and a fee at 1 sat/B.
        let account = account_of(&[10_000]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let result = spend(
            &keystore(),
            &account,
            &change_sequence(),
            &target(9_999),
            &SpendParams {
                fee_rate: SatsPerByte::new(1, 1),
                ..params()
            },
            random.casual(),
        );
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
    }

    #[test]
    fn spend_produces_a_consistent_design() {
        let account = account_of(&[50_000, 80_000, 120_000]);
        let initial_value = account.value();
        let mut random = Random::deterministic(b"seed", b"nonce");
        let result = spend(
            &keystore(),
            &account,
            &change_sequence(),
            &target(60_000),
            &params(),
            random.casual(),
        )
        .unwrap();

        let (extended, diff) = &result.txs[0];
        // The fee rate is satisfied.
        assert!(extended.fee() >= params().fee_rate.fee_for(extended.size()));

        // Every input is signed with a non-placeholder script.
        for input in &extended.tx.input {
            assert!(!input.script_sig.is_empty());
            assert_ne!(input.script_sig.as_bytes()[0], 0x00);
        }

        // Applying the diff conserves value minus target and fee.
        let mut after = account.clone();
        after.apply(diff).unwrap();
        assert_eq!(
            after.value(),
            initial_value - 60_000 - extended.fee()
        );

        // The change index advanced by the number of change outputs.
        assert_eq!(result.next_change_index as usize, diff.insert.len());

        // Inserted outpoints really are outputs of the new transaction
        // paying the recorded scripts.
        for (index, redeemable) in &diff.insert {
            let output = &extended.tx.output[*index as usize];
            assert_eq!(output, &redeemable.prevout);
        }
    }

    #[test]
    fn signatures_verify_against_the_prevout_keys() {
        let account = account_of(&[200_000]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let result = spend(
            &keystore(),
            &account,
            &change_sequence(),
            &target(50_000),
            &params(),
            random.casual(),
        )
        .unwrap();
        let (extended, _) = &result.txs[0];

        for (i, (_, redeemable)) in account.entries.iter().enumerate() {
            let sighash = signature_hash(
                &extended.tx,
                i,
                &redeemable.prevout.script_pubkey,
                redeemable.prevout.value,
                all_forkid(),
            )
            .unwrap();
            let message = secp256k1::Message::from_digest(sighash.to_byte_array());

            // The unlock script is <sig> <pubkey>; parse both pushes.
            let script = extended.tx.input[i].script_sig.as_bytes();
            let sig_len = script[0] as usize;
            let sig_der = &script[1..sig_len]; // strip the sighash byte
            let key_start = 1 + sig_len;
            let key_len = script[key_start] as usize;
            let key_bytes = &script[key_start + 1..key_start + 1 + key_len];

            let pubkey = secp256k1::PublicKey::from_slice(key_bytes).unwrap();
            let signature = secp256k1::ecdsa::Signature::from_der(sig_der).unwrap();
            secp256k1::SECP256K1
                .verify_ecdsa(&message, &signature, &pubkey)
                .unwrap();

            // And the key hashes to the prevout's address.
            let hash = bitcoin::PublicKey::new(pubkey).pubkey_hash();
            assert_eq!(
                script::pay_to_address_hash(&redeemable.prevout.script_pubkey),
                Some(hash)
            );
        }
    }

    #[test]
    fn missing_private_key_fails_cleanly() {
        let account = account_of(&[200_000]);
        let mut random = Random::deterministic(b"seed", b"nonce");
        let empty = MapKeys(BTreeMap::new());
        let result = spend(
            &empty,
            &account,
            &change_sequence(),
            &target(50_000),
            &params(),
            random.casual(),
        );
        assert!(matches!(result, Err(Error::KeyMissing(_))));
    }
}
