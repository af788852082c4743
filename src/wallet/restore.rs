//! Wallet restoration: rebuild the account and sequence indices by
//! scanning each sequence against the transaction store with a
//! look-ahead window.

use bitcoin::bip32::Xpriv;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::keys::expression::encode_address;
use crate::keys::{KeySequence, Signing};
use crate::script;
use crate::txdb::Direction;
use crate::wallet::account::Redeemable;
use crate::wallet::generate::install_master;
use crate::wallet::Wallets;

/// What a restore found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Unspent outputs recovered into the account.
    pub outputs_found: usize,
    /// Their total value in satoshis.
    pub value: u64,
}

/// Restore a wallet from its master key: install the account layout,
/// then scan.
pub fn restore_wallet<D: Database>(
    wallets: &mut Wallets<D>,
    name: &str,
    master: Xpriv,
    coin_type: u32,
    max_look_ahead: u32,
) -> Result<RestoreReport> {
    install_master(wallets, name, master, coin_type)?;
    scan_wallet(wallets, name, max_look_ahead)
}

/// Walk every sequence of an existing wallet, recovering unspent outputs
/// and advancing each sequence past its last observed use.
///
/// Scanning stops after `max_look_ahead` consecutive indices with no
/// activity.
pub fn scan_wallet<D: Database>(
    wallets: &mut Wallets<D>,
    name: &str,
    max_look_ahead: u32,
) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();

    let sequence_names: Vec<String> = wallets
        .txdb()
        .db()
        .sequences(name)?
        .into_iter()
        .map(|(sequence_name, _)| sequence_name)
        .collect();

    for sequence_name in sequence_names {
        let sequence = wallets.sequence(name, &sequence_name)?;
        let last_used = scan_sequence(wallets, name, &sequence, max_look_ahead, &mut report)?;

        if let Some(last) = last_used {
            if last + 1 > sequence.next {
                let mut updated = sequence.clone();
                updated.next = last + 1;
                wallets.set_sequence(name, &sequence_name, &updated)?;
            }
        }
        debug!(
            wallet = name,
            sequence = %sequence_name,
            last_used = ?last_used,
            "scanned sequence"
        );
    }

    info!(
        wallet = name,
        outputs = report.outputs_found,
        value = report.value,
        "restore scan complete"
    );
    Ok(report)
}

pub(crate) fn scan_sequence<D: Database>(
    wallets: &mut Wallets<D>,
    name: &str,
    sequence: &KeySequence,
    window: u32,
    report: &mut RestoreReport,
) -> Result<Option<u32>> {
    let mut last_used: Option<u32> = None;
    let mut misses = 0u32;
    let mut index = 0u32;

    while misses < window {
        let derivation = sequence.derivation_at(index)?;
        let key = derivation.derive()?;
        let (net, hash) = key.as_address()?;
        let address = encode_address(net, &hash);

        let events = wallets.txdb().by_address(&address)?;
        if events.is_empty() {
            misses += 1;
            index += 1;
            continue;
        }

        misses = 0;
        last_used = Some(index);
        for event in &events {
            if event.direction != Direction::Out {
                continue;
            }
            // Only unspent outputs come back into the account.
            if wallets.txdb().redeeming(&event.point())?.is_some() {
                continue;
            }
            let output = match wallets.txdb().output(&event.point())? {
                Some(output) => output,
                None => continue,
            };
            wallets.txdb_mut().db_mut().set_account_entry(
                name,
                &event.point(),
                &Redeemable::new(
                    output.clone(),
                    Signing::new(
                        vec![derivation.clone()],
                        script::redeem_expected_size(true),
                    ),
                ),
            )?;
            wallets.txdb_mut().db_mut().remove_unused(name, &address)?;
            report.outputs_found += 1;
            report.value += output.value.to_sat();
        }
        index += 1;
    }

    Ok(last_used)
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    use super::*;
    use crate::db::MemoryDatabase;
    use crate::keys::{parse_path, KeyExpr};
    use crate::random::{Random, SharedRandom};
    use crate::wallet::{CHANGE_SEQUENCE, RECEIVE_SEQUENCE};

    const XPRV: &str = "xprv9s21ZrQH143K3yzPZD4Qe6M6hbPVZPrsARe7T1Ly9tJHj7jKFmVreHERV7A9eBZZsB5fzefvChhro43yQgXwAzPpJ9nC9SUWwXnFEa8m4km";

    fn wallets() -> Wallets<MemoryDatabase> {
        Wallets::new(
            MemoryDatabase::new(),
            SharedRandom::new(Random::deterministic(b"restore", b"nonce")),
        )
    }

    fn master() -> KeyExpr {
        KeyExpr::parse(&format!("HD.secret \"{XPRV}\"")).unwrap()
    }

    /// The receive key at a BIP-44 index, derived straight from the
    /// master.
    fn receive_script(index: u32) -> ScriptBuf {
        let key = master()
            .derive(&parse_path(&format!("44'/0'/0'/0/{index}")).unwrap())
            .unwrap();
        script::pay_to_address(&key.as_pubkey().unwrap().pubkey_hash())
    }

    fn funding_tx(script: ScriptBuf, value: u64, tag: u8) -> Transaction {
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
                value: Amount::from_sat(value),
                script_pubkey: script,
            }],
        }
    }

    fn spending_tx(parent: &Transaction) -> Transaction {
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
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn scan_recovers_used_indices_and_advances_the_sequence() {
        let mut w = wallets();
        // Payments landed at receive indices 0 and 2 before this wallet
        // existed locally.
        w.txdb_mut()
            .insert_tx(&funding_tx(receive_script(0), 10_000, 1))
            .unwrap();
        w.txdb_mut()
            .insert_tx(&funding_tx(receive_script(2), 25_000, 2))
            .unwrap();

        let master = master().as_hd_secret().unwrap();
        let report = restore_wallet(&mut w, "alpha", master, 0, 20).unwrap();

        assert_eq!(report.outputs_found, 2);
        assert_eq!(report.value, 35_000);
        assert_eq!(w.value("alpha").unwrap(), 35_000);
        // The scan advanced past the last used index; change was never
        // used.
        assert_eq!(w.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 3);
        assert_eq!(w.sequence("alpha", CHANGE_SEQUENCE).unwrap().next, 0);
    }

    #[test]
    fn look_ahead_window_bounds_the_scan() {
        let mut w = wallets();
        // Index 0 is used; index 5 is beyond a window of 3 consecutive
        // misses and must not be found.
        w.txdb_mut()
            .insert_tx(&funding_tx(receive_script(0), 10_000, 1))
            .unwrap();
        w.txdb_mut()
            .insert_tx(&funding_tx(receive_script(5), 99_000, 2))
            .unwrap();

        let master = master().as_hd_secret().unwrap();
        let report = restore_wallet(&mut w, "alpha", master, 0, 3).unwrap();

        assert_eq!(report.outputs_found, 1);
        assert_eq!(report.value, 10_000);
        assert_eq!(w.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 1);
    }

    #[test]
    fn a_hit_resets_the_miss_counter() {
        let mut w = wallets();
        // Gaps of two misses each stay under a window of 3, so the scan
        // reaches index 4.
        for index in [0u32, 2, 4] {
            w.txdb_mut()
                .insert_tx(&funding_tx(receive_script(index), 1_000, index as u8))
                .unwrap();
        }

        let master = master().as_hd_secret().unwrap();
        let report = restore_wallet(&mut w, "alpha", master, 0, 3).unwrap();

        assert_eq!(report.outputs_found, 3);
        assert_eq!(w.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 5);
    }

    #[test]
    fn spent_outputs_are_seen_but_not_recovered() {
        let mut w = wallets();
        let funding = funding_tx(receive_script(0), 10_000, 1);
        let spend = spending_tx(&funding);
        w.txdb_mut().insert_tx(&funding).unwrap();
        w.txdb_mut().insert_tx(&spend).unwrap();

        let master = master().as_hd_secret().unwrap();
        let report = restore_wallet(&mut w, "alpha", master, 0, 20).unwrap();

        // The index counts as used, but the redeemed output stays out of
        // the account.
        assert_eq!(report.outputs_found, 0);
        assert_eq!(report.value, 0);
        assert_eq!(w.value("alpha").unwrap(), 0);
        assert_eq!(w.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 1);
    }

    #[test]
    fn scan_sequence_reports_the_last_used_index() {
        let mut w = wallets();
        w.txdb_mut()
            .insert_tx(&funding_tx(receive_script(1), 5_000, 1))
            .unwrap();

        let master = master().as_hd_secret().unwrap();
        crate::wallet::generate::install_master(&mut w, "alpha", master, 0).unwrap();
        let sequence = w.sequence("alpha", RECEIVE_SEQUENCE).unwrap();

        let mut report = RestoreReport::default();
        let last = scan_sequence(&mut w, "alpha", &sequence, 5, &mut report).unwrap();
        assert_eq!(last, Some(1));
        assert_eq!(report.outputs_found, 1);
        assert_eq!(report.value, 5_000);
    }
}
