//! The wallet registry: per-wallet keys, sequences, unused recipients,
//! and the account, plus the operations the HTTP surface dispatches to.

pub mod account;
pub mod change;
pub mod generate;
pub mod history;
pub mod restore;
pub mod select;
pub mod spend;

use std::collections::BTreeSet;

use bitcoin::{NetworkKind, OutPoint, Script, Txid};
use tracing::{debug, info};

use crate::beef::Beef;
use crate::db::{valid_wallet_name, Database, SequenceRecord};
use crate::error::{Error, Result};
use crate::keys::expression::encode_address;
use crate::keys::{parse_path, render_path, Derivation, KeyExpr, KeySequence, Signing};
use crate::network::{MonetaryUnit, PriceSource};
use crate::pay::{PaymentRequest, Payments};
use crate::random::SharedRandom;
use crate::script;
use crate::spv::When;
use crate::txdb::{Direction, Event, TxDb};

use self::account::{Account, AccountDiff, Redeemable};
use self::history::History;
use self::spend::{PrivateKeyStore, SpendParams, SpendResult};

/// The receive sequence every generated wallet carries.
pub const RECEIVE_SEQUENCE: &str = "receive";
/// The change sequence the spend pipeline draws from.
pub const CHANGE_SEQUENCE: &str = "change";

/// How far past a sequence's next index imports and restores look for
/// payments to addresses we have not handed out yet.
const SEQUENCE_LOOK_AHEAD: u32 = 20;

/// Hash functions the pre-image store distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashFunction {
    Sha256,
    Hash160,
}

impl HashFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashFunction::Sha256 => "SHA256",
            HashFunction::Hash160 => "Hash160",
        }
    }
}

/// What a freshly advanced sequence key looks like to a caller.
#[derive(Clone, Debug)]
pub struct NextKey {
    pub key: KeyExpr,
    pub derivation: Derivation,
    /// The sequence index the key was derived at.
    pub index: u32,
}

/// The wallet registry over a [`Database`], owning the transaction store
/// and the shared random source.
///
/// Mutations within a wallet must be serialized by the owning server (one
/// lock per wallet); no method here suspends, so nothing holds such a
/// lock across I/O. Network fetches are staged first and committed
/// through these synchronous calls.
pub struct Wallets<D: Database> {
    txdb: TxDb<D>,
    random: SharedRandom,
}

impl<D: Database> Wallets<D> {
    pub fn new(db: D, random: SharedRandom) -> Self {
        Wallets {
            txdb: TxDb::new(db),
            random,
        }
    }

    pub fn txdb(&self) -> &TxDb<D> {
        &self.txdb
    }

    pub fn txdb_mut(&mut self) -> &mut TxDb<D> {
        &mut self.txdb
    }

    pub fn random(&self) -> &SharedRandom {
        &self.random
    }

    fn db(&self) -> &D {
        self.txdb.db()
    }

    fn db_mut(&mut self) -> &mut D {
        self.txdb.db_mut()
    }

    // ----- registry -----

    pub fn make_wallet(&mut self, name: &str) -> Result<()> {
        if !valid_wallet_name(name) {
            return Err(Error::InvalidSyntax(format!("bad wallet name {name:?}")));
        }
        self.db_mut().create_wallet(name)?;
        info!(wallet = name, "created wallet");
        Ok(())
    }

    pub fn list_wallets(&self) -> Result<Vec<String>> {
        self.db().list_wallets()
    }

    /// Idempotent upsert of a named key.
    pub fn set_key(&mut self, wallet: &str, name: &str, key: &KeyExpr) -> Result<()> {
        self.db_mut().set_key(wallet, name, &key.to_string())
    }

    pub fn get_key(&self, wallet: &str, name: &str) -> Result<KeyExpr> {
        match self.db().key(wallet, name)? {
            Some(text) => KeyExpr::parse(&text),
            None => Err(Error::KeyMissing(format!("{wallet}/{name}"))),
        }
    }

    /// Generate a random key of the requested kind and store it under the
    /// given name.
    pub fn generate_key(
        &mut self,
        wallet: &str,
        name: &str,
        kind: GeneratedKeyKind,
        net: NetworkKind,
        compressed: bool,
    ) -> Result<KeyExpr> {
        let key = {
            let random = self.random.clone();
            let mut guard = random.lock();
            generate::random_key(&mut guard.secure, kind, net, compressed)?
        };
        self.set_key(wallet, name, &key)?;
        Ok(key)
    }

    /// Associate a public expression with the private expression that
    /// evaluates to the same point. Global, not per-wallet.
    pub fn set_to_private(&mut self, public: &KeyExpr, private: &KeyExpr) -> Result<()> {
        if public.as_point()? != private.as_point()? {
            return Err(Error::InvalidSyntax(
                "public and private expressions evaluate to different points".into(),
            ));
        }
        if !private.is_private() {
            return Err(Error::IncompatibleKind("a private expression"));
        }
        self.db_mut()
            .set_to_private(&public.to_string(), &private.to_string())
    }

    pub fn to_private_expr(&self, public: &KeyExpr) -> Result<Option<KeyExpr>> {
        match self.db().to_private(&public.to_string())? {
            Some(text) => Ok(Some(KeyExpr::parse(&text)?)),
            None => Ok(None),
        }
    }

    // ----- sequences -----

    pub fn set_sequence(&mut self, wallet: &str, name: &str, sequence: &KeySequence) -> Result<()> {
        let record = SequenceRecord {
            key: sequence.key.to_string(),
            path: render_path(&sequence.path),
            next: sequence.next,
        };
        self.db_mut().set_sequence(wallet, name, &record)
    }

    pub fn sequence(&self, wallet: &str, name: &str) -> Result<KeySequence> {
        let record = self
            .db()
            .sequence(wallet, name)?
            .ok_or_else(|| Error::SequenceMissing(format!("{wallet}/{name}")))?;
        KeySequence::with_next(
            KeyExpr::parse(&record.key)?,
            parse_path(&record.path)?,
            record.next,
        )
    }

    /// Compute the current key, advance the index, persist. Atomic under
    /// the per-wallet lock the caller holds.
    pub fn advance_sequence(&mut self, wallet: &str, name: &str) -> Result<NextKey> {
        let mut sequence = self.sequence(wallet, name)?;
        let index = sequence.next;
        let (key, derivation) = sequence.advance()?;
        self.set_sequence(wallet, name, &sequence)?;
        Ok(NextKey {
            key,
            derivation,
            index,
        })
    }

    /// Advance a sequence and hand out the result as an address,
    /// recording the pre-image and the unused recipient.
    pub fn next_address(&mut self, wallet: &str, sequence_name: &str) -> Result<String> {
        let next = self.advance_sequence(wallet, sequence_name)?;
        let pubkey = next.key.as_pubkey()?;
        let (net, hash) = next.key.as_address()?;
        let address = encode_address(net, &hash);
        self.db_mut().set_invert_hash(
            HashFunction::Hash160.as_str(),
            hash.as_ref(),
            &pubkey.to_bytes(),
        )?;
        self.db_mut().add_unused(wallet, &address)?;
        debug!(wallet, sequence = sequence_name, index = next.index, %address, "issued address");
        Ok(address)
    }

    /// Advance a sequence and hand out the result as an xpub.
    pub fn next_xpub(&mut self, wallet: &str, sequence_name: &str) -> Result<String> {
        let next = self.advance_sequence(wallet, sequence_name)?;
        let xpub = next.key.as_hd_pubkey()?;
        let text = xpub.to_string();
        self.db_mut().add_unused(wallet, &text)?;
        Ok(text)
    }

    pub fn record_unused(&mut self, wallet: &str, recipient: &str) -> Result<()> {
        self.db_mut().add_unused(wallet, recipient)
    }

    pub fn unused(&self, wallet: &str) -> Result<Vec<String>> {
        self.db().unused(wallet)
    }

    pub fn set_invert_hash(
        &mut self,
        function: HashFunction,
        digest: &[u8],
        preimage: &[u8],
    ) -> Result<()> {
        self.db_mut()
            .set_invert_hash(function.as_str(), digest, preimage)
    }

    pub fn invert_hash(&self, function: HashFunction, digest: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db().invert_hash(function.as_str(), digest)
    }

    // ----- account -----

    pub fn account(&self, wallet: &str) -> Result<Account> {
        let mut account = Account::new();
        for (outpoint, entry) in self.db().account_entries(wallet)? {
            account.entries.insert(outpoint, entry);
        }
        Ok(account)
    }

    /// Total satoshis the wallet can spend.
    pub fn value(&self, wallet: &str) -> Result<u64> {
        Ok(self.account(wallet)?.value())
    }

    /// Apply an account diff to the persisted account. Fails with
    /// `diff-conflict` (before any write) when a removal is absent.
    pub fn apply_diff(&mut self, wallet: &str, diff: &AccountDiff) -> Result<()> {
        let mut account = self.account(wallet)?;
        account.apply(diff)?;
        for outpoint in &diff.remove {
            self.db_mut().delete_account_entry(wallet, outpoint)?;
        }
        for (index, entry) in &diff.insert {
            self.db_mut()
                .set_account_entry(wallet, &OutPoint::new(diff.txid, *index), entry)?;
        }
        Ok(())
    }

    // ----- history and payments -----

    /// All recipients this wallet watches: every key its sequences have
    /// produced, plus everything handed out and not yet seen.
    pub fn recipients(&self, wallet: &str) -> Result<Vec<String>> {
        let mut recipients = BTreeSet::new();
        for (_, record) in self.db().sequences(wallet)? {
            let sequence = KeySequence::with_next(
                KeyExpr::parse(&record.key)?,
                parse_path(&record.path)?,
                record.next,
            )?;
            for index in 0..sequence.next {
                let key = sequence.derivation_at(index)?.derive()?;
                let (net, hash) = key.as_address()?;
                recipients.insert(encode_address(net, &hash));
            }
        }
        for unused in self.db().unused(wallet)? {
            recipients.insert(unused);
        }
        Ok(recipients.into_iter().collect())
    }

    /// Reconstruct the wallet's history from the transaction store.
    pub fn history(&self, wallet: &str) -> Result<History> {
        let mut events: Vec<Event> = Vec::new();
        for recipient in self.recipients(wallet)? {
            events.extend(self.txdb.by_address(&recipient)?);
        }
        events.sort();
        events.dedup();
        Ok(History::from_events(events))
    }

    /// The history with every confirmed summary priced through the feed.
    pub async fn history_with_prices<P: PriceSource>(
        &self,
        wallet: &str,
        source: &P,
        unit: MonetaryUnit,
    ) -> Result<History> {
        let mut history = self.history(wallet)?;
        history.annotate_prices(source, unit).await?;
        Ok(history)
    }

    /// Capital gains and potential income over the wallet's whole
    /// history.
    pub async fn tax_report<P: PriceSource>(
        &self,
        wallet: &str,
        source: &P,
        unit: MonetaryUnit,
    ) -> Result<crate::tax::TaxReport> {
        let history = self.history(wallet)?;
        crate::tax::calculate(&self.txdb, source, unit, &history).await
    }

    pub fn payments(&self, wallet: &str) -> Result<Payments> {
        match self.db().payments(wallet)? {
            Some(json) => Payments::from_json(&json),
            None => Ok(Payments::default()),
        }
    }

    pub fn set_payments(&mut self, wallet: &str, payments: &Payments) -> Result<()> {
        self.db_mut().set_payments(wallet, &payments.to_json())
    }

    /// Issue a payment request against a fresh receive key and remember
    /// how to redeem what arrives.
    pub fn request_payment(
        &mut self,
        wallet: &str,
        request: PaymentRequest,
    ) -> Result<String> {
        let next = self.advance_sequence(wallet, RECEIVE_SEQUENCE)?;
        let (net, hash) = next.key.as_address()?;
        let address = encode_address(net, &hash);
        let redeem = Signing::new(vec![next.derivation], script::redeem_expected_size(true));

        let mut payments = self.payments(wallet)?;
        payments.request(&address, request, redeem)?;
        self.set_payments(wallet, &payments)?;
        self.db_mut().add_unused(wallet, &address)?;
        Ok(address)
    }

    /// Record a payment we have constructed for a payee but not yet
    /// broadcast: the BEEF to hand over and the diffs it will apply once
    /// accepted.
    pub fn propose_payment(
        &mut self,
        wallet: &str,
        payee: &str,
        request: PaymentRequest,
        beef: &Beef,
        diffs: Vec<AccountDiff>,
    ) -> Result<()> {
        let mut payments = self.payments(wallet)?;
        payments.proposals.insert(
            payee.to_owned(),
            crate::pay::Offer {
                request,
                transfer: beef.to_bytes(),
                diffs,
            },
        );
        self.set_payments(wallet, &payments)
    }

    /// Completed payments: proposals whose outpoints overlap received
    /// events in the history.
    pub fn completed_payments(&self, wallet: &str) -> Result<Vec<(String, Vec<Txid>)>> {
        let history = self.history(wallet)?;
        let received: BTreeSet<OutPoint> = history
            .events
            .iter()
            .flat_map(|summary| summary.events.iter())
            .filter(|event| event.direction == Direction::Out)
            .map(Event::point)
            .collect();
        Ok(self.payments(wallet)?.completed(&received))
    }

    /// A JSON summary of the wallet for the `details` endpoint.
    pub fn details(&self, wallet: &str) -> Result<serde_json::Value> {
        let account = self.account(wallet)?;
        let history = self.history(wallet)?;
        let pending = history
            .events
            .iter()
            .filter(|summary| summary.when == When::Unconfirmed)
            .count();
        Ok(serde_json::json!({
            "name": wallet,
            "value": account.value(),
            "outputs": account.len(),
            "received": history.received,
            "spent": history.spent,
            "unconfirmed_transactions": pending,
            "unused_recipients": self.unused(wallet)?,
        }))
    }

    // ----- finding our own outputs -----

    /// The signing metadata for an output script, if one of the wallet's
    /// sequences (within the look-ahead window) can redeem it.
    pub fn find_recipient(&self, wallet: &str, script: &Script) -> Result<Option<Signing>> {
        let hash = match script::pay_to_address_hash(script) {
            Some(hash) => hash,
            None => return Ok(None),
        };
        for (_, record) in self.db().sequences(wallet)? {
            let sequence = KeySequence::with_next(
                KeyExpr::parse(&record.key)?,
                parse_path(&record.path)?,
                record.next,
            )?;
            for index in 0..sequence.next + SEQUENCE_LOOK_AHEAD {
                let derivation = sequence.derivation_at(index)?;
                let key = derivation.derive()?;
                if key.as_pubkey()?.pubkey_hash() == hash {
                    return Ok(Some(Signing::new(
                        vec![derivation],
                        script::redeem_expected_size(true),
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Import a payment by SPV proof.
    ///
    /// Every proven transaction must reference a stored header; the rest
    /// are inserted pending. Outputs this wallet can redeem land in the
    /// account, and their recipients stop being unused.
    pub fn import_beef(&mut self, wallet: &str, beef: &Beef) -> Result<Vec<(OutPoint, u64)>> {
        beef.check_structure()?;

        for entry in &beef.txs {
            match entry.bump {
                Some(index) => {
                    let bump = &beef.bumps[index];
                    let root = bump.root()?;
                    let block = self
                        .txdb
                        .header_by_root(&root)?
                        .ok_or_else(|| Error::UnknownBlock(root.to_string()))?;
                    self.txdb
                        .insert_tx_with_proof(&entry.tx, bump, &block.header)?;
                }
                None => self.txdb.insert_tx(&entry.tx)?,
            }
        }

        let mut received = Vec::new();
        for entry in &beef.txs {
            let txid = entry.tx.compute_txid();
            for (vout, output) in entry.tx.output.iter().enumerate() {
                let signing = match self.find_recipient(wallet, &output.script_pubkey)? {
                    Some(signing) => signing,
                    None => continue,
                };
                let outpoint = OutPoint::new(txid, vout as u32);
                self.db_mut().set_account_entry(
                    wallet,
                    &outpoint,
                    &Redeemable::new(output.clone(), signing),
                )?;
                if let Some(hash) = script::pay_to_address_hash(&output.script_pubkey) {
                    let address = encode_address(NetworkKind::Main, &hash);
                    self.db_mut().remove_unused(wallet, &address)?;
                }
                received.push((outpoint, output.value.to_sat()));
            }
        }
        info!(
            wallet,
            transactions = beef.txs.len(),
            outputs = received.len(),
            "imported payment"
        );
        Ok(received)
    }

    // ----- spending -----

    /// Construct and sign a spend from this wallet. Nothing is persisted;
    /// the caller broadcasts and then calls [`Wallets::commit_spend`].
    pub fn spend(
        &mut self,
        wallet: &str,
        to: &[bitcoin::TxOut],
        params: &SpendParams,
    ) -> Result<SpendResult> {
        let account = self.account(wallet)?;
        let change_sequence = self.sequence(wallet, CHANGE_SEQUENCE)?;
        let random = self.random.clone();
        let mut guard = random.lock();
        spend::spend(
            self,
            &account,
            &change_sequence,
            to,
            params,
            guard.casual(),
        )
    }

    /// Persist an accepted spend: store the transactions as pending,
    /// apply the diffs, and advance the change sequence.
    pub fn commit_spend(&mut self, wallet: &str, result: &SpendResult) -> Result<()> {
        for (extended, diff) in &result.txs {
            self.txdb.insert_tx(&extended.tx)?;
            self.apply_diff(wallet, diff)?;
        }
        let mut sequence = self.sequence(wallet, CHANGE_SEQUENCE)?;
        if result.next_change_index > sequence.next {
            sequence.next = result.next_change_index;
            self.set_sequence(wallet, CHANGE_SEQUENCE, &sequence)?;
        }
        Ok(())
    }
}

impl<D: Database> PrivateKeyStore for Wallets<D> {
    fn to_private(&self, public: &KeyExpr) -> Result<Option<KeyExpr>> {
        self.to_private_expr(public)
    }
}

/// The key kinds the random generator can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratedKeyKind {
    Secp256k1,
    Wif,
    Xpriv,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::random::Random;

    const XPRV: &str = "xprv9s21ZrQH143K3yzPZD4Qe6M6hbPVZPrsARe7T1Ly9tJHj7jKFmVreHERV7A9eBZZsB5fzefvChhro43yQgXwAzPpJ9nC9SUWwXnFEa8m4km";

    fn wallets() -> Wallets<MemoryDatabase> {
        Wallets::new(
            MemoryDatabase::new(),
            SharedRandom::new(Random::deterministic(b"seed", b"nonce")),
        )
    }

    fn master() -> KeyExpr {
        KeyExpr::parse(&format!("HD.secret \"{XPRV}\"")).unwrap()
    }

    fn with_sequences(wallets: &mut Wallets<MemoryDatabase>, name: &str) {
        wallets.make_wallet(name).unwrap();
        wallets.set_key(name, "master", &master()).unwrap();
        let public = master().to_public().unwrap();
        wallets.set_to_private(&public, &master()).unwrap();
        wallets
            .set_sequence(
                name,
                RECEIVE_SEQUENCE,
                &KeySequence::new(public.clone(), parse_path("0").unwrap()).unwrap(),
            )
            .unwrap();
        wallets
            .set_sequence(
                name,
                CHANGE_SEQUENCE,
                &KeySequence::new(public, parse_path("1").unwrap()).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn wallet_names_are_validated() {
        let mut wallets = wallets();
        assert!(wallets.make_wallet("alpha").is_ok());
        assert!(matches!(
            wallets.make_wallet("alpha"),
            Err(Error::WalletExists(_))
        ));
        assert!(wallets.make_wallet("9bad").is_err());
        assert!(wallets.make_wallet("bad name").is_err());
    }

    #[test]
    fn keys_round_trip_through_the_store() {
        let mut wallets = wallets();
        wallets.make_wallet("alpha").unwrap();
        let key = KeyExpr::parse("secret 123").unwrap();
        wallets.set_key("alpha", "k", &key).unwrap();
        assert_eq!(wallets.get_key("alpha", "k").unwrap(), key);
        assert!(matches!(
            wallets.get_key("alpha", "missing"),
            Err(Error::KeyMissing(_))
        ));
    }

    #[test]
    fn to_private_rejects_mismatched_pairs() {
        let mut wallets = wallets();
        let public = KeyExpr::parse("secret 999").unwrap().to_public().unwrap();
        assert!(wallets.set_to_private(&public, &master()).is_err());

        let matching = master().to_public().unwrap();
        wallets.set_to_private(&matching, &master()).unwrap();
        assert_eq!(
            wallets.to_private_expr(&matching).unwrap(),
            Some(master())
        );
    }

    #[test]
    fn advancing_a_sequence_persists_the_index() {
        let mut wallets = wallets();
        with_sequences(&mut wallets, "alpha");

        let first = wallets.next_address("alpha", RECEIVE_SEQUENCE).unwrap();
        let second = wallets.next_address("alpha", RECEIVE_SEQUENCE).unwrap();
        assert_ne!(first, second);
        assert_eq!(wallets.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 2);

        // Both are tracked as unused recipients.
        let unused = wallets.unused("alpha").unwrap();
        assert!(unused.contains(&first) && unused.contains(&second));

        // The pre-image store can walk the address hash back to a pubkey.
        let key = wallets
            .sequence("alpha", RECEIVE_SEQUENCE)
            .unwrap()
            .derivation_at(0)
            .unwrap()
            .derive()
            .unwrap();
        let hash = key.as_pubkey().unwrap().pubkey_hash();
        let preimage = wallets
            .invert_hash(HashFunction::Hash160, hash.as_ref())
            .unwrap()
            .unwrap();
        assert_eq!(preimage, key.as_pubkey().unwrap().to_bytes());
    }

    #[test]
    fn next_xpub_yields_an_extended_key() {
        let mut wallets = wallets();
        with_sequences(&mut wallets, "alpha");
        let xpub = wallets.next_xpub("alpha", RECEIVE_SEQUENCE).unwrap();
        assert!(xpub.starts_with("xpub"));
    }

    #[test]
    fn find_recipient_searches_the_look_ahead_window() {
        let mut wallets = wallets();
        with_sequences(&mut wallets, "alpha");

        // Index 5 has never been handed out but is within the window.
        let key = wallets
            .sequence("alpha", RECEIVE_SEQUENCE)
            .unwrap()
            .derivation_at(5)
            .unwrap()
            .derive()
            .unwrap();
        let script = script::pay_to_address(&key.as_pubkey().unwrap().pubkey_hash());
        let signing = wallets.find_recipient("alpha", &script).unwrap().unwrap();
        assert_eq!(signing.derivations.len(), 1);

        let stranger = script::pay_to_address(
            &KeyExpr::parse("secret 999")
                .unwrap()
                .as_pubkey()
                .unwrap()
                .pubkey_hash(),
        );
        assert!(wallets.find_recipient("alpha", &stranger).unwrap().is_none());
    }

    #[test]
    fn generated_keys_parse_back() {
        let mut wallets = wallets();
        wallets.make_wallet("alpha").unwrap();
        for kind in [
            GeneratedKeyKind::Secp256k1,
            GeneratedKeyKind::Wif,
            GeneratedKeyKind::Xpriv,
        ] {
            let key = wallets
                .generate_key("alpha", "k", kind, NetworkKind::Main, true)
                .unwrap();
            assert_eq!(wallets.get_key("alpha", "k").unwrap(), key);
            assert!(key.is_private());
        }
    }
}
