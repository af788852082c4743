//! The account: the UTXO set a wallet can spend, each entry annotated
//! with what redeeming it takes, and the diffs a spend applies to it.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::{OutPoint, TxOut, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::Signing;

/// An output the wallet can spend, with its redemption metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redeemable {
    /// The output to be redeemed.
    pub prevout: TxOut,
    /// How to redeem it.
    pub signing: Signing,
}

impl Redeemable {
    pub fn new(prevout: TxOut, signing: Signing) -> Self {
        Redeemable { prevout, signing }
    }

    pub fn value(&self) -> u64 {
        self.prevout.value.to_sat()
    }

    /// Expected serialized size of the input that spends this output.
    pub fn expected_input_size(&self) -> u64 {
        self.signing.expected_input_size()
    }
}

/// The wallet-local UTXO set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub entries: BTreeMap<OutPoint, Redeemable>,
}

impl Account {
    pub fn new() -> Self {
        Account::default()
    }

    /// Total spendable value in satoshis.
    pub fn value(&self) -> u64 {
        self.entries.values().map(Redeemable::value).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a diff: remove every listed outpoint, insert every new
    /// output under the diff's txid.
    ///
    /// A diff is compatible only when every removal is present; an
    /// incompatible diff fails with `diff-conflict` and leaves the account
    /// unchanged.
    pub fn apply(&mut self, diff: &AccountDiff) -> Result<()> {
        if diff.remove.iter().any(|op| !self.entries.contains_key(op)) {
            return Err(Error::DiffConflict);
        }
        for outpoint in &diff.remove {
            self.entries.remove(outpoint);
        }
        for (index, redeemable) in &diff.insert {
            self.entries
                .insert(OutPoint::new(diff.txid, *index), redeemable.clone());
        }
        Ok(())
    }
}

/// The only shape in which accounts change: one transaction's worth of
/// inserts and removes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDiff {
    /// The transaction whose outputs are being inserted.
    pub txid: Txid,
    /// Output index to redemption metadata.
    pub insert: BTreeMap<u32, Redeemable>,
    /// Outpoints this transaction spends out of the account.
    pub remove: BTreeSet<OutPoint>,
}

impl AccountDiff {
    pub fn new(txid: Txid) -> Self {
        AccountDiff {
            txid,
            insert: BTreeMap::new(),
            remove: BTreeSet::new(),
        }
    }
}
