//! An in-memory database for tests, behind the same trait as the
//! production store.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::block::Header;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, TxMerkleNode, Txid};

use crate::error::{Error, Result};
use crate::merkle::Bump;
use crate::script::ScriptHash;
use crate::wallet::account::Redeemable;

use super::{BlockEntry, Database, Inpoint, SequenceRecord, TxRecord, TxStatus};

#[derive(Default)]
struct WalletTables {
    keys: BTreeMap<String, String>,
    sequences: BTreeMap<String, SequenceRecord>,
    unused: BTreeSet<String>,
    account: BTreeMap<OutPoint, Redeemable>,
    payments: Option<String>,
}

/// Everything in maps. Only tests construct this.
#[derive(Default)]
pub struct MemoryDatabase {
    blocks: BTreeMap<u64, BlockEntry>,
    transactions: BTreeMap<Txid, TxRecord>,
    scripts: BTreeMap<ScriptHash, ScriptBuf>,
    outputs: BTreeMap<ScriptHash, BTreeSet<OutPoint>>,
    addresses: BTreeMap<String, BTreeSet<ScriptHash>>,
    redemptions: BTreeMap<OutPoint, Inpoint>,
    wallets: BTreeMap<String, WalletTables>,
    to_private: BTreeMap<String, String>,
    invert_hash: BTreeMap<(String, Vec<u8>), Vec<u8>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        MemoryDatabase::default()
    }

    fn wallet(&self, name: &str) -> Result<&WalletTables> {
        self.wallets
            .get(name)
            .ok_or_else(|| Error::WalletMissing(name.into()))
    }

    fn wallet_mut(&mut self, name: &str) -> Result<&mut WalletTables> {
        self.wallets
            .get_mut(name)
            .ok_or_else(|| Error::WalletMissing(name.into()))
    }
}

impl Database for MemoryDatabase {
    fn insert_block(&mut self, height: u64, header: &Header) -> Result<()> {
        self.blocks.insert(
            height,
            BlockEntry {
                height,
                header: *header,
                bump: None,
            },
        );
        Ok(())
    }

    fn block_by_height(&self, height: u64) -> Result<Option<BlockEntry>> {
        Ok(self.blocks.get(&height).cloned())
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockEntry>> {
        Ok(self
            .blocks
            .values()
            .find(|b| b.hash() == *hash)
            .cloned())
    }

    fn block_by_root(&self, root: &TxMerkleNode) -> Result<Option<BlockEntry>> {
        Ok(self
            .blocks
            .values()
            .find(|b| b.merkle_root() == *root)
            .cloned())
    }

    fn latest_block(&self) -> Result<Option<BlockEntry>> {
        Ok(self.blocks.values().next_back().cloned())
    }

    fn remove_block(&mut self, height: u64) -> Result<()> {
        self.blocks.remove(&height);
        Ok(())
    }

    fn set_block_bump(&mut self, height: u64, bump: Option<&Bump>) -> Result<()> {
        match self.blocks.get_mut(&height) {
            Some(entry) => {
                entry.bump = bump.cloned();
                Ok(())
            }
            None => Err(Error::InvalidSyntax(format!("no block at height {height}"))),
        }
    }

    fn block_covering(&self, txid: &Txid) -> Result<Option<u64>> {
        Ok(self.blocks.values().find_map(|entry| {
            entry
                .bump
                .as_ref()
                .and_then(|bump| bump.tx_index(txid).map(|_| entry.height))
        }))
    }

    fn put_transaction(&mut self, txid: &Txid, raw: &[u8], status: TxStatus) -> Result<()> {
        self.transactions.insert(
            *txid,
            TxRecord {
                raw: raw.to_vec(),
                status,
            },
        );
        Ok(())
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<TxRecord>> {
        Ok(self.transactions.get(txid).cloned())
    }

    fn set_transaction_status(&mut self, txid: &Txid, status: TxStatus) -> Result<()> {
        match self.transactions.get_mut(txid) {
            Some(record) => {
                record.status = status;
                Ok(())
            }
            None => Err(Error::InvalidSyntax(format!("no transaction {txid}"))),
        }
    }

    fn delete_transaction(&mut self, txid: &Txid) -> Result<()> {
        self.transactions.remove(txid);
        Ok(())
    }

    fn transactions_at_height(&self, height: u64) -> Result<Vec<Txid>> {
        Ok(self
            .transactions
            .iter()
            .filter(|(_, r)| r.status == TxStatus::Mined { height })
            .map(|(txid, _)| *txid)
            .collect())
    }

    fn unconfirmed(&self) -> Result<Vec<Txid>> {
        Ok(self
            .transactions
            .iter()
            .filter(|(_, r)| !r.status.is_mined())
            .map(|(txid, _)| *txid)
            .collect())
    }

    fn put_script(&mut self, hash: &ScriptHash, script: &ScriptBuf) -> Result<()> {
        self.scripts.insert(*hash, script.clone());
        Ok(())
    }

    fn script(&self, hash: &ScriptHash) -> Result<Option<ScriptBuf>> {
        Ok(self.scripts.get(hash).cloned())
    }

    fn add_output(&mut self, hash: &ScriptHash, outpoint: &OutPoint) -> Result<()> {
        self.outputs.entry(*hash).or_default().insert(*outpoint);
        Ok(())
    }

    fn outputs_by_script_hash(&self, hash: &ScriptHash) -> Result<Vec<OutPoint>> {
        Ok(self
            .outputs
            .get(hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn delete_output(&mut self, outpoint: &OutPoint) -> Result<()> {
        for set in self.outputs.values_mut() {
            set.remove(outpoint);
        }
        Ok(())
    }

    fn add_address(&mut self, address: &str, hash: &ScriptHash) -> Result<()> {
        self.addresses
            .entry(address.to_owned())
            .or_default()
            .insert(*hash);
        Ok(())
    }

    fn script_hashes_by_address(&self, address: &str) -> Result<Vec<ScriptHash>> {
        Ok(self
            .addresses
            .get(address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn set_redemption(&mut self, outpoint: &OutPoint, inpoint: &Inpoint) -> Result<()> {
        self.redemptions.insert(*outpoint, *inpoint);
        Ok(())
    }

    fn redemption(&self, outpoint: &OutPoint) -> Result<Option<Inpoint>> {
        Ok(self.redemptions.get(outpoint).copied())
    }

    fn delete_redemptions_by_spender(&mut self, txid: &Txid) -> Result<()> {
        self.redemptions.retain(|_, inpoint| inpoint.txid != *txid);
        Ok(())
    }

    fn create_wallet(&mut self, name: &str) -> Result<()> {
        if self.wallets.contains_key(name) {
            return Err(Error::WalletExists(name.into()));
        }
        self.wallets.insert(name.to_owned(), WalletTables::default());
        Ok(())
    }

    fn wallet_exists(&self, name: &str) -> Result<bool> {
        Ok(self.wallets.contains_key(name))
    }

    fn list_wallets(&self) -> Result<Vec<String>> {
        Ok(self.wallets.keys().cloned().collect())
    }

    fn set_key(&mut self, wallet: &str, name: &str, expression: &str) -> Result<()> {
        self.wallet_mut(wallet)?
            .keys
            .insert(name.to_owned(), expression.to_owned());
        Ok(())
    }

    fn key(&self, wallet: &str, name: &str) -> Result<Option<String>> {
        Ok(self.wallet(wallet)?.keys.get(name).cloned())
    }

    fn keys(&self, wallet: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .wallet(wallet)?
            .keys
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn set_sequence(&mut self, wallet: &str, name: &str, record: &SequenceRecord) -> Result<()> {
        self.wallet_mut(wallet)?
            .sequences
            .insert(name.to_owned(), record.clone());
        Ok(())
    }

    fn sequence(&self, wallet: &str, name: &str) -> Result<Option<SequenceRecord>> {
        Ok(self.wallet(wallet)?.sequences.get(name).cloned())
    }

    fn sequences(&self, wallet: &str) -> Result<Vec<(String, SequenceRecord)>> {
        Ok(self
            .wallet(wallet)?
            .sequences
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn add_unused(&mut self, wallet: &str, recipient: &str) -> Result<()> {
        self.wallet_mut(wallet)?.unused.insert(recipient.to_owned());
        Ok(())
    }

    fn remove_unused(&mut self, wallet: &str, recipient: &str) -> Result<()> {
        self.wallet_mut(wallet)?.unused.remove(recipient);
        Ok(())
    }

    fn unused(&self, wallet: &str) -> Result<Vec<String>> {
        Ok(self.wallet(wallet)?.unused.iter().cloned().collect())
    }

    fn set_to_private(&mut self, public: &str, private: &str) -> Result<()> {
        self.to_private
            .insert(public.to_owned(), private.to_owned());
        Ok(())
    }

    fn to_private(&self, public: &str) -> Result<Option<String>> {
        Ok(self.to_private.get(public).cloned())
    }

    fn set_invert_hash(&mut self, function: &str, digest: &[u8], preimage: &[u8]) -> Result<()> {
        self.invert_hash
            .insert((function.to_owned(), digest.to_vec()), preimage.to_vec());
        Ok(())
    }

    fn invert_hash(&self, function: &str, digest: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .invert_hash
            .get(&(function.to_owned(), digest.to_vec()))
            .cloned())
    }

    fn set_account_entry(
        &mut self,
        wallet: &str,
        outpoint: &OutPoint,
        entry: &Redeemable,
    ) -> Result<()> {
        self.wallet_mut(wallet)?
            .account
            .insert(*outpoint, entry.clone());
        Ok(())
    }

    fn delete_account_entry(&mut self, wallet: &str, outpoint: &OutPoint) -> Result<()> {
        self.wallet_mut(wallet)?.account.remove(outpoint);
        Ok(())
    }

    fn account_entries(&self, wallet: &str) -> Result<Vec<(OutPoint, Redeemable)>> {
        Ok(self
            .wallet(wallet)?
            .account
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    fn payments(&self, wallet: &str) -> Result<Option<String>> {
        Ok(self.wallet(wallet)?.payments.clone())
    }

    fn set_payments(&mut self, wallet: &str, json: &str) -> Result<()> {
        self.wallet_mut(wallet)?.payments = Some(json.to_owned());
        Ok(())
    }
}
