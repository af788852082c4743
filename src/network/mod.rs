//! The network adapter: the abstract operations the core depends on, the
//! broadcast result taxonomy, and the bottom-up broadcast of proof
//! bundles.

pub mod client;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use bitcoin::block::Header;
use bitcoin::{BlockHash, Txid};
use serde_json::Value;
use thiserror::Error as ThisError;
use tracing::{debug, warn};

use crate::beef::Beef;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::extended::{ExtendedTransaction, SatsPerByte};
use crate::merkle::Bump;
use crate::script::ScriptHash;
use crate::txdb::TxDb;

pub use self::client::Network;

/// Shorthand for results of network operations.
pub type NetResult<T> = std::result::Result<T, NetworkError>;

/// What can go wrong talking to a provider, before the response is even
/// interpreted.
#[derive(Debug, ThisError)]
pub enum NetworkError {
    /// Network connectivity issues.
    #[error("connection: {0}")]
    Connection(String),
    /// The provider took too long.
    #[error("request timed out")]
    Timeout,
    /// The provider refused our credentials.
    #[error("not authenticated")]
    Inauthenticated,
    /// An HTTP status outside what the call expects.
    #[error("unexpected status {0}: {1}")]
    Status(u16, String),
    /// A response we could not make sense of.
    #[error("malformed response: {0}")]
    Parse(String),
    /// Ran out of retries.
    #[error("max retries {0} exceeded")]
    MaxRetriesExceeded(u8),
    #[error("{0}")]
    Other(String),
}

/// The outcome of submitting one transaction, mapped from whatever the
/// provider said. Fee and validity rejections carry the provider payload
/// for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastResult {
    Success,
    InsufficientFee { details: Option<Value> },
    Invalid { details: Option<Value> },
    Inauthenticated,
    ConnectionFail(String),
    Unknown(String),
}

impl BroadcastResult {
    pub fn success(&self) -> bool {
        matches!(self, BroadcastResult::Success)
    }

    /// The error this outcome maps to in the crate taxonomy, if any.
    pub fn to_error(&self) -> Option<Error> {
        match self {
            BroadcastResult::Success => None,
            BroadcastResult::InsufficientFee { .. } => Some(Error::BroadcastInsufficientFee),
            BroadcastResult::Invalid { .. } => Some(Error::BroadcastInvalid),
            BroadcastResult::Inauthenticated => Some(Error::Inauthenticated),
            BroadcastResult::ConnectionFail(detail) => {
                Some(Error::NetworkConnectionFail(detail.clone()))
            }
            BroadcastResult::Unknown(detail) => {
                Some(Error::NetworkConnectionFail(detail.clone()))
            }
        }
    }
}

/// Per-txid outcomes of broadcasting a proof bundle, plus the first
/// fatal error.
#[derive(Clone, Debug, Default)]
pub struct BroadcastTreeResult {
    pub sub: BTreeMap<Txid, BroadcastResult>,
    pub first_failure: Option<Txid>,
}

impl BroadcastTreeResult {
    pub fn success(&self) -> bool {
        self.first_failure.is_none()
    }

    pub fn first_error(&self) -> Option<Error> {
        self.first_failure
            .as_ref()
            .and_then(|txid| self.sub.get(txid))
            .and_then(BroadcastResult::to_error)
    }
}

/// Read operations against the chain: transactions, headers, proofs, and
/// histories.
pub trait ChainSource {
    fn fetch_tx(&self, txid: &Txid) -> impl Future<Output = NetResult<Option<Vec<u8>>>> + Send;

    fn fetch_header_by_hash(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = NetResult<Option<(u64, Header)>>> + Send;

    fn fetch_header_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = NetResult<Option<Header>>> + Send;

    fn fetch_merkle_proof(
        &self,
        txid: &Txid,
    ) -> impl Future<Output = NetResult<Option<(BlockHash, Bump)>>> + Send;

    fn fetch_address_history(
        &self,
        address: &str,
    ) -> impl Future<Output = NetResult<Vec<Txid>>> + Send;

    fn fetch_script_history(
        &self,
        hash: &ScriptHash,
    ) -> impl Future<Output = NetResult<Vec<Txid>>> + Send;
}

/// Submitting transactions and learning what the miners charge.
pub trait Broadcaster {
    fn submit(
        &self,
        tx: &ExtendedTransaction,
    ) -> impl Future<Output = NetResult<BroadcastResult>> + Send;

    fn submit_batch(
        &self,
        txs: &[ExtendedTransaction],
    ) -> impl Future<Output = NetResult<Vec<(Txid, BroadcastResult)>>> + Send;

    fn fee_quote(&self) -> impl Future<Output = NetResult<SatsPerByte>> + Send;
}

/// The fiat units a price can be quoted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonetaryUnit {
    Usd,
}

/// Exchange rate lookups for history annotation.
pub trait PriceSource {
    fn fiat_price(
        &self,
        unit: MonetaryUnit,
        timestamp: u32,
    ) -> impl Future<Output = NetResult<f64>> + Send;
}

/// Memoized prices, keyed by timestamp, so annotating a history hits the
/// feed once per moment.
#[derive(Clone, Debug, Default)]
pub struct PriceCache {
    prices: BTreeMap<u32, f64>,
}

impl PriceCache {
    pub fn new() -> Self {
        PriceCache::default()
    }

    pub async fn get<P: PriceSource>(
        &mut self,
        source: &P,
        unit: MonetaryUnit,
        timestamp: u32,
    ) -> NetResult<f64> {
        if let Some(rate) = self.prices.get(&timestamp) {
            return Ok(*rate);
        }
        let rate = source.fiat_price(unit, timestamp).await?;
        self.prices.insert(timestamp, rate);
        Ok(rate)
    }
}

/// Fetch a transaction and whatever proof the chain has for it, and store
/// both. Returns whether the transaction was found at all.
pub async fn import_transaction<D: Database, C: ChainSource>(
    txdb: &mut TxDb<D>,
    chain: &C,
    txid: &Txid,
) -> Result<bool> {
    let raw = match chain.fetch_tx(txid).await? {
        Some(raw) => raw,
        None => return Ok(false),
    };
    let tx: bitcoin::Transaction = bitcoin::consensus::deserialize(&raw)?;

    // Stage the network results first; the store writes happen after the
    // last suspension point.
    let proof = chain.fetch_merkle_proof(txid).await?;
    let header = match &proof {
        Some((block_hash, _)) => chain.fetch_header_by_hash(block_hash).await?,
        None => None,
    };

    match (proof, header) {
        (Some((_, bump)), Some((height, header))) => {
            txdb.insert_header(height, &header)?;
            txdb.insert_tx_with_proof(&tx, &bump, &header)?;
        }
        _ => txdb.insert_tx(&tx)?,
    }
    Ok(true)
}

/// Broadcast a proof bundle bottom-up.
///
/// Every transaction with a proof is checked and stored as confirmed
/// without being submitted; every other transaction is submitted only
/// after all of its in-bundle ancestors succeeded, and stored as pending
/// on success. A failure skips all dependents but not unrelated siblings.
pub async fn broadcast_tree<D: Database, B: Broadcaster>(
    txdb: &mut TxDb<D>,
    net: &B,
    beef: &Beef,
) -> Result<BroadcastTreeResult> {
    beef.check_structure()?;

    let mut result = BroadcastTreeResult::default();
    let mut dead: BTreeSet<Txid> = BTreeSet::new();
    let mut outputs: BTreeMap<Txid, Vec<bitcoin::TxOut>> = BTreeMap::new();

    for entry in &beef.txs {
        let txid = entry.tx.compute_txid();
        outputs.insert(txid, entry.tx.output.clone());

        // Skip anything whose ancestors already failed.
        if entry
            .tx
            .input
            .iter()
            .any(|input| dead.contains(&input.previous_output.txid))
        {
            dead.insert(txid);
            continue;
        }

        match entry.bump {
            Some(index) => {
                // A proven leaf: verify against a stored header, never
                // submit.
                let bump = &beef.bumps[index];
                let root = bump.root()?;
                match txdb.header_by_root(&root)? {
                    Some(block) => {
                        txdb.insert_tx_with_proof(&entry.tx, bump, &block.header)?;
                        result.sub.insert(txid, BroadcastResult::Success);
                    }
                    None => {
                        warn!(%txid, "no stored header for proof root");
                        result.sub.insert(
                            txid,
                            BroadcastResult::Unknown(format!("unknown block root {root}")),
                        );
                        result.first_failure.get_or_insert(txid);
                        dead.insert(txid);
                    }
                }
            }
            None => {
                // Already mined and proven locally? Nothing to do.
                if let Some(vertex) = txdb.vertex(&txid)? {
                    if vertex.confirmation.is_some() {
                        result.sub.insert(txid, BroadcastResult::Success);
                        continue;
                    }
                }

                let mut prevouts = Vec::with_capacity(entry.tx.input.len());
                let mut resolvable = true;
                for input in &entry.tx.input {
                    let op = input.previous_output;
                    let prevout = match outputs
                        .get(&op.txid)
                        .and_then(|outs| outs.get(op.vout as usize).cloned())
                    {
                        Some(prevout) => Some(prevout),
                        None => txdb.output(&op)?,
                    };
                    match prevout {
                        Some(prevout) => prevouts.push(prevout),
                        None => {
                            resolvable = false;
                            break;
                        }
                    }
                }
                if !resolvable {
                    result.sub.insert(
                        txid,
                        BroadcastResult::Invalid {
                            details: Some(Value::String("missing prevout".into())),
                        },
                    );
                    result.first_failure.get_or_insert(txid);
                    dead.insert(txid);
                    continue;
                }

                let extended = ExtendedTransaction::new(entry.tx.clone(), prevouts)?;
                let outcome = match net.submit(&extended).await {
                    Ok(outcome) => outcome,
                    Err(e) => BroadcastResult::ConnectionFail(e.to_string()),
                };
                debug!(%txid, success = outcome.success(), "submitted");
                if outcome.success() {
                    txdb.insert_tx(&entry.tx)?;
                } else {
                    result.first_failure.get_or_insert(txid);
                    dead.insert(txid);
                }
                result.sub.insert(txid, outcome);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    use super::*;
    use crate::beef::BeefTx;
    use crate::db::MemoryDatabase;
    use crate::merkle::{merkle_branch, merkle_root};

    /// A scripted broadcaster: outcomes per txid, everything else
    /// succeeds.
    struct MockBroadcaster {
        outcomes: BTreeMap<Txid, BroadcastResult>,
        submitted: Mutex<Vec<Txid>>,
    }

    impl MockBroadcaster {
        fn new(outcomes: BTreeMap<Txid, BroadcastResult>) -> Self {
            MockBroadcaster {
                outcomes,
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    impl Broadcaster for MockBroadcaster {
        async fn submit(&self, tx: &ExtendedTransaction) -> NetResult<BroadcastResult> {
            let txid = tx.txid();
            self.submitted.lock().unwrap().push(txid);
            Ok(self
                .outcomes
                .get(&txid)
                .cloned()
                .unwrap_or(BroadcastResult::Success))
        }

        async fn submit_batch(
            &self,
            txs: &[ExtendedTransaction],
        ) -> NetResult<Vec<(Txid, BroadcastResult)>> {
            let mut results = Vec::new();
            for tx in txs {
                results.push((tx.txid(), self.submit(tx).await?));
            }
            Ok(results)
        }

        async fn fee_quote(&self) -> NetResult<SatsPerByte> {
            Ok(SatsPerByte::new(1, 20))
        }
    }

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
                value: Amount::from_sat(50_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn child_of(parent: &Transaction, value: u64) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(parent.compute_txid(), 0),
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn proven_bundle() -> (Beef, bitcoin::block::Header) {
        let parent = coinbase(1);
        let mut txids = vec![parent.compute_txid()];
        txids.push(Txid::from_raw_hash(sha256d::Hash::hash(&[0xAA])));
        let bump = Bump::from_branch(700, 0, &txids[0], &merkle_branch(&txids, 0));
        let header = bitcoin::block::Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: merkle_root(&txids).unwrap(),
            time: 1_700_000_000,
            bits: bitcoin::CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        let child = child_of(&parent, 49_000);
        let grandchild = child_of(&child, 48_000);
        let beef = Beef {
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
                BeefTx {
                    tx: grandchild,
                    bump: None,
                },
            ],
        };
        (beef, header)
    }

    #[tokio::test]
    async fn full_tree_succeeds() {
        let (beef, header) = proven_bundle();
        let mut txdb = TxDb::new(MemoryDatabase::new());
        txdb.insert_header(700, &header).unwrap();

        let net = MockBroadcaster::new(BTreeMap::new());
        let result = broadcast_tree(&mut txdb, &net, &beef).await.unwrap();
        assert!(result.success());
        assert_eq!(result.sub.len(), 3);
        // The proven leaf was stored, not submitted.
        assert_eq!(net.submitted.lock().unwrap().len(), 2);
        // The pending children are in the store.
        assert_eq!(txdb.unconfirmed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_leaf_blocks_its_dependents() {
        let (beef, header) = proven_bundle();
        let mut txdb = TxDb::new(MemoryDatabase::new());
        txdb.insert_header(700, &header).unwrap();

        let child_txid = beef.txs[1].tx.compute_txid();
        let grandchild_txid = beef.txs[2].tx.compute_txid();
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            child_txid,
            BroadcastResult::InsufficientFee { details: None },
        );

        let net = MockBroadcaster::new(outcomes);
        let result = broadcast_tree(&mut txdb, &net, &beef).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.first_failure, Some(child_txid));
        assert!(matches!(
            result.sub.get(&child_txid),
            Some(BroadcastResult::InsufficientFee { .. })
        ));
        // The dependent was never submitted or recorded.
        assert!(!result.sub.contains_key(&grandchild_txid));
        assert!(!net.submitted.lock().unwrap().contains(&grandchild_txid));
        assert!(matches!(
            result.first_error(),
            Some(Error::BroadcastInsufficientFee)
        ));
    }
}
