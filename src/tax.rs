//! Tax reporting: fold the wallet's history and the price feed into
//! capital gains and a list of potential income events.
//!
//! We cannot know where incoming money came from — another wallet of the
//! same user, an exchange, a customer — so incoming value is reported as
//! *potential* income for the user to classify. Moves of the wallet's own
//! outputs realize a gain or loss against their acquisition price.

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::{OutPoint, TxOut, Txid};

use crate::db::Database;
use crate::error::Result;
use crate::network::{MonetaryUnit, PriceCache, PriceSource};
use crate::spv::When;
use crate::txdb::{Direction, Event, Put, TxDb};
use crate::wallet::history::History;

/// Holding periods at least this long realize long-term gains.
const ONE_YEAR_SECONDS: u32 = 365 * 24 * 60 * 60;

/// Realized gains over the reporting period, in fiat.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CapitalGain {
    pub loss: f64,
    pub short_term: f64,
    pub long_term: f64,
}

impl fmt::Display for CapitalGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capital loss: {:.2}, capital gain (short term): {:.2}, capital gain (long term): {:.2}",
            self.loss, self.short_term, self.long_term
        )
    }
}

/// Value that arrived in one transaction from outside the wallet.
#[derive(Clone, Debug)]
pub struct PotentialIncome {
    pub txid: Txid,
    /// Incoming satoshis, not counting money moved from this wallet.
    pub income: u64,
    /// Exchange rate at the time of the transaction; absent while it is
    /// unconfirmed.
    pub price: Option<f64>,
    /// The funding inputs of the transaction, for tracing where the
    /// money came from. Their total may exceed the income.
    pub incoming: Vec<Event>,
}

/// The report: realized gains, income candidates, and the account at the
/// end of the period.
#[derive(Clone, Debug, Default)]
pub struct TaxReport {
    pub capital_gain: CapitalGain,
    pub income: Vec<PotentialIncome>,
    pub account: BTreeMap<OutPoint, TxOut>,
}

/// Fold a wallet history into a tax report.
///
/// A moved output realizes gain or loss between its acquisition price and
/// the price at the move; held under a year is short-term. Moves whose
/// acquisition cannot be timed (an unconfirmed ancestor) still count as
/// moved value but realize nothing.
pub async fn calculate<D: Database, P: PriceSource>(
    txdb: &TxDb<D>,
    prices: &P,
    unit: MonetaryUnit,
    history: &History,
) -> Result<TaxReport> {
    let mut cache = PriceCache::new();
    let mut capital_gain = CapitalGain::default();
    let mut income = Vec::new();
    let mut running: BTreeMap<OutPoint, TxOut> = BTreeMap::new();

    // History is newest-first; replay it forward.
    for summary in history.events.iter().rev() {
        let sell_time = match summary.when {
            When::Confirmed(t) => Some(t),
            When::Unconfirmed => None,
        };
        let price = match sell_time {
            Some(t) => Some(cache.get(prices, unit, t).await?),
            None => None,
        };

        let mut moved = 0u64;
        let mut income_total = 0u64;
        let mut incoming = Vec::new();

        for event in &summary.events {
            match (&event.direction, &event.put) {
                (Direction::In, Put::Input(input)) => {
                    let outpoint = input.previous_output;
                    if running.remove(&outpoint).is_some() {
                        moved += event.value;
                        let (sell_price, sell_time) = match (price, sell_time) {
                            (Some(p), Some(t)) => (p, t),
                            _ => continue,
                        };
                        let acquired = match txdb.vertex(&outpoint.txid)? {
                            Some(vertex) => match vertex.when() {
                                When::Confirmed(t) => t,
                                When::Unconfirmed => continue,
                            },
                            None => continue,
                        };
                        let buy_price = cache.get(prices, unit, acquired).await?;
                        let value = event.value as f64;
                        if sell_price < buy_price {
                            capital_gain.loss += (buy_price - sell_price) * value;
                        } else if sell_time.saturating_sub(acquired) < ONE_YEAR_SECONDS {
                            capital_gain.short_term += (sell_price - buy_price) * value;
                        } else {
                            capital_gain.long_term += (sell_price - buy_price) * value;
                        }
                    } else {
                        incoming.push(event.clone());
                    }
                }
                (Direction::Out, Put::Output(output)) => {
                    running.insert(event.point(), output.clone());
                    income_total += event.value;
                }
                // A mislabeled event is a store bug; skip it.
                _ => continue,
            }
        }

        let net_income = income_total.saturating_sub(moved);
        if net_income > 0 {
            income.push(PotentialIncome {
                txid: summary.txid,
                income: net_income,
                price,
                incoming,
            });
        }
    }

    Ok(TaxReport {
        capital_gain,
        income,
        account: running,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::{sha256d, Hash};
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, BlockHash, CompactTarget, ScriptBuf, Sequence, Transaction, TxIn, Witness,
    };

    use super::*;
    use crate::db::MemoryDatabase;
    use crate::keys::KeyExpr;
    use crate::merkle::{merkle_branch, merkle_root, Bump};
    use crate::network::NetResult;
    use crate::script;

    /// A feed scripted per timestamp.
    struct ScriptedPrices(Map<u32, f64>);

    impl PriceSource for ScriptedPrices {
        async fn fiat_price(&self, _unit: MonetaryUnit, timestamp: u32) -> NetResult<f64> {
            Ok(*self.0.get(&timestamp).unwrap_or(&0.0))
        }
    }

    fn wallet_script() -> ScriptBuf {
        let hash = KeyExpr::parse("secret 123")
            .unwrap()
            .as_pubkey()
            .unwrap()
            .pubkey_hash();
        script::pay_to_address(&hash)
    }

    fn wallet_address() -> String {
        let (net, hash) = KeyExpr::parse("secret 123").unwrap().as_address().unwrap();
        crate::keys::expression::encode_address(net, &hash)
    }

    fn funding_tx(value: u64) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: wallet_script(),
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

    fn confirm(db: &mut TxDb<MemoryDatabase>, tx: &Transaction, height: u64, time: u32) {
        let txid = tx.compute_txid();
        let mut txids = vec![txid];
        txids.push(Txid::from_raw_hash(sha256d::Hash::hash(&[height as u8])));
        let header = bitcoin::block::Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: merkle_root(&txids).unwrap(),
            time,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        db.insert_tx(tx).unwrap();
        db.insert_header(height, &header).unwrap();
        db.insert_proof(&Bump::from_branch(height, 0, &txid, &merkle_branch(&txids, 0)))
            .unwrap();
    }

    async fn report_for(
        hold_seconds: u32,
        buy_price: f64,
        sell_price: f64,
    ) -> (TaxReport, u64) {
        let mut db = TxDb::new(MemoryDatabase::new());
        let funding = funding_tx(10_000);
        let spend = spending_tx(&funding);
        let t0 = 1_600_000_000u32;
        let t1 = t0 + hold_seconds;
        confirm(&mut db, &funding, 100, t0);
        confirm(&mut db, &spend, 101, t1);

        let history = History::from_events(db.by_address(&wallet_address()).unwrap());
        let prices = ScriptedPrices(Map::from([(t0, buy_price), (t1, sell_price)]));
        let report = calculate(&db, &prices, MonetaryUnit::Usd, &history)
            .await
            .unwrap();
        (report, 10_000)
    }

    #[tokio::test]
    async fn short_term_gain() {
        let (report, value) = report_for(1000, 100.0, 150.0).await;
        assert_eq!(report.capital_gain.short_term, 50.0 * value as f64);
        assert_eq!(report.capital_gain.long_term, 0.0);
        assert_eq!(report.capital_gain.loss, 0.0);
    }

    #[tokio::test]
    async fn long_term_gain() {
        let (report, value) = report_for(super::ONE_YEAR_SECONDS + 1, 100.0, 150.0).await;
        assert_eq!(report.capital_gain.long_term, 50.0 * value as f64);
        assert_eq!(report.capital_gain.short_term, 0.0);
    }

    #[tokio::test]
    async fn falling_price_is_a_loss() {
        let (report, value) = report_for(1000, 150.0, 100.0).await;
        assert_eq!(report.capital_gain.loss, 50.0 * value as f64);
        assert_eq!(report.capital_gain.short_term, 0.0);
        assert_eq!(report.capital_gain.long_term, 0.0);
    }

    #[tokio::test]
    async fn funding_is_potential_income_and_moves_are_not() {
        let (report, value) = report_for(1000, 100.0, 150.0).await;
        // The funding transaction brought value in from outside.
        assert_eq!(report.income.len(), 1);
        let potential = &report.income[0];
        assert_eq!(potential.income, value);
        assert_eq!(potential.price, Some(100.0));
        // Its funding input came from outside the wallet.
        assert_eq!(potential.incoming.len(), 0);

        // The move emptied the account.
        assert!(report.account.is_empty());
    }

    #[tokio::test]
    async fn empty_history_is_an_empty_report() {
        let db = TxDb::new(MemoryDatabase::new());
        let prices = ScriptedPrices(Map::new());
        let report = calculate(
            &db,
            &prices,
            MonetaryUnit::Usd,
            &History::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.capital_gain, CapitalGain::default());
        assert!(report.income.is_empty());
        assert!(report.account.is_empty());
    }
}
