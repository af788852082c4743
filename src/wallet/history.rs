//! History: fold the transaction store's event stream into per-transaction
//! summaries and a running plain account, newest first.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, TxOut, Txid};

use crate::error::Result;
use crate::network::{MonetaryUnit, PriceCache, PriceSource};
use crate::spv::When;
use crate::txdb::{Direction, Event, Put};

/// Everything one transaction did to the wallet.
#[derive(Clone, Debug)]
pub struct TxSummary {
    pub txid: Txid,
    pub when: When,
    /// Net value received by the wallet in this transaction.
    pub received: u64,
    /// Net value leaving the wallet.
    pub spent: u64,
    /// Value that went from the wallet back to the wallet.
    pub moved: u64,
    /// Exchange rate at the confirmation time, once annotated through
    /// [`History::annotate_prices`]. Unconfirmed activity has none.
    pub price: Option<f64>,
    pub events: Vec<Event>,
}

/// The reconstructed history of a wallet: derived on read from the event
/// stream, never persisted on its own.
#[derive(Clone, Debug, Default)]
pub struct History {
    /// The plain account after replaying every event.
    pub account: BTreeMap<OutPoint, TxOut>,
    /// Per-transaction summaries in reverse chronological order.
    pub events: Vec<TxSummary>,
    pub value: u64,
    pub received: u64,
    pub spent: u64,
}

impl History {
    /// Fold a time-ordered event stream.
    ///
    /// Events belonging to one transaction are grouped wherever they fall
    /// in the stream, so interleaved pending activity folds correctly.
    pub fn from_events(events: Vec<Event>) -> History {
        let mut order: Vec<Txid> = Vec::new();
        let mut groups: BTreeMap<Txid, Vec<Event>> = BTreeMap::new();
        for event in events {
            if !groups.contains_key(&event.txid) {
                order.push(event.txid);
            }
            groups.entry(event.txid).or_default().push(event);
        }

        let mut history = History::default();
        for txid in order {
            let events = groups.remove(&txid).unwrap_or_default();
            let when = events
                .iter()
                .map(|e| e.when)
                .min()
                .unwrap_or(When::Unconfirmed);

            let mut received = 0u64;
            let mut spent = 0u64;
            for event in &events {
                match (&event.direction, &event.put) {
                    (Direction::In, Put::Input(input)) => {
                        history.account.remove(&input.previous_output);
                        spent += event.value;
                    }
                    (Direction::Out, Put::Output(output)) => {
                        history.account.insert(event.point(), output.clone());
                        received += event.value;
                    }
                    // A mislabeled event is a store bug; skip it rather
                    // than corrupt the fold.
                    _ => continue,
                }
            }

            let summary = if received > spent {
                TxSummary {
                    txid,
                    when,
                    received: received - spent,
                    spent: 0,
                    moved: spent,
                    price: None,
                    events,
                }
            } else {
                TxSummary {
                    txid,
                    when,
                    received: 0,
                    spent: spent - received,
                    moved: received,
                    price: None,
                    events,
                }
            };

            history.received += summary.received;
            history.spent += summary.spent;
            history.value += summary.received;
            history.value -= summary.spent;
            history.events.push(summary);
        }

        history.events.reverse();
        history
    }

    /// Fill each confirmed summary's price from the feed, one lookup per
    /// distinct timestamp.
    pub async fn annotate_prices<P: PriceSource>(
        &mut self,
        source: &P,
        unit: MonetaryUnit,
    ) -> Result<()> {
        let mut cache = PriceCache::new();
        for summary in &mut self.events {
            summary.price = match summary.when {
                When::Confirmed(t) => Some(cache.get(source, unit, t).await?),
                When::Unconfirmed => None,
            };
        }
        Ok(())
    }

    /// The latest confirmed timestamp, if any event is confirmed.
    pub fn latest_known(&self) -> Option<u32> {
        self.events
            .iter()
            .filter_map(|summary| match summary.when {
                When::Confirmed(t) => Some(t),
                When::Unconfirmed => None,
            })
            .max()
    }

    /// Summaries within a time range, oldest first.
    pub fn range(&self, from: Option<u32>, to: Option<u32>) -> Vec<&TxSummary> {
        let mut slice: Vec<&TxSummary> = self
            .events
            .iter()
            .filter(|summary| match summary.when {
                When::Confirmed(t) => {
                    from.map_or(true, |f| t >= f) && to.map_or(true, |u| t <= u)
                }
                When::Unconfirmed => to.is_none(),
            })
            .collect();
        slice.reverse();
        slice
    }
}
