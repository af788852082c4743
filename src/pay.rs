//! In-progress payments, both directions: requests we have issued and are
//! waiting to be paid on, and offers we have built but not yet broadcast.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::Signing;
use crate::wallet::account::AccountDiff;

/// A request for payment. The map key it lives under is the textual form
/// of the recipient: an address, a pubkey, or an xpub.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Unix time the request was created.
    pub created: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u32>,
    /// Requested amount in satoshis, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl PaymentRequest {
    pub fn new(created: u32) -> Self {
        PaymentRequest {
            created,
            expires: None,
            amount: None,
            memo: None,
        }
    }

    pub fn expired_at(&self, now: u32) -> bool {
        self.expires.map_or(false, |expiry| now > expiry)
    }
}

/// A request paired with what we will need to redeem the funds once they
/// arrive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub request: PaymentRequest,
    pub redeem: Signing,
}

/// A payment we have constructed but not yet broadcast: the BEEF payload
/// to hand the payee and the diffs it will apply to our account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub request: PaymentRequest,
    /// Serialized BEEF.
    #[serde(with = "hex_bytes")]
    pub transfer: Vec<u8>,
    pub diffs: Vec<AccountDiff>,
}

mod hex_bytes {
    use hex::{DisplayHex, FromHex};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&bytes.to_lower_hex_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        Vec::<u8>::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// The wallet's payment state: open requests keyed by recipient, and
/// outstanding proposals keyed the same way.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payments {
    pub requests: BTreeMap<String, Redemption>,
    pub proposals: BTreeMap<String, Offer>,
}

impl Payments {
    pub fn from_json(json: &str) -> Result<Payments> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidSyntax(format!("reading payments: {e}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("payments serialize to JSON")
    }

    /// Record a new request. The id must be fresh: reusing a recipient
    /// would make incoming payments ambiguous.
    pub fn request(&mut self, id: &str, request: PaymentRequest, redeem: Signing) -> Result<()> {
        if self.requests.contains_key(id) {
            return Err(Error::InvalidSyntax(format!(
                "payment request for {id} already exists"
            )));
        }
        self.requests
            .insert(id.to_owned(), Redemption { request, redeem });
        Ok(())
    }

    /// Proposals whose diffs touch any of the given received outpoints.
    /// These are the payments the other side has accepted and broadcast.
    pub fn completed(&self, received: &BTreeSet<OutPoint>) -> Vec<(String, Vec<Txid>)> {
        let mut done = Vec::new();
        for (id, offer) in &self.proposals {
            let txids: Vec<Txid> = offer
                .diffs
                .iter()
                .filter(|diff| {
                    diff.insert
                        .keys()
                        .any(|index| received.contains(&OutPoint::new(diff.txid, *index)))
                })
                .map(|diff| diff.txid)
                .collect();
            if !txids.is_empty() {
                done.push((id.clone(), txids));
            }
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::{sha256d, Hash};

    use super::*;

    fn txid(n: u8) -> Txid {
        Txid::from_raw_hash(sha256d::Hash::hash(&[n]))
    }

    #[test]
    fn json_round_trip() {
        let mut payments = Payments::default();
        payments
            .request(
                "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2",
                PaymentRequest {
                    created: 1_700_000_000,
                    expires: Some(1_700_086_400),
                    amount: Some(50_000),
                    memo: Some("invoice 7".into()),
                },
                Signing::new(vec![], 107),
            )
            .unwrap();
        let restored = Payments::from_json(&payments.to_json()).unwrap();
        assert_eq!(restored, payments);
    }

    #[test]
    fn duplicate_requests_are_rejected() {
        let mut payments = Payments::default();
        let request = PaymentRequest::new(1);
        payments
            .request("id", request.clone(), Signing::default())
            .unwrap();
        assert!(payments.request("id", request, Signing::default()).is_err());
    }

    #[test]
    fn completion_matches_received_outpoints() {
        let mut payments = Payments::default();
        let mut diff = AccountDiff::new(txid(1));
        diff.insert.insert(0, crate::wallet::account::Redeemable::new(
            bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(100),
                script_pubkey: bitcoin::ScriptBuf::new(),
            },
            Signing::default(),
        ));
        payments.proposals.insert(
            "payee".into(),
            Offer {
                request: PaymentRequest::new(1),
                transfer: vec![0xBE, 0xEF],
                diffs: vec![diff],
            },
        );

        let mut received = BTreeSet::new();
        assert!(payments.completed(&received).is_empty());
        received.insert(OutPoint::new(txid(1), 0));
        let done = payments.completed(&received);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, "payee");
        assert_eq!(done[0].1, vec![txid(1)]);
    }

    #[test]
    fn expiry() {
        let mut request = PaymentRequest::new(100);
        assert!(!request.expired_at(u32::MAX));
        request.expires = Some(200);
        assert!(!request.expired_at(200));
        assert!(request.expired_at(201));
    }
}
