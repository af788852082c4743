//! The production network client: a block explorer's REST API for chain
//! data and a transaction processor for broadcast and fee quotes, over a
//! shared `reqwest` client with bounded retries and internal rate
//! limiting.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use bitcoin::block::Header;
use bitcoin::{BlockHash, Txid};
use hex::{DisplayHex, FromHex};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as ReqwestClient, Response, StatusCode};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::extended::{ExtendedTransaction, SatsPerByte};
use crate::merkle::Bump;
use crate::script::ScriptHash;

use super::types::{
    ChainHeader, FeeQuoteResponse, HistoryItem, SubmitStatus, SubmitTx, TxMerkleProof,
};
use super::{
    BroadcastResult, Broadcaster, ChainSource, MonetaryUnit, NetResult, NetworkError, PriceSource,
};

/// The maximum number of retries for a request.
const DEFAULT_MAX_RETRIES: u8 = 3;

/// Interval between retries in ms.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Minimum spacing between any two requests to the same provider.
const DEFAULT_MIN_REQUEST_INTERVAL_MS: u64 = 50;

/// Where the client points.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Block explorer REST base, e.g. `https://api.whatsonchain.com/v1/bsv/main`.
    pub explorer_url: String,
    /// Transaction processor base, e.g. `https://arc.taal.com`.
    pub processor_url: String,
    /// Price feed base.
    pub price_url: String,
    /// Basic-auth credentials for the explorer, if it requires them.
    pub explorer_auth: Option<(String, String)>,
    /// Bearer token for the processor, if it requires one.
    pub processor_token: Option<String>,
    pub max_retries: u8,
    pub retry_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            explorer_url: "https://api.whatsonchain.com/v1/bsv/main".into(),
            processor_url: "https://arc.taal.com".into(),
            price_url: "https://api.whatsonchain.com/v1/bsv/main".into(),
            explorer_auth: None,
            processor_token: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            timeout_ms: 30_000,
        }
    }
}

/// The production implementation of [`ChainSource`], [`Broadcaster`], and
/// [`PriceSource`].
#[derive(Clone)]
pub struct Network {
    config: NetworkConfig,
    client: ReqwestClient,
    /// Rate limiter: the earliest instant the next request may go out.
    next_slot: Arc<Mutex<Instant>>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> NetResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            "application/json"
                .parse()
                .map_err(|_| NetworkError::Other("error parsing header".into()))?,
        );
        if let Some((user, password)) = &config.explorer_auth {
            let user_pw = general_purpose::STANDARD.encode(format!("{user}:{password}"));
            headers.insert(
                AUTHORIZATION,
                format!("Basic {user_pw}")
                    .parse()
                    .map_err(|_| NetworkError::Other("error parsing header".into()))?,
            );
        }
        if let Some(token) = &config.processor_token {
            headers.insert(
                AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| NetworkError::Other("error parsing header".into()))?,
            );
        }
        let client = ReqwestClient::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NetworkError::Other(format!("could not create client: {e}")))?;
        trace!(explorer = %config.explorer_url, processor = %config.processor_url, "created network client");
        Ok(Network {
            config,
            client,
            next_slot: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// Wait for the next request slot. The core never spins on quota;
    /// spacing requests here keeps providers from throttling us.
    async fn rate_limit(&self) {
        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        if *slot > now {
            sleep(*slot - now).await;
        }
        *slot = Instant::now() + Duration::from_millis(DEFAULT_MIN_REQUEST_INTERVAL_MS);
    }

    fn classify(e: reqwest::Error) -> NetworkError {
        if e.is_timeout() {
            NetworkError::Timeout
        } else if e.is_connect() {
            NetworkError::Connection(e.to_string())
        } else if e.is_decode() {
            NetworkError::Parse(e.to_string())
        } else {
            NetworkError::Other(e.to_string())
        }
    }

    /// GET with retries. `Ok(None)` is a 404.
    async fn get(&self, url: &str) -> NetResult<Option<Response>> {
        let mut retries = 0;
        loop {
            self.rate_limit().await;
            trace!(%url, %retries, "GET");
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(NetworkError::Inauthenticated);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(%url, %status, "retryable status");
                    } else if !status.is_success() {
                        return Err(NetworkError::Status(status.as_u16(), status.to_string()));
                    } else {
                        return Ok(Some(response));
                    }
                }
                Err(e) => {
                    let classified = Self::classify(e);
                    match classified {
                        NetworkError::Timeout | NetworkError::Connection(_) => {
                            warn!(%url, error = %classified, "retrying");
                        }
                        other => return Err(other),
                    }
                }
            }
            retries += 1;
            if retries >= self.config.max_retries {
                return Err(NetworkError::MaxRetriesExceeded(self.config.max_retries));
            }
            sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> NetResult<Option<T>> {
        match self.get(url).await? {
            None => Ok(None),
            Some(response) => Ok(Some(
                response
                    .json::<T>()
                    .await
                    .map_err(|e| NetworkError::Parse(e.to_string()))?,
            )),
        }
    }

    fn explorer(&self, path: &str) -> String {
        format!("{}{path}", self.config.explorer_url)
    }

    fn processor(&self, path: &str) -> String {
        format!("{}{path}", self.config.processor_url)
    }

    fn history_txids(items: Vec<HistoryItem>) -> NetResult<Vec<Txid>> {
        items
            .into_iter()
            .map(|item| {
                item.tx_hash
                    .parse::<Txid>()
                    .map_err(|e| NetworkError::Parse(format!("tx_hash: {e}")))
            })
            .collect()
    }

    fn interpret_submit(status: StatusCode, body: SubmitStatus) -> BroadcastResult {
        let details = serde_json::to_value(&body).ok();
        if status.is_success() {
            match body.tx_status.as_deref() {
                // Double spends and rejections arrive with a 200 and a
                // status string.
                Some(s) if s.contains("REJECTED") || s.contains("DOUBLE_SPEND") => {
                    BroadcastResult::Invalid { details }
                }
                _ => BroadcastResult::Success,
            }
        } else {
            match status.as_u16() {
                401 | 403 => BroadcastResult::Inauthenticated,
                // Fee too low has its own code at the processor.
                465 => BroadcastResult::InsufficientFee { details },
                460..=469 => BroadcastResult::Invalid { details },
                code if (400..500).contains(&code) => BroadcastResult::Invalid { details },
                code => BroadcastResult::Unknown(format!("status {code}")),
            }
        }
    }

    async fn submit_one(&self, tx: &ExtendedTransaction) -> NetResult<BroadcastResult> {
        self.rate_limit().await;
        let body = SubmitTx {
            raw_tx: tx.to_bytes().to_lower_hex_string(),
        };
        let response = self
            .client
            .post(self.processor("/v1/tx"))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;
        let status = response.status();
        let parsed: SubmitStatus = response
            .json()
            .await
            .map_err(|e| NetworkError::Parse(e.to_string()))?;
        trace!(txid = %tx.txid(), %status, tx_status = ?parsed.tx_status, "submit result");
        Ok(Self::interpret_submit(status, parsed))
    }
}

impl ChainSource for Network {
    async fn fetch_tx(&self, txid: &Txid) -> NetResult<Option<Vec<u8>>> {
        let url = self.explorer(&format!("/tx/{txid}/hex"));
        match self.get(&url).await? {
            None => Ok(None),
            Some(response) => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| NetworkError::Parse(e.to_string()))?;
                let bytes = Vec::<u8>::from_hex(text.trim())
                    .map_err(|e| NetworkError::Parse(format!("tx hex: {e}")))?;
                Ok(Some(bytes))
            }
        }
    }

    async fn fetch_header_by_hash(&self, hash: &BlockHash) -> NetResult<Option<(u64, Header)>> {
        let url = self.explorer(&format!("/block/hash/{hash}/header"));
        match self.get_json::<ChainHeader>(&url).await? {
            None => Ok(None),
            Some(reported) => Ok(Some((reported.height, reported.header()?))),
        }
    }

    async fn fetch_header_by_height(&self, height: u64) -> NetResult<Option<Header>> {
        let url = self.explorer(&format!("/block/height/{height}/header"));
        match self.get_json::<ChainHeader>(&url).await? {
            None => Ok(None),
            Some(reported) => Ok(Some(reported.header()?)),
        }
    }

    async fn fetch_merkle_proof(&self, txid: &Txid) -> NetResult<Option<(BlockHash, Bump)>> {
        let url = self.explorer(&format!("/tx/{txid}/proof/tsc"));
        let proof = match self.get_json::<Option<TxMerkleProof>>(&url).await? {
            None | Some(None) => return Ok(None),
            Some(Some(proof)) => proof,
        };
        let block_hash = proof
            .target
            .parse::<BlockHash>()
            .map_err(|e| NetworkError::Parse(format!("proof target: {e}")))?;
        // The proof alone does not know its height; resolve it through
        // the header.
        let (height, _) = match self.fetch_header_by_hash(&block_hash).await? {
            Some(found) => found,
            None => return Ok(None),
        };
        let nodes: Vec<Option<bitcoin::TxMerkleNode>> = proof
            .nodes
            .iter()
            .map(|node| {
                if node == "*" {
                    Ok(None)
                } else {
                    node.parse()
                        .map(Some)
                        .map_err(|e| NetworkError::Parse(format!("proof node: {e}")))
                }
            })
            .collect::<NetResult<_>>()?;
        let bump = Bump::from_branch_nodes(height, proof.index, txid, &nodes)
            .map_err(|e| NetworkError::Parse(format!("proof: {e}")))?;
        Ok(Some((block_hash, bump)))
    }

    async fn fetch_address_history(&self, address: &str) -> NetResult<Vec<Txid>> {
        let url = self.explorer(&format!("/address/{address}/history"));
        match self.get_json::<Vec<HistoryItem>>(&url).await? {
            None => Ok(Vec::new()),
            Some(items) => Self::history_txids(items),
        }
    }

    async fn fetch_script_history(&self, hash: &ScriptHash) -> NetResult<Vec<Txid>> {
        let url = self.explorer(&format!("/script/{hash:x}/history"));
        match self.get_json::<Vec<HistoryItem>>(&url).await? {
            None => Ok(Vec::new()),
            Some(items) => Self::history_txids(items),
        }
    }
}

impl Broadcaster for Network {
    async fn submit(&self, tx: &ExtendedTransaction) -> NetResult<BroadcastResult> {
        self.submit_one(tx).await
    }

    async fn submit_batch(
        &self,
        txs: &[ExtendedTransaction],
    ) -> NetResult<Vec<(Txid, BroadcastResult)>> {
        // One at a time keeps the per-tx outcomes unambiguous; the
        // processor's batch endpoint reorders results.
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            let outcome = self.submit_one(tx).await?;
            results.push((tx.txid(), outcome));
        }
        Ok(results)
    }

    async fn fee_quote(&self) -> NetResult<SatsPerByte> {
        let url = self.processor("/v1/policy");
        match self.get_json::<FeeQuoteResponse>(&url).await? {
            None => Err(NetworkError::Status(404, "no fee policy".into())),
            Some(quote) => Ok(SatsPerByte::new(
                quote.policy.mining_fee.satoshis,
                quote.policy.mining_fee.bytes,
            )),
        }
    }
}

impl PriceSource for Network {
    async fn fiat_price(&self, unit: MonetaryUnit, _timestamp: u32) -> NetResult<f64> {
        // Providers quote the present price; the caller caches per
        // timestamp.
        let MonetaryUnit::Usd = unit;
        let url = format!("{}/exchangerate", self.config.price_url);
        #[derive(serde::Deserialize)]
        struct ExchangeRate {
            rate: f64,
        }
        match self.get_json::<ExchangeRate>(&url).await? {
            None => Err(NetworkError::Status(404, "no exchange rate".into())),
            Some(quote) => Ok(quote.rate),
        }
    }
}
