//! Public-ledger read-only RPC client.
//!
//! Two operations back the deposit monitor: listing transfer signatures for
//! a tracked address newer than a cursor, and resolving one signature into
//! the balance delta it produced for that address (token-account
//! post-balance minus pre-balance).

use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct TransferDetail {
    pub signature: String,
    pub source_address: Option<String>,
    /// Balance change for the tracked account in micro-units. Negative or
    /// zero deltas are outbound/noise and are skipped by the monitor.
    pub delta_micro: i64,
}

#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Signatures touching `address`, newest first, stopping at `until`
    /// (exclusive) when given. `limit` bounds the page.
    async fn signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<String>>;

    /// Resolve one signature. `None` when the transaction does not touch
    /// the tracked address's token balance.
    async fn transfer_detail(
        &self,
        signature: &str,
        address: &str,
    ) -> EngineResult<Option<TransferDetail>>;
}

// --- HTTP JSON-RPC implementation ------------------------------------------

pub struct HttpLedgerRpc {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SignatureEntry {
    signature: String,
}

#[derive(Deserialize)]
struct TxResult {
    transaction: TxBody,
    meta: TxMeta,
}

#[derive(Deserialize)]
struct TxBody {
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct TxMeta {
    #[serde(default)]
    pre_balances: HashMap<String, i64>,
    #[serde(default)]
    post_balances: HashMap<String, i64>,
}

impl HttpLedgerRpc {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self { client, url }
    }

    /// One JSON-RPC round trip. A null/absent `result` is a legitimate
    /// answer (unknown transaction), not a transport failure.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> EngineResult<Option<T>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ExternalServiceUnavailable(format!("ledger rpc: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::ExternalServiceUnavailable(format!("ledger rpc: {e}")))?;
        let envelope: RpcEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| EngineError::ExternalServiceUnavailable(format!("ledger rpc decode: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(EngineError::ExternalServiceUnavailable(format!(
                "ledger rpc {method}: {err}"
            )));
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerRpc {
    async fn signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let mut opts = json!({ "limit": limit });
        if let Some(until) = until {
            opts["until"] = json!(until);
        }
        let entries: Vec<SignatureEntry> = self
            .call("getSignaturesForAddress", json!([address, opts]))
            .await?
            .unwrap_or_default();
        Ok(entries.into_iter().map(|e| e.signature).collect())
    }

    async fn transfer_detail(
        &self,
        signature: &str,
        address: &str,
    ) -> EngineResult<Option<TransferDetail>> {
        let tx: Option<TxResult> = self.call("getTransaction", json!([signature])).await?;
        let Some(tx) = tx else {
            return Ok(None);
        };
        let pre = tx.meta.pre_balances.get(address).copied();
        let post = tx.meta.post_balances.get(address).copied();
        match (pre, post) {
            (Some(pre), Some(post)) => Ok(Some(TransferDetail {
                signature: signature.to_string(),
                source_address: tx.transaction.source,
                delta_micro: post - pre,
            })),
            _ => Ok(None),
        }
    }
}

// --- in-memory mock ---------------------------------------------------------

/// Scriptable ledger for tests: push transfers per address, the monitor
/// reads them back through the same trait the HTTP client implements.
#[derive(Default)]
pub struct MockLedger {
    // Per address, oldest first.
    transfers: Mutex<HashMap<String, Vec<TransferDetail>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_transfer(&self, address: &str, detail: TransferDetail) {
        self.transfers
            .lock()
            .entry(address.to_string())
            .or_default()
            .push(detail);
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let transfers = self.transfers.lock();
        let Some(list) = transfers.get(address) else {
            return Ok(Vec::new());
        };
        // Newest first, stopping before the cursor.
        let mut out = Vec::new();
        for detail in list.iter().rev() {
            if Some(detail.signature.as_str()) == until {
                break;
            }
            out.push(detail.signature.clone());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn transfer_detail(
        &self,
        signature: &str,
        address: &str,
    ) -> EngineResult<Option<TransferDetail>> {
        let transfers = self.transfers.lock();
        Ok(transfers
            .get(address)
            .and_then(|list| list.iter().find(|d| d.signature == signature))
            .cloned())
    }
}
