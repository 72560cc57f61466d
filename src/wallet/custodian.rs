//! Custodial transfer provider client.
//!
//! The provider is an opaque network service with its own availability
//! semantics; every call here can fail and callers must treat failures as
//! `ExternalServiceUnavailable`. The mock adapter exists so settlement
//! tests can run multiple isolated instances with deterministic outcomes.

use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodialAccount {
    pub account_id: String,
    pub deposit_address: String,
}

#[async_trait]
pub trait CustodialProvider: Send + Sync {
    /// Provision a deposit account for a user.
    async fn create_account(&self, user_id: i64) -> EngineResult<CustodialAccount>;

    /// Current balance of a custodial account, in micro-units.
    async fn account_balance(&self, account_id: &str) -> EngineResult<i64>;

    /// Execute an outbound transfer. Returns the provider's transfer id.
    async fn transfer(
        &self,
        from_account: &str,
        destination: &str,
        amount_micro: i64,
    ) -> EngineResult<String>;

    /// Consolidate funds from a deposit address into the hot account.
    async fn sweep_to_hot(&self, source_address: &str, amount_micro: i64) -> EngineResult<String>;
}

// --- HTTP implementation ---------------------------------------------------

pub struct HttpCustodian {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    hot_account: String,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    from_account: &'a str,
    destination: &'a str,
    amount_micro: i64,
}

#[derive(Deserialize)]
struct TransferResponse {
    transfer_id: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance_micro: i64,
}

impl HttpCustodian {
    pub fn new(base_url: String, api_key: Option<String>, hot_account: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url,
            api_key,
            hot_account,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    fn unavailable(context: &str, err: impl std::fmt::Display) -> EngineError {
        EngineError::ExternalServiceUnavailable(format!("{context}: {err}"))
    }
}

#[async_trait]
impl CustodialProvider for HttpCustodian {
    async fn create_account(&self, user_id: i64) -> EngineResult<CustodialAccount> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/accounts")
            .json(&serde_json::json!({ "external_ref": user_id.to_string() }))
            .send()
            .await
            .map_err(|e| Self::unavailable("custodian create_account", e))?
            .error_for_status()
            .map_err(|e| Self::unavailable("custodian create_account", e))?;
        resp.json()
            .await
            .map_err(|e| Self::unavailable("custodian create_account decode", e))
    }

    async fn account_balance(&self, account_id: &str) -> EngineResult<i64> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{account_id}/balance"),
            )
            .send()
            .await
            .map_err(|e| Self::unavailable("custodian balance", e))?
            .error_for_status()
            .map_err(|e| Self::unavailable("custodian balance", e))?;
        let body: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| Self::unavailable("custodian balance decode", e))?;
        Ok(body.balance_micro)
    }

    async fn transfer(
        &self,
        from_account: &str,
        destination: &str,
        amount_micro: i64,
    ) -> EngineResult<String> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/transfers")
            .json(&TransferRequest {
                from_account,
                destination,
                amount_micro,
            })
            .send()
            .await
            .map_err(|e| Self::unavailable("custodian transfer", e))?
            .error_for_status()
            .map_err(|e| Self::unavailable("custodian transfer", e))?;
        let body: TransferResponse = resp
            .json()
            .await
            .map_err(|e| Self::unavailable("custodian transfer decode", e))?;
        Ok(body.transfer_id)
    }

    async fn sweep_to_hot(&self, source_address: &str, amount_micro: i64) -> EngineResult<String> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/sweeps")
            .json(&serde_json::json!({
                "source_address": source_address,
                "destination_account": self.hot_account,
                "amount_micro": amount_micro,
            }))
            .send()
            .await
            .map_err(|e| Self::unavailable("custodian sweep", e))?
            .error_for_status()
            .map_err(|e| Self::unavailable("custodian sweep", e))?;
        let body: TransferResponse = resp
            .json()
            .await
            .map_err(|e| Self::unavailable("custodian sweep decode", e))?;
        Ok(body.transfer_id)
    }
}

// --- mock implementation for tests -----------------------------------------

/// Deterministic in-memory custodian. Optional latency jitter makes
/// concurrency tests exercise real interleavings; `fail_transfers` flips
/// every transfer into an outage.
pub struct MockCustodian {
    next_id: AtomicU64,
    pub balances: Mutex<HashMap<String, i64>>,
    pub transfers: Mutex<Vec<(String, String, i64)>>,
    pub sweeps: Mutex<Vec<(String, i64)>>,
    pub fail_transfers: Mutex<bool>,
    pub fail_sweeps: Mutex<bool>,
    latency_jitter_ms: u64,
}

impl MockCustodian {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            balances: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            sweeps: Mutex::new(Vec::new()),
            fail_transfers: Mutex::new(false),
            fail_sweeps: Mutex::new(false),
            latency_jitter_ms: 0,
        }
    }

    pub fn with_jitter(mut self, ms: u64) -> Self {
        self.latency_jitter_ms = ms;
        self
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        *self.fail_transfers.lock() = fail;
    }

    pub fn set_fail_sweeps(&self, fail: bool) {
        *self.fail_sweeps.lock() = fail;
    }

    async fn simulate_latency(&self) {
        if self.latency_jitter_ms > 0 {
            let ms = rand::thread_rng().gen_range(0..self.latency_jitter_ms);
            sleep(Duration::from_millis(ms)).await;
        }
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MockCustodian {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CustodialProvider for MockCustodian {
    async fn create_account(&self, user_id: i64) -> EngineResult<CustodialAccount> {
        self.simulate_latency().await;
        let account_id = self.next("acct");
        let deposit_address = format!("addr-{user_id}");
        self.balances.lock().insert(account_id.clone(), 0);
        debug!(user_id, account_id = %account_id, "mock custodial account created");
        Ok(CustodialAccount {
            account_id,
            deposit_address,
        })
    }

    async fn account_balance(&self, account_id: &str) -> EngineResult<i64> {
        self.simulate_latency().await;
        Ok(*self.balances.lock().get(account_id).unwrap_or(&0))
    }

    async fn transfer(
        &self,
        from_account: &str,
        destination: &str,
        amount_micro: i64,
    ) -> EngineResult<String> {
        self.simulate_latency().await;
        if *self.fail_transfers.lock() {
            return Err(EngineError::ExternalServiceUnavailable(
                "mock custodian transfer outage".into(),
            ));
        }
        self.transfers
            .lock()
            .push((from_account.to_string(), destination.to_string(), amount_micro));
        Ok(self.next("xfer"))
    }

    async fn sweep_to_hot(&self, source_address: &str, amount_micro: i64) -> EngineResult<String> {
        self.simulate_latency().await;
        if *self.fail_sweeps.lock() {
            return Err(EngineError::ExternalServiceUnavailable(
                "mock custodian sweep outage".into(),
            ));
        }
        self.sweeps
            .lock()
            .push((source_address.to_string(), amount_micro));
        Ok(self.next("sweep"))
    }
}
