//! Invoice lifecycle abstraction over the Lightning payment backend.
//!
//! The gate only ever needs two operations from the backend: create an
//! invoice for an amount, and report whether a known invoice has settled.
//! [`InvoiceProvider`] captures that narrow contract; [`LnbitsProvider`]
//! implements it against a live LNbits instance over HTTPS, and
//! [`MockProvider`] implements it against a local simulated ledger for tests
//! and development. The two are interchangeable behind the trait; the only
//! caller-visible difference is the mock's preimage accessor, which exists
//! on the concrete type and is never exposed over the network.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::instrument;
use url::Url;

use crate::types::{AmountSats, Invoice, PaymentHash, Preimage};

/// Default bound on backend round trips. The store lock is never held while
/// one of these calls is in flight.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure talking to the payment backend. Invoice creation fails closed:
/// any network or parse error surfaces as `Unavailable` and no challenge is
/// issued.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Payment backend unavailable: {0}")]
    Unavailable(String),
}

/// Narrow contract to the Lightning payment backend.
#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    /// Requests a new invoice for `amount_sats` with a human-readable memo.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the backend cannot be
    /// reached or returns an unparseable response.
    async fn create_invoice(
        &self,
        amount_sats: AmountSats,
        memo: &str,
    ) -> Result<Invoice, BackendError>;

    /// Whether the backend reports the invoice as settled.
    ///
    /// Errors degrade to `false`: a status check is a weaker fallback proof,
    /// never grounds for granting access on its own failure path.
    async fn is_paid(&self, payment_hash: &PaymentHash) -> bool;
}

#[async_trait]
impl<T: InvoiceProvider> InvoiceProvider for Arc<T> {
    async fn create_invoice(
        &self,
        amount_sats: AmountSats,
        memo: &str,
    ) -> Result<Invoice, BackendError> {
        self.as_ref().create_invoice(amount_sats, memo).await
    }

    async fn is_paid(&self, payment_hash: &PaymentHash) -> bool {
        self.as_ref().is_paid(payment_hash).await
    }
}

/// Live LNbits client.
///
/// Uses the admin key to create invoices (`POST /api/v1/payments`) and the
/// invoice/read key to check settlement (`GET /api/v1/payments/{hash}`).
#[derive(Debug, Clone)]
pub struct LnbitsProvider {
    client: reqwest::Client,
    base_url: Url,
    admin_key: String,
    invoice_key: String,
}

#[derive(Debug, Deserialize)]
struct LnbitsCreateResponse {
    payment_hash: PaymentHash,
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct LnbitsStatusResponse {
    #[serde(default)]
    paid: bool,
}

impl LnbitsProvider {
    pub fn new(
        base_url: Url,
        admin_key: String,
        invoice_key: String,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            admin_key,
            invoice_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Unavailable(format!("Invalid backend url: {e}")))
    }
}

#[async_trait]
impl InvoiceProvider for LnbitsProvider {
    #[instrument(skip_all, fields(amount = %amount_sats))]
    async fn create_invoice(
        &self,
        amount_sats: AmountSats,
        memo: &str,
    ) -> Result<Invoice, BackendError> {
        let url = self.endpoint("api/v1/payments")?;
        let body = json!({
            "out": false,
            "amount": amount_sats.0,
            "memo": memo,
            "unit": "sat",
        });
        let response = self
            .client
            .post(url)
            .header("X-Api-Key", &self.admin_key)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(error = %e, "LNbits invoice creation failed");
                BackendError::Unavailable(e.to_string())
            })?;
        let created: LnbitsCreateResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "LNbits invoice response unparseable");
            BackendError::Unavailable(e.to_string())
        })?;
        Ok(Invoice {
            payment_hash: created.payment_hash,
            payment_request: created.payment_request,
            amount_sats,
        })
    }

    #[instrument(skip_all, fields(payment_hash = %payment_hash))]
    async fn is_paid(&self, payment_hash: &PaymentHash) -> bool {
        let url = match self.endpoint(&format!("api/v1/payments/{payment_hash}")) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let response = self
            .client
            .get(url)
            .header("X-Api-Key", &self.invoice_key)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match response {
            Ok(response) => match response.json::<LnbitsStatusResponse>().await {
                Ok(status) => status.paid,
                Err(e) => {
                    tracing::error!(error = %e, "LNbits status response unparseable");
                    false
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "LNbits payment check failed");
                false
            }
        }
    }
}

#[derive(Debug)]
struct MockEntry {
    preimage: Preimage,
    paid: bool,
}

/// Simulated backend for tests and mock mode.
///
/// Invoices are derived deterministically from the memo and the current
/// time: a preimage is generated first and hashed, so the cryptographic
/// proof path (`sha256(preimage) == payment_hash`) works end to end without
/// a Lightning node. Settlement is recorded in a local ledger via
/// [`MockProvider::settle`].
#[derive(Debug, Default)]
pub struct MockProvider {
    ledger: Mutex<HashMap<PaymentHash, MockEntry>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The preimage matching an invoice issued by this mock. Test-harness
    /// accessor standing in for the payer's wallet; never served over HTTP.
    pub fn preimage_for(&self, payment_hash: &PaymentHash) -> Option<Preimage> {
        let ledger = self.ledger.lock().expect("mock ledger poisoned");
        ledger.get(payment_hash).map(|e| e.preimage.clone())
    }

    /// Marks an invoice as settled in the simulated ledger.
    pub fn settle(&self, payment_hash: &PaymentHash) {
        let mut ledger = self.ledger.lock().expect("mock ledger poisoned");
        if let Some(entry) = ledger.get_mut(payment_hash) {
            entry.paid = true;
        }
    }
}

#[async_trait]
impl InvoiceProvider for MockProvider {
    async fn create_invoice(
        &self,
        amount_sats: AmountSats,
        memo: &str,
    ) -> Result<Invoice, BackendError> {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?
            .as_nanos();
        let seed: [u8; 32] = Sha256::digest(format!("{memo}{nanos}").as_bytes()).into();
        let preimage = Preimage::from_bytes(seed.to_vec());
        let payment_hash = preimage.payment_hash();
        let payment_request = format!("lnbc{}n1mock_{}", amount_sats.0, &payment_hash.to_hex()[..20]);
        let mut ledger = self.ledger.lock().expect("mock ledger poisoned");
        ledger.insert(
            payment_hash,
            MockEntry {
                preimage,
                paid: false,
            },
        );
        Ok(Invoice {
            payment_hash,
            payment_request,
            amount_sats,
        })
    }

    async fn is_paid(&self, payment_hash: &PaymentHash) -> bool {
        let ledger = self.ledger.lock().expect("mock ledger poisoned");
        ledger.get(payment_hash).map(|e| e.paid).unwrap_or(false)
    }
}
