//! Orchestration of the L402 challenge/redeem flow.
//!
//! [`AccessGate`] composes the catalog, the invoice provider, the payment
//! store, and the token codec. A request without a credential gets a
//! challenge (invoice + freshly minted token); a retry presenting
//! `L402 {token}:{preimage}` gets verified and, on success, the caller is
//! told to serve the underlying content.

use std::sync::Arc;
use tracing::instrument;

use crate::catalog::{Catalog, ResourceEntry};
use crate::invoice::{BackendError, InvoiceProvider};
use crate::store::{PaymentStore, StoreError};
use crate::token::{TOKEN_TTL, TokenCodec, VerifyError};
use crate::types::{AmountSats, Invoice, PaymentHash, PaymentRecord, ResourceId};

/// Everything that can go wrong between a resource request and a grant.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The requested id is not in the catalog.
    #[error("Resource not found")]
    ResourceNotFound,
    /// Invoice creation failed; the challenge cannot be issued.
    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),
    /// The presented credential failed verification.
    #[error(transparent)]
    Verification(#[from] VerifyError),
    /// The token is valid but bound to a different resource. A token minted
    /// for a cheap resource must not unlock an expensive one.
    #[error("Token not valid for this resource")]
    ResourceMismatch,
    /// The pending record could not be durably written; issuing the
    /// challenge anyway would leave an untrackable invoice.
    #[error(transparent)]
    StorePersistence(#[from] StoreError),
}

/// A 402 challenge: pay the invoice, then retry with the token and the
/// revealed preimage.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub entry: ResourceEntry,
    pub invoice: Invoice,
    pub token: String,
}

impl Challenge {
    /// `WWW-Authenticate` value advertising both the token and the invoice.
    pub fn www_authenticate(&self) -> String {
        format!(
            r#"L402 token="{}", invoice="{}""#,
            self.token, self.invoice.payment_request
        )
    }
}

/// A verified redemption: the caller may serve the resource.
#[derive(Debug, Clone)]
pub struct Grant {
    pub entry: ResourceEntry,
    pub payment_hash: PaymentHash,
}

/// Combined live-plus-stored view of one payment, for the status endpoint.
#[derive(Debug, Clone)]
pub struct PaymentStatus {
    pub payment_hash: PaymentHash,
    pub paid: bool,
    pub resource_id: Option<ResourceId>,
    pub amount_sats: Option<AmountSats>,
}

/// Aggregate counters over unexpired payment records.
#[derive(Debug, Clone, Copy)]
pub struct GateStats {
    pub total_resources: usize,
    pub settled_payments: usize,
    pub settled_sats: u64,
}

/// The payment-gated access-control core.
pub struct AccessGate {
    catalog: Arc<Catalog>,
    provider: Arc<dyn InvoiceProvider>,
    store: Arc<PaymentStore>,
    codec: TokenCodec,
}

impl AccessGate {
    pub fn new(
        catalog: Arc<Catalog>,
        provider: Arc<dyn InvoiceProvider>,
        store: Arc<PaymentStore>,
        codec: TokenCodec,
    ) -> Self {
        Self {
            catalog,
            provider,
            store,
            codec,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &PaymentStore {
        &self.store
    }

    /// Issues a payment challenge for `resource_id`.
    ///
    /// The invoice is created before any store mutation and without holding
    /// the store lock; the pending record is written only once the backend
    /// call has returned. Concurrent challenges for the same resource each
    /// get their own invoice and record.
    ///
    /// # Errors
    ///
    /// [`GateError::ResourceNotFound`] for an unknown id (the catalog is
    /// consulted first, so nothing is created or stored),
    /// [`GateError::BackendUnavailable`] if invoice creation fails, and
    /// [`GateError::StorePersistence`] if the pending record cannot be
    /// flushed, in which case the challenge is withheld.
    #[instrument(skip(self), err)]
    pub async fn challenge(&self, resource_id: &str) -> Result<Challenge, GateError> {
        let resource_id = ResourceId::new(resource_id);
        let entry = self
            .catalog
            .get(&resource_id)
            .ok_or(GateError::ResourceNotFound)?
            .clone();

        let memo = format!("Resource {}: {}", entry.id, entry.title);
        let invoice = self.provider.create_invoice(entry.price_sats, &memo).await?;

        let record = PaymentRecord::pending(resource_id.clone(), entry.price_sats);
        self.store.put(invoice.payment_hash, record).await?;

        let token = self.codec.mint(&invoice.payment_hash, &resource_id);
        tracing::info!(
            resource_id = %resource_id,
            payment_hash = %invoice.payment_hash,
            amount = %invoice.amount_sats,
            "Issued payment challenge"
        );
        Ok(Challenge {
            entry,
            invoice,
            token,
        })
    }

    /// Redeems an `Authorization` header against `resource_id`.
    ///
    /// The header must be `"L402 {token}:{preimage_hex}"`. A missing or
    /// structurally broken credential fails exactly like a malformed token;
    /// the caller maps both to a 401, never a 500.
    ///
    /// # Errors
    ///
    /// [`GateError::ResourceNotFound`] for an unknown id,
    /// [`GateError::Verification`] for any codec rejection, and
    /// [`GateError::ResourceMismatch`] when the token is valid but bound to
    /// another resource.
    #[instrument(skip(self, authorization), err(level = "debug"))]
    pub async fn redeem(
        &self,
        resource_id: &str,
        authorization: &str,
    ) -> Result<Grant, GateError> {
        let resource_id = ResourceId::new(resource_id);
        let entry = self
            .catalog
            .get(&resource_id)
            .ok_or(GateError::ResourceNotFound)?
            .clone();

        let credential = authorization
            .strip_prefix("L402 ")
            .ok_or(VerifyError::MalformedToken)?;
        let verified = self
            .codec
            .verify(credential, &self.store, self.provider.as_ref())
            .await?;

        if verified.resource_id != resource_id {
            tracing::warn!(
                requested = %resource_id,
                bound = %verified.resource_id,
                "Token presented against a different resource"
            );
            return Err(GateError::ResourceMismatch);
        }

        // Best effort: the grant already stands on the verified proof.
        if let Err(e) = self.store.mark_paid(&verified.payment_hash).await {
            tracing::error!(error = %e, payment_hash = %verified.payment_hash, "Failed to persist paid flag");
        }
        tracing::info!(
            resource_id = %resource_id,
            payment_hash = %verified.payment_hash,
            "Payment verified, granting access"
        );
        Ok(Grant {
            entry,
            payment_hash: verified.payment_hash,
        })
    }

    /// Live-plus-stored status for one payment hash.
    pub async fn payment_status(&self, payment_hash: &PaymentHash) -> PaymentStatus {
        let record = self.store.get(payment_hash).await;
        let backend_paid = self.provider.is_paid(payment_hash).await;
        let stored_paid = record.as_ref().map(|r| r.paid).unwrap_or(false);
        PaymentStatus {
            payment_hash: *payment_hash,
            paid: backend_paid || stored_paid,
            resource_id: record.as_ref().map(|r| r.resource_id.clone()),
            amount_sats: record.map(|r| r.amount_sats),
        }
    }

    /// Aggregate stats over unexpired records. Sweeps expired records first,
    /// opportunistically; a failed sweep only logs.
    pub async fn stats(&self) -> GateStats {
        match self.store.delete_older_than(TOKEN_TTL).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Swept expired payment records"),
            Err(e) => tracing::warn!(error = %e, "Opportunistic sweep failed"),
        }
        let snapshot = self.store.snapshot().await;
        let settled: Vec<_> = snapshot.iter().filter(|(_, r)| r.paid).collect();
        GateStats {
            total_resources: self.catalog.len(),
            settled_payments: settled.len(),
            settled_sats: settled.iter().map(|(_, r)| r.amount_sats.0).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::MockProvider;
    use crate::types::Preimage;

    struct Fixture {
        _dir: tempfile::TempDir,
        gate: AccessGate,
        provider: Arc<MockProvider>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PaymentStore::open(dir.path().join("payments.json")));
        let provider = Arc::new(MockProvider::new());
        let gate = AccessGate::new(
            Arc::new(Catalog::builtin()),
            Arc::clone(&provider) as Arc<dyn InvoiceProvider>,
            store,
            TokenCodec::new(b"gate-secret".to_vec()),
        );
        Fixture {
            _dir: dir,
            gate,
            provider,
        }
    }

    fn credential(token: &str, preimage: &Preimage) -> String {
        format!("L402 {token}:{}", preimage.to_hex())
    }

    #[tokio::test]
    async fn challenge_records_pending_payment() {
        let f = fixture();
        let challenge = f.gate.challenge("k01").await.unwrap();
        assert_eq!(challenge.invoice.amount_sats, AmountSats(50));
        assert_eq!(challenge.entry.id, ResourceId::new("K01"));
        let header = challenge.www_authenticate();
        assert!(header.starts_with("L402 token=\""));
        assert!(header.contains("invoice=\"lnbc50n1mock_"));

        let record = f.gate.store().get(&challenge.invoice.payment_hash).await.unwrap();
        assert_eq!(record.resource_id, ResourceId::new("K01"));
        assert!(!record.paid);
    }

    #[tokio::test]
    async fn unknown_resource_creates_nothing() {
        let f = fixture();
        let err = f.gate.challenge("Z99").await.unwrap_err();
        assert!(matches!(err, GateError::ResourceNotFound));
        assert!(f.gate.store().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn full_challenge_redeem_flow() {
        let f = fixture();
        let challenge = f.gate.challenge("K01").await.unwrap();
        let preimage = f
            .provider
            .preimage_for(&challenge.invoice.payment_hash)
            .unwrap();

        let grant = f
            .gate
            .redeem("k01", &credential(&challenge.token, &preimage))
            .await
            .unwrap();
        assert_eq!(grant.payment_hash, challenge.invoice.payment_hash);
        assert_eq!(grant.entry.id, ResourceId::new("K01"));
        assert!(f.gate.store().get(&grant.payment_hash).await.unwrap().paid);
    }

    #[tokio::test]
    async fn token_bound_to_other_resource_is_rejected() {
        let f = fixture();
        let challenge = f.gate.challenge("K01").await.unwrap();
        let preimage = f
            .provider
            .preimage_for(&challenge.invoice.payment_hash)
            .unwrap();

        let err = f
            .gate
            .redeem("K02", &credential(&challenge.token, &preimage))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::ResourceMismatch));
        // The cheap token unlocked nothing; the record stays as issued.
        assert!(
            !f.gate
                .store()
                .get(&challenge.invoice.payment_hash)
                .await
                .unwrap()
                .paid
        );
    }

    #[tokio::test]
    async fn garbage_authorization_is_a_verification_failure() {
        let f = fixture();
        f.gate.challenge("K01").await.unwrap();
        for header in ["Bearer abc", "L402", "L402 not-a-token"] {
            let err = f.gate.redeem("K01", header).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    GateError::Verification(VerifyError::MalformedToken)
                ),
                "header {header:?}"
            );
        }
    }

    #[tokio::test]
    async fn concurrent_challenges_get_distinct_invoices() {
        let f = fixture();
        let a = f.gate.challenge("K01").await.unwrap();
        let b = f.gate.challenge("K01").await.unwrap();
        assert_ne!(a.invoice.payment_hash, b.invoice.payment_hash);
        assert_eq!(f.gate.store().snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn status_combines_backend_and_store() {
        let f = fixture();
        let challenge = f.gate.challenge("K01").await.unwrap();
        let hash = challenge.invoice.payment_hash;

        let status = f.gate.payment_status(&hash).await;
        assert!(!status.paid);
        assert_eq!(status.resource_id, Some(ResourceId::new("K01")));
        assert_eq!(status.amount_sats, Some(AmountSats(50)));

        f.provider.settle(&hash);
        let status = f.gate.payment_status(&hash).await;
        assert!(status.paid);

        let unknown = f.gate.payment_status(&PaymentHash::from_bytes([9; 32])).await;
        assert!(!unknown.paid);
        assert!(unknown.resource_id.is_none());
    }

    #[tokio::test]
    async fn stats_count_settled_payments() {
        let f = fixture();
        let a = f.gate.challenge("K01").await.unwrap();
        let b = f.gate.challenge("T01").await.unwrap();
        for challenge in [&a, &b] {
            let preimage = f
                .provider
                .preimage_for(&challenge.invoice.payment_hash)
                .unwrap();
            f.gate
                .redeem(challenge.entry.id.as_str(), &credential(&challenge.token, &preimage))
                .await
                .unwrap();
        }
        f.gate.challenge("K02").await.unwrap(); // pending, not settled

        let stats = f.gate.stats().await;
        assert_eq!(stats.settled_payments, 2);
        assert_eq!(stats.settled_sats, 200);
        assert_eq!(stats.total_resources, 21);
    }
}
