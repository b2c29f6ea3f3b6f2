//! Macaroon-style access token mint and verification.
//!
//! A token is a single flat signed claim, not a composable capability: it
//! binds a payment hash to a resource id and an issuance time under an
//! HMAC-SHA256 over the server-wide secret. The wire encoding is a fixed
//! contract shared with other implementations:
//!
//! ```text
//! claim     = "{payment_hash_hex}:{resource_id}:{issued_at_secs}"
//! signature = hex(HMAC-SHA256(secret, claim))
//! token     = base64url("{claim}:{signature}")
//! ```
//!
//! Clients present `"{token}:{preimage_hex}"`. Verification checks the
//! signature (constant-time) and the 24-hour TTL before it looks at payment
//! proof, so the weaker backend-confirmation fallback can never rescue a
//! forged or stale token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE as b64url;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::instrument;

use crate::invoice::InvoiceProvider;
use crate::store::PaymentStore;
use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentHash, Preimage, ResourceId};

/// Tokens and payment records expire 24 hours after issuance.
pub const TOKEN_TTL: Duration = Duration::from_secs(86_400);

/// Why a presented credential was rejected.
///
/// The variant name is all an unauthenticated caller learns; full context is
/// logged server-side.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The credential or embedded claim does not have the expected shape.
    #[error("Malformed token")]
    MalformedToken,
    /// The MAC over the claim does not match.
    #[error("Invalid token signature")]
    BadSignature,
    /// The claim is older than the TTL.
    #[error("Token expired")]
    TokenExpired,
    /// Neither the preimage nor the store/backend confirms settlement.
    #[error("Payment not verified")]
    PaymentNotVerified,
}

impl VerifyError {
    /// Machine-readable reason carried in 401 responses.
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::MalformedToken => "malformed_token",
            VerifyError::BadSignature => "bad_signature",
            VerifyError::TokenExpired => "token_expired",
            VerifyError::PaymentNotVerified => "payment_not_verified",
        }
    }
}

/// The fields a token is verified to bind together.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub payment_hash: PaymentHash,
    pub resource_id: ResourceId,
    pub issued_at: UnixTimestamp,
}

/// Mints and verifies access tokens under a server-wide secret.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            ttl: TOKEN_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(secret: Vec<u8>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    /// Mints a token binding `payment_hash` to `resource_id`, issued now.
    pub fn mint(&self, payment_hash: &PaymentHash, resource_id: &ResourceId) -> String {
        self.mint_at(payment_hash, resource_id, UnixTimestamp::now())
    }

    fn mint_at(
        &self,
        payment_hash: &PaymentHash,
        resource_id: &ResourceId,
        issued_at: UnixTimestamp,
    ) -> String {
        let claim = format!("{payment_hash}:{resource_id}:{issued_at}");
        let signature = hex::encode(self.mac(&claim));
        b64url.encode(format!("{claim}:{signature}"))
    }

    /// Verifies a presented credential of the form `"{token}:{preimage_hex}"`.
    ///
    /// Payment proof is the preimage hashing to the claimed payment hash.
    /// Failing that, the store record or the backend may independently
    /// confirm settlement; that fallback bypasses only the payment proof,
    /// never the signature, expiry, or resource binding.
    ///
    /// # Errors
    ///
    /// Returns the applicable [`VerifyError`]; callers map it to a 401.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn verify(
        &self,
        credential: &str,
        store: &PaymentStore,
        provider: &dyn InvoiceProvider,
    ) -> Result<VerifiedToken, VerifyError> {
        let (token, preimage_hex) = credential
            .split_once(':')
            .ok_or(VerifyError::MalformedToken)?;

        let decoded = b64url
            .decode(token)
            .map_err(|_| VerifyError::MalformedToken)?;
        let decoded = String::from_utf8(decoded).map_err(|_| VerifyError::MalformedToken)?;
        let parts: Vec<&str> = decoded.split(':').collect();
        let [hash_hex, resource_id, issued_at, signature_hex] = parts.as_slice() else {
            return Err(VerifyError::MalformedToken);
        };

        let payment_hash: PaymentHash =
            hash_hex.parse().map_err(|_| VerifyError::MalformedToken)?;
        let issued_at: u64 = issued_at.parse().map_err(|_| VerifyError::MalformedToken)?;
        let issued_at = UnixTimestamp::from_secs(issued_at);
        let resource_id = ResourceId::new(resource_id);

        let claim = format!("{payment_hash}:{resource_id}:{issued_at}");
        let expected = self.mac(&claim);
        let presented = hex::decode(signature_hex).map_err(|_| VerifyError::BadSignature)?;
        if !bool::from(expected.ct_eq(presented.as_slice())) {
            return Err(VerifyError::BadSignature);
        }

        if UnixTimestamp::now().seconds_since(issued_at) > self.ttl.as_secs() {
            return Err(VerifyError::TokenExpired);
        }

        let proven_by_preimage = Preimage::from_hex(preimage_hex)
            .map(|preimage| preimage.payment_hash() == payment_hash)
            .unwrap_or(false);
        if !proven_by_preimage {
            let settled = match store.get(&payment_hash).await {
                Some(record) if record.paid => true,
                _ => provider.is_paid(&payment_hash).await,
            };
            if !settled {
                return Err(VerifyError::PaymentNotVerified);
            }
            tracing::debug!(%payment_hash, "Access granted via backend-confirmed settlement");
        }

        Ok(VerifiedToken {
            payment_hash,
            resource_id,
            issued_at,
        })
    }

    fn mac(&self, claim: &str) -> [u8; 32] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(claim.as_bytes());
        mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::MockProvider;
    use crate::types::{AmountSats, PaymentRecord};

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-secret".to_vec())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: PaymentStore,
        provider: MockProvider,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = PaymentStore::open(dir.path().join("payments.json"));
        Fixture {
            _dir: dir,
            store,
            provider: MockProvider::new(),
        }
    }

    fn preimage_and_hash() -> (Preimage, PaymentHash) {
        let preimage = Preimage::from_bytes(vec![0x11; 32]);
        let hash = preimage.payment_hash();
        (preimage, hash)
    }

    #[tokio::test]
    async fn mint_verify_round_trip() {
        let codec = codec();
        let f = fixture();
        let (preimage, hash) = preimage_and_hash();
        let resource = ResourceId::new("K01");

        let token = codec.mint(&hash, &resource);
        let credential = format!("{token}:{}", preimage.to_hex());
        let verified = codec
            .verify(&credential, &f.store, &f.provider)
            .await
            .unwrap();
        assert_eq!(verified.resource_id, resource);
        assert_eq!(verified.payment_hash, hash);
    }

    #[tokio::test]
    async fn tampering_fails_with_bad_signature() {
        let codec = codec();
        let f = fixture();
        let (preimage, hash) = preimage_and_hash();
        let token = codec.mint(&hash, &ResourceId::new("K01"));

        // Flip each byte of the decoded claim-and-signature in turn. Any
        // single corruption must surface as a signature or structure error,
        // never a silent success.
        let decoded = b64url.decode(&token).unwrap();
        for i in 0..decoded.len() {
            let mut tampered = decoded.clone();
            tampered[i] ^= 0x01;
            let tampered_token = b64url.encode(&tampered);
            let credential = format!("{tampered_token}:{}", preimage.to_hex());
            let err = codec
                .verify(&credential, &f.store, &f.provider)
                .await
                .unwrap_err();
            assert!(
                matches!(err, VerifyError::BadSignature | VerifyError::MalformedToken),
                "byte {i}: unexpected {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn token_signed_with_other_secret_is_rejected() {
        let f = fixture();
        let (preimage, hash) = preimage_and_hash();
        let other = TokenCodec::new(b"other-secret".to_vec());
        let token = other.mint(&hash, &ResourceId::new("K01"));
        let credential = format!("{token}:{}", preimage.to_hex());
        let err = codec()
            .verify(&credential, &f.store, &f.provider)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::BadSignature);
    }

    #[tokio::test]
    async fn expiry_boundary() {
        let codec = codec();
        let f = fixture();
        let (preimage, hash) = preimage_and_hash();
        let resource = ResourceId::new("K01");
        let ttl = TOKEN_TTL.as_secs();

        let stale = codec.mint_at(&hash, &resource, UnixTimestamp::now() - (ttl + 1));
        let credential = format!("{stale}:{}", preimage.to_hex());
        let err = codec
            .verify(&credential, &f.store, &f.provider)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::TokenExpired);

        let fresh_enough = codec.mint_at(&hash, &resource, UnixTimestamp::now() - (ttl - 1));
        let credential = format!("{fresh_enough}:{}", preimage.to_hex());
        assert!(
            codec
                .verify(&credential, &f.store, &f.provider)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn wrong_preimage_without_settlement_fails() {
        let codec = codec();
        let f = fixture();
        let (_, hash) = preimage_and_hash();
        let token = codec.mint(&hash, &ResourceId::new("K01"));
        let credential = format!("{token}:{}", hex::encode([0xee; 32]));
        let err = codec
            .verify(&credential, &f.store, &f.provider)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::PaymentNotVerified);
    }

    #[tokio::test]
    async fn store_confirmed_settlement_is_accepted_as_fallback() {
        let codec = codec();
        let f = fixture();
        let (_, hash) = preimage_and_hash();
        let mut record = PaymentRecord::pending(ResourceId::new("K01"), AmountSats(50));
        record.paid = true;
        f.store.put(hash, record).await.unwrap();

        let token = codec.mint(&hash, &ResourceId::new("K01"));
        // Garbage preimage; settlement confirmation carries it.
        let credential = format!("{token}:{}", hex::encode([0xee; 32]));
        assert!(
            codec
                .verify(&credential, &f.store, &f.provider)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn backend_confirmed_settlement_is_accepted_as_fallback() {
        let codec = codec();
        let f = fixture();
        let invoice = f
            .provider
            .create_invoice(AmountSats(50), "K01")
            .await
            .unwrap();
        f.provider.settle(&invoice.payment_hash);

        let token = codec.mint(&invoice.payment_hash, &ResourceId::new("K01"));
        let credential = format!("{token}:deadbeef");
        assert!(
            codec
                .verify(&credential, &f.store, &f.provider)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn fallback_never_rescues_expired_or_forged_tokens() {
        let f = fixture();
        let (_, hash) = preimage_and_hash();
        let mut record = PaymentRecord::pending(ResourceId::new("K01"), AmountSats(50));
        record.paid = true;
        f.store.put(hash, record).await.unwrap();

        let short_lived = TokenCodec::with_ttl(b"test-secret".to_vec(), Duration::from_secs(0));
        let token = short_lived.mint_at(
            &hash,
            &ResourceId::new("K01"),
            UnixTimestamp::now() - 10,
        );
        let credential = format!("{token}:deadbeef");
        let err = short_lived
            .verify(&credential, &f.store, &f.provider)
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::TokenExpired);
    }

    #[tokio::test]
    async fn structurally_broken_credentials_are_malformed() {
        let codec = codec();
        let f = fixture();
        for credential in [
            "",
            "no-separator",
            "!!!not-base64!!!:aa",
            // Valid base64, wrong field count inside.
            &format!("{}:aa", b64url.encode("only:two")),
        ] {
            let err = codec
                .verify(credential, &f.store, &f.provider)
                .await
                .unwrap_err();
            assert_eq!(err, VerifyError::MalformedToken, "credential {credential:?}");
        }
    }
}
