//! Domain types for the L402 payment gate.
//!
//! The key objects are [`PaymentHash`], [`Preimage`], [`Invoice`], and
//! [`PaymentRecord`], which together tie a Lightning invoice to the resource
//! it unlocks. Wire and persistence encodings are fixed here so alternate
//! implementations interoperate: payment hashes travel as 64 lowercase hex
//! characters, preimages as hex, amounts as integer sats.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::timestamp::UnixTimestamp;

/// SHA-256 digest identifying a Lightning invoice, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentHash([u8; 32]);

/// Error parsing a [`PaymentHash`] from its hex form.
#[derive(Debug, thiserror::Error)]
#[error("Invalid payment hash: expected 64 hex characters")]
pub struct PaymentHashError;

impl PaymentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, as carried in invoices, tokens, and URLs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for PaymentHash {
    type Err = PaymentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| PaymentHashError)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| PaymentHashError)?;
        Ok(Self(bytes))
    }
}

impl Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PaymentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PaymentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The secret revealed to a payer on settlement. Hashing it with SHA-256
/// must reproduce the invoice's [`PaymentHash`].
#[derive(Clone, PartialEq, Eq)]
pub struct Preimage(Vec<u8>);

impl Preimage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse from the hex form clients send in the `Authorization` header.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// SHA-256 of the preimage bytes. Matching the invoice hash is the
    /// cryptographic proof of payment.
    pub fn payment_hash(&self) -> PaymentHash {
        let digest = Sha256::digest(&self.0);
        PaymentHash(digest.into())
    }
}

// Keep preimage bytes out of Debug output and logs.
impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage(<{} bytes>)", self.0.len())
    }
}

/// Case-normalized identifier of a priced resource.
///
/// Lookups are case-insensitive: `k01` and `K01` resolve to the same entry,
/// so the id is uppercased at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ResourceId::new(s))
    }
}

/// Payment amount in satoshis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AmountSats(pub u64);

impl Display for AmountSats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sats", self.0)
    }
}

/// A payment request issued by the Lightning backend. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_hash: PaymentHash,
    /// BOLT-11 encoded payment request the payer submits to their wallet.
    pub payment_request: String,
    pub amount_sats: AmountSats,
}

/// Durable record of an issued challenge, keyed by payment hash in the
/// [`PaymentStore`](crate::store::PaymentStore).
///
/// Owned exclusively by the store; callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub resource_id: ResourceId,
    pub paid: bool,
    pub created_at: UnixTimestamp,
    pub amount_sats: AmountSats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
}

impl PaymentRecord {
    /// A fresh, unpaid record for a just-issued challenge.
    pub fn pending(resource_id: ResourceId, amount_sats: AmountSats) -> Self {
        Self {
            resource_id,
            paid: false,
            created_at: UnixTimestamp::now(),
            amount_sats,
            preimage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_hash_hex_round_trip() {
        let hash = PaymentHash::from_bytes([0xab; 32]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<PaymentHash>().unwrap(), hash);
    }

    #[test]
    fn payment_hash_rejects_bad_input() {
        assert!("zz".repeat(32).parse::<PaymentHash>().is_err());
        assert!("abcd".parse::<PaymentHash>().is_err());
        assert!("".parse::<PaymentHash>().is_err());
    }

    #[test]
    fn preimage_hashes_to_payment_hash() {
        let preimage = Preimage::from_bytes(b"settled".to_vec());
        let expected: [u8; 32] = Sha256::digest(b"settled").into();
        assert_eq!(preimage.payment_hash(), PaymentHash::from_bytes(expected));
    }

    #[test]
    fn resource_id_is_case_normalized() {
        assert_eq!(ResourceId::new("k01"), ResourceId::new("K01"));
        assert_eq!(ResourceId::new("k01").as_str(), "K01");
    }

    #[test]
    fn payment_record_serde_round_trip() {
        let record = PaymentRecord::pending(ResourceId::new("K01"), AmountSats(50));
        let json = serde_json::to_string(&record).unwrap();
        let back: PaymentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.resource_id, record.resource_id);
        assert!(!back.paid);
        assert_eq!(back.amount_sats, AmountSats(50));
        assert!(back.preimage.is_none());
    }
}
