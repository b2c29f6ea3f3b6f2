//! L402 payment gating for priced digital resources.
//!
//! This crate gates access to resources behind a Lightning Network payment
//! challenge following the L402 pattern: an HTTP `402 Payment Required`
//! response carries an invoice and a macaroon-style bearer token; once the
//! payer proves payment by presenting the preimage matching the invoice's
//! payment hash, the token unlocks the resource.
//!
//! # Modules
//!
//! - [`types`] — Domain types: payment hashes, preimages, invoices, records.
//! - [`token`] — Token mint/verify: HMAC-SHA256 over a flat signed claim.
//! - [`invoice`] — The [`InvoiceProvider`](invoice::InvoiceProvider) backend
//!   abstraction, with live LNbits and mock implementations.
//! - [`store`] — Durable, concurrency-safe payment-record store.
//! - [`gate`] — The [`AccessGate`](gate::AccessGate) challenge/redeem
//!   orchestrator.
//! - [`catalog`] — Priced-resource registry and the content collaborator.
//! - [`sweep`] — Background expiry of stale payment records.
//! - [`handlers`] — Axum HTTP endpoints.
//! - [`config`] — File/env layered server configuration.
//!
//! # Trust model
//!
//! Tokens are bearer credentials: possession plus a correct preimage (or an
//! independently confirmed settlement) grants access. There is no caveat
//! algebra, delegation, or revocation list; a token simply expires after 24
//! hours. The backend-confirmation fallback is a deliberately weaker proof
//! path and is only ever consulted after the signature, expiry, and resource
//! binding checks have passed.

pub mod catalog;
pub mod config;
pub mod gate;
pub mod handlers;
pub mod invoice;
pub mod shutdown;
pub mod store;
pub mod sweep;
pub mod timestamp;
pub mod token;
pub mod types;
