//! L402 gate HTTP entrypoint.
//!
//! Launches an Axum-based HTTP server that gates priced resources behind
//! Lightning Network payment challenges.
//!
//! Endpoints:
//! - `GET /api/resources/{id}` – L402-gated resource access
//! - `GET /api/resources/{id}/preview` – Free preview
//! - `GET /api/catalog` – Free resource listing
//! - `GET /api/payments/{hash}/status` – Payment status
//! - `GET /api/stats` – Aggregate payment stats
//! - `GET /health`, `GET /` – Liveness and service info
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `SERVER_SECRET` signs tokens; generated per-process when absent
//! - `LNBITS_URL`, `LNBITS_ADMIN_KEY`, `LNBITS_API_KEY` reach the backend
//! - `MOCK_MODE=true` serves simulated invoices instead

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use l402_gate::catalog::{Catalog, DirContentSource};
use l402_gate::config::Config;
use l402_gate::gate::AccessGate;
use l402_gate::handlers::{self, AppState};
use l402_gate::invoice::{InvoiceProvider, LnbitsProvider, MockProvider};
use l402_gate::shutdown;
use l402_gate::store::PaymentStore;
use l402_gate::sweep::run_sweeper;
use l402_gate::token::{TOKEN_TTL, TokenCodec};

/// Sweep cadence for the background expiry task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    let secret = match config.secret() {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            tracing::warn!(
                "SERVER_SECRET not set; using a random per-process secret. \
                 A restart will invalidate all outstanding tokens and challenges."
            );
            let mut secret = vec![0u8; 32];
            rand::rng().fill_bytes(&mut secret);
            secret
        }
    };

    let catalog = match config.catalog_path() {
        Some(path) => Catalog::from_file(path)?,
        None => Catalog::builtin(),
    };
    tracing::info!(resources = catalog.len(), "Catalog loaded");

    let provider: Arc<dyn InvoiceProvider> = if config.mock_mode() {
        tracing::warn!("MOCK_MODE enabled; invoices are simulated and carry no value");
        Arc::new(MockProvider::new())
    } else {
        let backend = config.backend();
        Arc::new(LnbitsProvider::new(
            backend.url().clone(),
            backend.admin_key().to_string(),
            backend.invoice_key().to_string(),
            backend.timeout(),
        )?)
    };

    let store = Arc::new(PaymentStore::open(config.store_path()));
    let gate = AccessGate::new(
        Arc::new(catalog),
        provider,
        Arc::clone(&store),
        TokenCodec::new(secret),
    );
    let state = Arc::new(AppState {
        gate,
        content: Arc::new(DirContentSource::new(config.content_dir())),
    });

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET])
                .allow_headers(cors::Any),
        );

    let cancellation = shutdown::cancel_on_signal()?;
    tokio::spawn(run_sweeper(
        store,
        SWEEP_INTERVAL,
        TOKEN_TTL,
        cancellation.clone(),
    ));

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let graceful = async move { cancellation.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(graceful)
        .await?;

    Ok(())
}
