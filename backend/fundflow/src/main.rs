//! Fundflow — entry point.
//!
//! Wires the project lifecycle service: SQLite projection, ledger gateway
//! client, Expo push notifier and the Axum REST API. Ledger-mutating
//! workflows return a transaction hash immediately; confirmation handling
//! runs on detached tasks supervised by the lifecycle executor.

mod api;
mod config;
mod conversion;
mod errors;
mod events;
mod guards;
mod ledger;
mod lifecycle;
mod notify;
mod service;
mod store;
mod wallets;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use ledger::{RpcLedgerClient, SigningIdentity};
use notify::ExpoNotifier;
use service::ProjectLifecycleService;
use store::ProjectStore;
use wallets::WalletResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = store::init_pool(&config.database_url).await?;

    // HTTP client shared by the ledger gateway and the push gateway.
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let ledger = Arc::new(RpcLedgerClient::new(
        client.clone(),
        config.rpc_url.clone(),
        config.contract_address.clone(),
        Duration::from_millis(config.receipt_poll_interval_ms),
    ));
    let notifier = Arc::new(ExpoNotifier::new(
        pool.clone(),
        client,
        config.expo_url.clone(),
    ));

    let store = ProjectStore::new(pool.clone());
    let resolver = WalletResolver::new(pool);
    let service = ProjectLifecycleService::new(
        store.clone(),
        resolver.clone(),
        ledger,
        notifier.clone(),
        config.confirmations,
        config.fee_limit,
    );

    let state = Arc::new(api::ApiState {
        service,
        store,
        wallets: resolver,
        notifier,
        operator: SigningIdentity {
            address: config.operator_address.clone(),
            key: config.operator_key.clone(),
        },
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
