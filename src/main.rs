//! LaWallet card module HTTP entrypoint.
//!
//! Boots the axum server with the card endpoints, wires the in-process
//! service seams (registry, event bus, ledger, identity provider), and
//! runs the inbound config-change subscription alongside the HTTP
//! listener. `.env` values are loaded at startup; `HOST`/`PORT` control
//! the bind address. SIGTERM/SIGINT trigger a graceful shutdown of both
//! the listener and the subscription loop.

use axum::Router;
use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use lawallet_card::app::AppState;
use lawallet_card::config::{CliArgs, Config};
use lawallet_card::handlers;
use lawallet_card::identity::HttpIdentityProvider;
use lawallet_card::ledger::HttpLedger;
use lawallet_card::outbox::LoopbackBus;
use lawallet_card::store::memory::MemoryStore;
use lawallet_card::subscription;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = CliArgs::parse();
    let config = Arc::new(Config::from_env()?);

    // The relay transport is out of scope here: the loopback bus is the
    // injection seam a deployment replaces with its relay adapter.
    let bus = Arc::new(LoopbackBus::new());
    let state = AppState {
        ledger: Arc::new(HttpLedger::new(&config.api_base_url)?),
        identity: Arc::new(HttpIdentityProvider::new(&config.identity_provider_base_url)?),
        store: Arc::new(MemoryStore::new()),
        outbox: bus.clone(),
        config,
    };
    state.seed().await?;

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(subscription::run(
        state.clone(),
        bus.clone(),
        shutdown.clone(),
    ));

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(cli.host, cli.port);
    tracing::info!("Starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "cannot install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm => {},
        }
        signal_token.cancel();
    });

    let graceful = shutdown.clone();
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    shutdown.cancel();
    let _ = consumer.await;
    Ok(())
}
