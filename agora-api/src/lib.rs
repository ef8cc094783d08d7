//! HTTP surfaces for the Agora services
//!
//! One axum router per service, all sharing the same node. Mutating
//! endpoints carry a `signature` over the canonical body and are decoded
//! through [`signed::decode_signed`]; reads are open. Every router also
//! mounts the event catch-up and live-stream surface.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use agora_core::{EconomyError, EconomyResult};
use agora_engine::EconomyNode;

pub mod bank;
pub mod board;
pub mod court;
pub mod error;
pub mod events;
pub mod identity;
pub mod reputation;
pub mod signed;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<EconomyNode>,
}

impl ApiState {
    pub fn new(node: Arc<EconomyNode>) -> Self {
        Self { node }
    }
}

fn with_common(router: Router<ApiState>, state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);
    router
        .merge(events::routes())
        .with_state(state)
        .layer(cors)
}

/// Identity service router: registry and signature oracle
pub fn identity_router(state: ApiState) -> Router {
    with_common(identity::routes(), state)
}

/// Central bank router: accounts, credits, escrow
pub fn bank_router(state: ApiState) -> Router {
    with_common(bank::routes(), state)
}

/// Task board router: lifecycle, bids, assets
pub fn board_router(state: ApiState) -> Router {
    with_common(board::routes(), state)
}

/// Reputation router: feedback and scores
pub fn reputation_router(state: ApiState) -> Router {
    with_common(reputation::routes(), state)
}

/// Court router: claims, rebuttals, rulings
pub fn court_router(state: ApiState) -> Router {
    with_common(court::routes(), state)
}

/// Serve one router on its configured port until the process stops.
pub async fn serve(router: Router, port: u16) -> EconomyResult<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| EconomyError::internal(format!("bind port {}: {}", port, err)))?;
    info!(port, "service listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| EconomyError::internal(format!("serve: {}", err)))
}
