//! Central bank endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use agora_core::EconomyError;
use agora_engine::models::{Account, Escrow, LedgerTransaction};

use crate::error::ApiResult;
use crate::signed::decode_signed;
use crate::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/accounts", post(open_account))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/transactions", get(transactions))
        .route("/credits", post(credit))
        .route("/escrow", post(lock_escrow))
        .route("/escrow/:id/release", post(release_escrow))
        .route("/escrow/:id/split", post(split_escrow))
}

#[derive(Debug, Deserialize)]
struct OpenAccountRequest {
    agent_id: String,
}

async fn open_account(State(state): State<ApiState>, Json(body): Json<Value>) -> ApiResult<Account> {
    let request: OpenAccountRequest =
        decode_signed(state.node.identity(), body, "agent_id").await?;
    Ok(Json(state.node.bank().open_account(&request.agent_id).await?))
}

async fn get_account(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Account> {
    Ok(Json(state.node.bank().get_account(&id).await?))
}

async fn transactions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<LedgerTransaction>> {
    Ok(Json(state.node.bank().transactions(&id).await?))
}

#[derive(Debug, Deserialize)]
struct CreditRequest {
    account_id: String,
    amount: i64,
    reference: String,
}

async fn credit(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<LedgerTransaction> {
    let request: CreditRequest = decode_signed(state.node.identity(), body, "account_id").await?;
    Ok(Json(
        state
            .node
            .bank()
            .credit(&request.account_id, request.amount, &request.reference)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct LockEscrowRequest {
    payer_id: String,
    amount: i64,
    task_id: String,
}

async fn lock_escrow(State(state): State<ApiState>, Json(body): Json<Value>) -> ApiResult<Escrow> {
    let request: LockEscrowRequest = decode_signed(state.node.identity(), body, "payer_id").await?;
    Ok(Json(
        state
            .node
            .bank()
            .lock_escrow(&request.payer_id, request.amount, &request.task_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ReleaseEscrowRequest {
    payer_id: String,
    recipient_id: String,
}

async fn release_escrow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Escrow> {
    let request: ReleaseEscrowRequest =
        decode_signed(state.node.identity(), body, "payer_id").await?;
    ensure_payer(&state, &id, &request.payer_id).await?;
    Ok(Json(
        state
            .node
            .bank()
            .release_escrow(&id, &request.recipient_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct SplitEscrowRequest {
    payer_id: String,
    worker_pct: i64,
    worker_id: String,
    poster_id: String,
}

async fn split_escrow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Escrow> {
    let request: SplitEscrowRequest =
        decode_signed(state.node.identity(), body, "payer_id").await?;
    ensure_payer(&state, &id, &request.payer_id).await?;
    Ok(Json(
        state
            .node
            .bank()
            .split_escrow(
                &id,
                request.worker_pct,
                &request.worker_id,
                &request.poster_id,
            )
            .await?,
    ))
}

/// Only the agent whose funds are locked may resolve the escrow directly.
async fn ensure_payer(state: &ApiState, escrow_id: &str, payer: &str) -> Result<(), EconomyError> {
    let escrow = state.node.bank().get_escrow(escrow_id).await?;
    if escrow.payer_account_id != payer {
        return Err(EconomyError::forbidden(
            "only the escrow payer can resolve it",
        ));
    }
    Ok(())
}
