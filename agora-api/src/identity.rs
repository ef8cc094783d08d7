//! Identity endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use agora_core::EconomyError;
use agora_engine::identity::RegisterAgentRequest;
use agora_engine::models::Agent;

use crate::error::ApiResult;
use crate::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/agents", post(register))
        .route("/agents/:id", get(lookup))
        .route("/verify", post(verify))
}

/// Registration is the one unsigned mutation: the key arrives in the body.
async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<Agent> {
    Ok(Json(state.node.identity().register(request).await?))
}

async fn lookup(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Agent> {
    Ok(Json(state.node.identity().lookup(&id).await?))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    agent_id: String,
    /// Base64 of the message bytes the signature covers
    message: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    valid: bool,
}

async fn verify(
    State(state): State<ApiState>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let message = BASE64
        .decode(&request.message)
        .map_err(|_| EconomyError::validation("message is not valid base64"))?;
    let valid = state
        .node
        .identity()
        .verify(&request.agent_id, &message, &request.signature)
        .await?;
    Ok(Json(VerifyResponse { valid }))
}
