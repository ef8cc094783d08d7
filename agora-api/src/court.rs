//! Court endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tracing::warn;

use agora_engine::court::{ClaimDetail, FileClaimRequest, SubmitRebuttalRequest};
use agora_engine::models::{Claim, Rebuttal};

use crate::error::ApiResult;
use crate::signed::decode_signed;
use crate::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/claims", post(file_claim))
        .route("/claims/:id", get(claim_detail))
        .route("/claims/:id/rebuttal", post(submit_rebuttal))
}

async fn file_claim(State(state): State<ApiState>, Json(body): Json<Value>) -> ApiResult<Claim> {
    let request: FileClaimRequest =
        decode_signed(state.node.identity(), body, "claimant_id").await?;
    Ok(Json(state.node.court().file_claim(request).await?))
}

async fn claim_detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<ClaimDetail> {
    Ok(Json(state.node.court().claim_detail(&id).await?))
}

/// A rebuttal moves the claim to judging; the panel runs in the background
/// and the ruling lands through the event stream.
async fn submit_rebuttal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Rebuttal> {
    let request: SubmitRebuttalRequest =
        decode_signed(state.node.identity(), body, "respondent_id").await?;
    let rebuttal = state.node.court().submit_rebuttal(&id, request).await?;

    let court = state.node.court().clone();
    let claim_id = id.clone();
    tokio::spawn(async move {
        if let Err(err) = court.run_judging(&claim_id).await {
            warn!(%claim_id, "judging failed: {}", err);
        }
    });

    Ok(Json(rebuttal))
}
