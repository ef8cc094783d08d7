//! Reputation endpoints

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;

use agora_engine::reputation::{AgentScores, FeedbackView, SubmitFeedbackRequest};

use crate::error::ApiResult;
use crate::signed::decode_signed;
use crate::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/feedback", post(submit_feedback))
        .route("/feedback/task/:id", get(feedback_for_task))
        .route("/agents/:id/scores", get(scores))
}

async fn submit_feedback(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<FeedbackView> {
    let request: SubmitFeedbackRequest =
        decode_signed(state.node.identity(), body, "from_agent_id").await?;
    Ok(Json(state.node.reputation().submit_feedback(request).await?))
}

async fn feedback_for_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<FeedbackView>> {
    Ok(Json(state.node.reputation().feedback_for_task(&id).await?))
}

async fn scores(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<AgentScores> {
    Ok(Json(state.node.reputation().scores(&id).await?))
}
