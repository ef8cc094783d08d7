//! Task board endpoints

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agora_engine::board::{
    AcceptBidRequest, ApproveTaskRequest, CancelTaskRequest, CreateTaskRequest,
    DisputeTaskRequest, PlaceBidRequest, SubmitWorkRequest, UploadAssetRequest,
};
use agora_engine::models::{Asset, Bid, Claim, Task, TaskStatus};

use crate::error::ApiResult;
use crate::signed::decode_signed;
use crate::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/bids", post(place_bid))
        .route("/tasks/:id/accept", post(accept_bid))
        .route("/tasks/:id/assets", post(upload_asset).get(list_assets))
        .route("/tasks/:id/submit", post(submit_work))
        .route("/tasks/:id/approve", post(approve))
        .route("/tasks/:id/dispute", post(dispute))
        .route("/tasks/:id/cancel", post(cancel))
}

async fn create_task(State(state): State<ApiState>, Json(body): Json<Value>) -> ApiResult<Task> {
    let request: CreateTaskRequest =
        decode_signed(state.node.identity(), body, "poster_id").await?;
    Ok(Json(state.node.board().create_task(request).await?))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Vec<Task>> {
    Ok(Json(state.node.board().list_tasks(query.status).await?))
}

/// Task with its bids; bids are open books.
#[derive(Debug, Serialize)]
struct TaskDetail {
    task: Task,
    bids: Vec<Bid>,
}

async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<TaskDetail> {
    let task = state.node.board().get_task(&id).await?;
    let bids = state.node.board().list_bids(&id).await?;
    Ok(Json(TaskDetail { task, bids }))
}

async fn place_bid(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Bid> {
    let request: PlaceBidRequest = decode_signed(state.node.identity(), body, "bidder_id").await?;
    Ok(Json(state.node.board().place_bid(&id, request).await?))
}

async fn accept_bid(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Task> {
    let request: AcceptBidRequest = decode_signed(state.node.identity(), body, "poster_id").await?;
    Ok(Json(state.node.board().accept_bid(&id, request).await?))
}

async fn upload_asset(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Asset> {
    let request: UploadAssetRequest =
        decode_signed(state.node.identity(), body, "uploader_id").await?;
    Ok(Json(state.node.board().upload_asset(&id, request).await?))
}

#[derive(Debug, Deserialize)]
struct ListAssetsQuery {
    /// Requesting agent; listing is restricted to poster and worker
    agent_id: String,
}

async fn list_assets(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ListAssetsQuery>,
) -> ApiResult<Vec<Asset>> {
    Ok(Json(
        state
            .node
            .board()
            .list_assets(&id, Some(&query.agent_id))
            .await?,
    ))
}

async fn submit_work(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Task> {
    let request: SubmitWorkRequest =
        decode_signed(state.node.identity(), body, "worker_id").await?;
    Ok(Json(state.node.board().submit_work(&id, request).await?))
}

async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Task> {
    let request: ApproveTaskRequest =
        decode_signed(state.node.identity(), body, "poster_id").await?;
    Ok(Json(state.node.board().approve(&id, request).await?))
}

/// Dispute outcome: the transitioned task and the claim the court opened.
#[derive(Debug, Serialize)]
struct DisputeOutcome {
    task: Task,
    claim: Claim,
}

async fn dispute(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<DisputeOutcome> {
    let request: DisputeTaskRequest =
        decode_signed(state.node.identity(), body, "poster_id").await?;
    let (task, claim) = state.node.board().dispute(&id, request).await?;
    Ok(Json(DisputeOutcome { task, claim }))
}

async fn cancel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Task> {
    let request: CancelTaskRequest =
        decode_signed(state.node.identity(), body, "poster_id").await?;
    Ok(Json(state.node.board().cancel(&id, request).await?))
}
