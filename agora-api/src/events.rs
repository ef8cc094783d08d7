//! Event log surface, mounted on every service router

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use agora_engine::events::Event;

use crate::error::ApiResult;
use crate::ApiState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/events", get(catch_up))
        .route("/events/stream", get(stream))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: i64,
    limit: Option<i64>,
}

async fn catch_up(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<Event>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.node.events_after(query.after, limit).await?))
}

/// Live push: one `economy_event` message per committed event, delivered
/// once per subscriber.
async fn stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.node.events().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| {
        // A lagged subscriber drops the missed window and continues.
        let event = item.ok()?;
        let message = SseEvent::default()
            .event("economy_event")
            .json_data(&event)
            .ok()?;
        Some(Ok(message))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
