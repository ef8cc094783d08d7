//! Judge panel client
//!
//! The panel is an external oracle treated as a pure function: given the
//! case bundle it returns one quality opinion per seat. Each seat call is
//! bounded by a wall-clock deadline; a timeout or error counts as an
//! abstention and the aggregate is recomputed over the remaining votes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use agora_core::{EconomyError, EconomyResult};

use crate::models::Asset;

/// Everything a judge sees about a case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeBundle {
    pub task_id: String,
    pub spec: String,
    pub reward: i64,
    pub claim_reason: String,
    /// Empty when the rebuttal window expired unanswered
    pub rebuttal: String,
    pub assets: Vec<AssetRef>,
}

/// Asset metadata handed to judges; the blob stays in the store dir
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub asset_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_path: String,
}

impl From<&Asset> for AssetRef {
    fn from(asset: &Asset) -> Self {
        Self {
            asset_id: asset.asset_id.clone(),
            filename: asset.filename.clone(),
            content_type: asset.content_type.clone(),
            size_bytes: asset.size_bytes,
            storage_path: asset.storage_path.clone(),
        }
    }
}

/// One judge's opinion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVote {
    pub spec_quality_pct: i64,
    pub delivery_quality_pct: i64,
    pub brief_reason: String,
}

/// A panel seat. Implementations must be pure in the bundle; the court
/// enforces the per-seat deadline around this call.
#[async_trait]
pub trait JudgePanel: Send + Sync {
    async fn judge(&self, seat: usize, bundle: &JudgeBundle) -> EconomyResult<JudgeVote>;
}

/// HTTP panel: POSTs the bundle to `<url>` with the seat number and expects
/// a `JudgeVote` back.
pub struct HttpJudgePanel {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct SeatRequest<'a> {
    seat: usize,
    bundle: &'a JudgeBundle,
}

impl HttpJudgePanel {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl JudgePanel for HttpJudgePanel {
    async fn judge(&self, seat: usize, bundle: &JudgeBundle) -> EconomyResult<JudgeVote> {
        let response = self
            .client
            .post(&self.url)
            .json(&SeatRequest { seat, bundle })
            .send()
            .await
            .map_err(|err| EconomyError::Judge(err.to_string()))?;
        if !response.status().is_success() {
            return Err(EconomyError::Judge(format!(
                "panel returned {}",
                response.status()
            )));
        }
        response
            .json::<JudgeVote>()
            .await
            .map_err(|err| EconomyError::Judge(err.to_string()))
    }
}

/// Panel used when no judge endpoint is configured: every seat abstains,
/// so rulings default to the worker.
pub struct NullJudgePanel;

#[async_trait]
impl JudgePanel for NullJudgePanel {
    async fn judge(&self, _seat: usize, _bundle: &JudgeBundle) -> EconomyResult<JudgeVote> {
        Err(EconomyError::Judge("no judge panel configured".into()))
    }
}

/// Deterministic panel returning pre-seeded votes, seat by seat.
pub struct FixedJudgePanel {
    votes: Vec<JudgeVote>,
}

impl FixedJudgePanel {
    pub fn new(votes: Vec<JudgeVote>) -> Self {
        Self { votes }
    }
}

#[async_trait]
impl JudgePanel for FixedJudgePanel {
    async fn judge(&self, seat: usize, _bundle: &JudgeBundle) -> EconomyResult<JudgeVote> {
        self.votes
            .get(seat)
            .cloned()
            .ok_or_else(|| EconomyError::Judge(format!("no vote for seat {}", seat)))
    }
}

/// Aggregate the per-judge worker share: each vote contributes
/// `delivery / (spec + delivery)` (a zero denominator favors the worker
/// entirely), the panel combines by median for odd counts and rounded mean
/// for even, and the result is clamped to [0, 100]. No votes at all means
/// every judge abstained: ambiguity favors the worker.
pub fn aggregate_worker_pct(votes: &[JudgeVote]) -> i64 {
    if votes.is_empty() {
        return 100;
    }

    let mut shares: Vec<f64> = votes
        .iter()
        .map(|vote| {
            let spec = vote.spec_quality_pct.max(0) as f64;
            let delivery = vote.delivery_quality_pct.max(0) as f64;
            if spec + delivery == 0.0 {
                100.0
            } else {
                100.0 * delivery / (spec + delivery)
            }
        })
        .collect();
    shares.sort_by(|a, b| a.partial_cmp(b).expect("shares are finite"));

    let aggregate = if shares.len() % 2 == 1 {
        shares[shares.len() / 2]
    } else {
        shares.iter().sum::<f64>() / shares.len() as f64
    };

    (aggregate.round() as i64).clamp(0, 100)
}
