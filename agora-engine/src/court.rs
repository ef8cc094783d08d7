//! Court: the dispute adjudication pipeline
//!
//! Claims run filed → rebuttal → judging → ruled. The board files the
//! claim inside its dispute transaction; the respondent's rebuttal (or the
//! window expiring unanswered) triggers judging; the ruling splits the
//! escrow by the aggregated worker percentage and writes the verdict back
//! onto the task. Rulings are final.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tokio::time::timeout;
use tracing::{info, warn};

use agora_core::{id, EconomyError, EconomyResult};

use crate::bank::BankService;
use crate::board::TaskBoardService;
use crate::events::{Event, EventLog, EventPayload};
use crate::judge::{aggregate_worker_pct, AssetRef, JudgeBundle, JudgePanel, JudgeVote};
use crate::models::{Claim, ClaimStatus, Rebuttal, Ruling, Task, TaskStatus};
use crate::store::Store;

/// Configuration for the court
#[derive(Debug, Clone)]
pub struct CourtConfig {
    pub judge_panel_size: usize,
    /// Wall-clock deadline per seat; exceeding it is an abstention
    pub judge_timeout: Duration,
    /// Used when a claim arrives through the public endpoint
    pub rebuttal_window_seconds: i64,
}

impl Default for CourtConfig {
    fn default() -> Self {
        Self {
            judge_panel_size: 3,
            judge_timeout: Duration::from_secs(30),
            rebuttal_window_seconds: 3600,
        }
    }
}

/// Claim filing request (public endpoint; the board normally files first)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileClaimRequest {
    pub claimant_id: String,
    pub task_id: String,
    pub reason: String,
}

/// Rebuttal submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRebuttalRequest {
    pub respondent_id: String,
    pub content: String,
}

/// Claim with its dependent artifacts, as served to readers
#[derive(Debug, Clone, Serialize)]
pub struct ClaimDetail {
    pub claim: Claim,
    pub rebuttal: Option<Rebuttal>,
    pub ruling: Option<RulingView>,
}

/// Ruling with the vote archive parsed back into JSON
#[derive(Debug, Clone, Serialize)]
pub struct RulingView {
    pub ruling_id: String,
    pub claim_id: String,
    pub worker_pct: i64,
    pub summary: String,
    pub votes: serde_json::Value,
    pub ruled_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct CourtService {
    store: Store,
    events: EventLog,
    panel: Arc<dyn JudgePanel>,
    config: CourtConfig,
}

impl CourtService {
    pub fn new(
        store: Store,
        events: EventLog,
        panel: Arc<dyn JudgePanel>,
        config: CourtConfig,
    ) -> Self {
        Self {
            store,
            events,
            panel,
            config,
        }
    }

    /// File a claim for a disputed task. The board already does this inside
    /// its dispute transaction; the public path exists for drivers running
    /// the services separately and conflicts if the claim is in place.
    pub async fn file_claim(&self, request: FileClaimRequest) -> EconomyResult<Claim> {
        let mut tx = self.store.begin().await?;
        let task = TaskBoardService::fetch_task(&mut tx, &request.task_id).await?;
        if task.status != TaskStatus::Disputed {
            return Err(EconomyError::conflict(format!(
                "task is {}, claims require disputed",
                task.status.as_str()
            )));
        }
        if request.claimant_id != task.poster_id {
            return Err(EconomyError::forbidden("only the poster can file a claim"));
        }
        let (claim, event) = Self::file_claim_in(
            &mut tx,
            &task,
            &request.reason,
            self.config.rebuttal_window_seconds,
        )
        .await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        Ok(claim)
    }

    /// Insert the claim row inside the caller's transaction and open its
    /// rebuttal window.
    pub async fn file_claim_in(
        conn: &mut SqliteConnection,
        task: &Task,
        reason: &str,
        rebuttal_window_seconds: i64,
    ) -> EconomyResult<(Claim, Event)> {
        let respondent = task
            .worker_id
            .clone()
            .ok_or_else(|| EconomyError::invariant("disputed task has no worker"))?;

        let existing = sqlx::query("SELECT claim_id FROM court_claims WHERE task_id = ?")
            .bind(&task.task_id)
            .fetch_optional(&mut *conn)
            .await?;
        if existing.is_some() {
            return Err(EconomyError::conflict(format!(
                "claim already filed for task {}",
                task.task_id
            )));
        }

        let now = Utc::now();
        let claim = Claim {
            claim_id: id::fresh(id::CLAIM),
            task_id: task.task_id.clone(),
            claimant_id: task.poster_id.clone(),
            respondent_id: respondent,
            reason: reason.to_string(),
            status: ClaimStatus::Rebuttal,
            rebuttal_deadline: now + chrono::Duration::seconds(rebuttal_window_seconds),
            filed_at: now,
        };
        sqlx::query(
            "INSERT INTO court_claims
             (claim_id, task_id, claimant_id, respondent_id, reason, status,
              rebuttal_deadline, filed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&claim.claim_id)
        .bind(&claim.task_id)
        .bind(&claim.claimant_id)
        .bind(&claim.respondent_id)
        .bind(&claim.reason)
        .bind(claim.status)
        .bind(claim.rebuttal_deadline)
        .bind(claim.filed_at)
        .execute(&mut *conn)
        .await?;

        let event = EventLog::append(
            conn,
            EventPayload::ClaimFiled {
                claim_id: claim.claim_id.clone(),
                task_id: claim.task_id.clone(),
                claimant_id: claim.claimant_id.clone(),
                respondent_id: claim.respondent_id.clone(),
            },
        )
        .await?;
        info!(claim_id = %claim.claim_id, task_id = %claim.task_id, "claim filed");
        Ok((claim, event))
    }

    /// Respondent answers the claim; the pipeline moves to judging. The
    /// caller is expected to invoke `run_judging` next (the HTTP layer
    /// spawns it).
    pub async fn submit_rebuttal(
        &self,
        claim_id: &str,
        request: SubmitRebuttalRequest,
    ) -> EconomyResult<Rebuttal> {
        let mut tx = self.store.begin().await?;
        let claim = Self::fetch_claim(&mut tx, claim_id).await?;
        if claim.status != ClaimStatus::Rebuttal {
            return Err(EconomyError::conflict(format!(
                "claim is {:?}, rebuttals require the window to be open",
                claim.status
            )));
        }
        if request.respondent_id != claim.respondent_id {
            return Err(EconomyError::forbidden(
                "only the respondent can submit a rebuttal",
            ));
        }

        let updated = sqlx::query(
            "UPDATE court_claims SET status = 'judging'
             WHERE claim_id = ? AND status = 'rebuttal'",
        )
        .bind(claim_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EconomyError::conflict("rebuttal window already closed"));
        }

        let rebuttal = Rebuttal {
            rebuttal_id: id::fresh(id::REBUTTAL),
            claim_id: claim_id.to_string(),
            respondent_id: request.respondent_id,
            content: request.content,
            submitted_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO court_rebuttals
             (rebuttal_id, claim_id, respondent_id, content, submitted_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&rebuttal.rebuttal_id)
        .bind(&rebuttal.claim_id)
        .bind(&rebuttal.respondent_id)
        .bind(&rebuttal.content)
        .bind(rebuttal.submitted_at)
        .execute(&mut *tx)
        .await?;

        let event = EventLog::append(
            &mut tx,
            EventPayload::RebuttalSubmitted {
                claim_id: rebuttal.claim_id.clone(),
                rebuttal_id: rebuttal.rebuttal_id.clone(),
                respondent_id: rebuttal.respondent_id.clone(),
            },
        )
        .await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        info!(claim_id, "rebuttal submitted");
        Ok(rebuttal)
    }

    /// Move claims whose rebuttal window has expired into judging; the
    /// rebuttal stays empty. Returns the claim ids now awaiting a ruling.
    pub async fn expire_rebuttals(&self) -> EconomyResult<Vec<String>> {
        let now = Utc::now();
        let open = sqlx::query_as::<_, Claim>(&format!(
            "{} WHERE status = 'rebuttal'",
            CLAIM_SELECT
        ))
        .fetch_all(self.store.pool())
        .await?;

        let mut expired = Vec::new();
        for claim in open {
            if now < claim.rebuttal_deadline {
                continue;
            }
            let updated = sqlx::query(
                "UPDATE court_claims SET status = 'judging'
                 WHERE claim_id = ? AND status = 'rebuttal'",
            )
            .bind(&claim.claim_id)
            .execute(self.store.pool())
            .await?;
            if updated.rows_affected() == 1 {
                info!(claim_id = %claim.claim_id, "rebuttal window expired");
                expired.push(claim.claim_id);
            }
        }
        Ok(expired)
    }

    /// Invoke the panel and persist the verdict: ruling row, claim → ruled,
    /// task → ruled and escrow split, all in one atomic unit.
    pub async fn run_judging(&self, claim_id: &str) -> EconomyResult<Ruling> {
        let claim = self.get_claim(claim_id).await?;
        if claim.status != ClaimStatus::Judging {
            return Err(EconomyError::conflict(format!(
                "claim is {:?}, judging not pending",
                claim.status
            )));
        }
        let task = {
            let mut conn = self.store.pool().acquire().await?;
            TaskBoardService::fetch_task(&mut conn, &claim.task_id).await?
        };
        let worker = task
            .worker_id
            .clone()
            .ok_or_else(|| EconomyError::invariant("disputed task has no worker"))?;
        let rebuttal_content = self
            .rebuttal_for_claim(claim_id)
            .await?
            .map(|rebuttal| rebuttal.content)
            .unwrap_or_default();
        let assets = TaskBoardService::assets_for_task(self.store.pool(), &task.task_id).await?;

        let bundle = JudgeBundle {
            task_id: task.task_id.clone(),
            spec: task.spec.clone(),
            reward: task.reward,
            claim_reason: claim.reason.clone(),
            rebuttal: rebuttal_content,
            assets: assets.iter().map(AssetRef::from).collect(),
        };

        let votes = self.collect_votes(&bundle).await;
        let abstentions = self.config.judge_panel_size - votes.len();
        let worker_pct = aggregate_worker_pct(&votes);
        let summary = format!(
            "panel of {}: worker {}% / poster {}%",
            self.config.judge_panel_size,
            worker_pct,
            100 - worker_pct
        );

        let ruling = Ruling {
            ruling_id: id::fresh(id::RULING),
            claim_id: claim_id.to_string(),
            worker_pct,
            summary: summary.clone(),
            votes: json!({ "votes": votes, "abstentions": abstentions }).to_string(),
            ruled_at: Utc::now(),
        };

        let mut tx = self.store.begin().await?;
        let updated = sqlx::query(
            "UPDATE court_claims SET status = 'ruled'
             WHERE claim_id = ? AND status = 'judging'",
        )
        .bind(claim_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EconomyError::conflict("claim already ruled"));
        }

        sqlx::query(
            "INSERT INTO court_rulings (ruling_id, claim_id, worker_pct, summary, votes, ruled_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&ruling.ruling_id)
        .bind(&ruling.claim_id)
        .bind(ruling.worker_pct)
        .bind(&ruling.summary)
        .bind(&ruling.votes)
        .bind(ruling.ruled_at)
        .execute(&mut *tx)
        .await?;

        let delivered = EventLog::append(
            &mut tx,
            EventPayload::RulingDelivered {
                ruling_id: ruling.ruling_id.clone(),
                claim_id: claim_id.to_string(),
                task_id: task.task_id.clone(),
                worker_pct,
            },
        )
        .await?;

        let (_, ruled) = TaskBoardService::apply_ruling_in(
            &mut tx,
            &task.task_id,
            &ruling.ruling_id,
            worker_pct,
            &summary,
        )
        .await?;

        let (_, split) = BankService::split_escrow_in(
            &mut tx,
            &task.escrow_id,
            worker_pct,
            &worker,
            &task.poster_id,
        )
        .await?;

        tx.commit().await?;
        self.events.publish_all([delivered, ruled, split]);
        info!(claim_id, worker_pct, "ruling delivered");
        Ok(ruling)
    }

    /// Fan the bundle out to every seat under the per-seat deadline;
    /// timeouts and errors abstain.
    async fn collect_votes(&self, bundle: &JudgeBundle) -> Vec<JudgeVote> {
        let seats = (0..self.config.judge_panel_size).map(|seat| {
            let panel = self.panel.clone();
            async move {
                match timeout(self.config.judge_timeout, panel.judge(seat, bundle)).await {
                    Ok(Ok(vote)) => Some(vote),
                    Ok(Err(err)) => {
                        warn!(seat, "judge abstained: {}", err);
                        None
                    }
                    Err(_) => {
                        warn!(seat, "judge timed out; counted as abstention");
                        None
                    }
                }
            }
        });
        join_all(seats).await.into_iter().flatten().collect()
    }

    pub async fn get_claim(&self, claim_id: &str) -> EconomyResult<Claim> {
        sqlx::query_as::<_, Claim>(&format!("{} WHERE claim_id = ?", CLAIM_SELECT))
            .bind(claim_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| EconomyError::not_found(format!("claim {}", claim_id)))
    }

    pub async fn claim_for_task(&self, task_id: &str) -> EconomyResult<Option<Claim>> {
        Ok(
            sqlx::query_as::<_, Claim>(&format!("{} WHERE task_id = ?", CLAIM_SELECT))
                .bind(task_id)
                .fetch_optional(self.store.pool())
                .await?,
        )
    }

    /// Claim plus rebuttal and ruling, for the read surface
    pub async fn claim_detail(&self, claim_id: &str) -> EconomyResult<ClaimDetail> {
        let claim = self.get_claim(claim_id).await?;
        let rebuttal = self.rebuttal_for_claim(claim_id).await?;
        let ruling = sqlx::query_as::<_, Ruling>(
            "SELECT ruling_id, claim_id, worker_pct, summary, votes, ruled_at
             FROM court_rulings WHERE claim_id = ?",
        )
        .bind(claim_id)
        .fetch_optional(self.store.pool())
        .await?
        .map(|ruling| {
            let votes = serde_json::from_str(&ruling.votes).unwrap_or(serde_json::Value::Null);
            RulingView {
                ruling_id: ruling.ruling_id,
                claim_id: ruling.claim_id,
                worker_pct: ruling.worker_pct,
                summary: ruling.summary,
                votes,
                ruled_at: ruling.ruled_at,
            }
        });
        Ok(ClaimDetail {
            claim,
            rebuttal,
            ruling,
        })
    }

    async fn rebuttal_for_claim(&self, claim_id: &str) -> EconomyResult<Option<Rebuttal>> {
        Ok(sqlx::query_as::<_, Rebuttal>(
            "SELECT rebuttal_id, claim_id, respondent_id, content, submitted_at
             FROM court_rebuttals WHERE claim_id = ?",
        )
        .bind(claim_id)
        .fetch_optional(self.store.pool())
        .await?)
    }

    async fn fetch_claim(conn: &mut SqliteConnection, claim_id: &str) -> EconomyResult<Claim> {
        sqlx::query_as::<_, Claim>(&format!("{} WHERE claim_id = ?", CLAIM_SELECT))
            .bind(claim_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| EconomyError::not_found(format!("claim {}", claim_id)))
    }
}

const CLAIM_SELECT: &str = "SELECT claim_id, task_id, claimant_id, respondent_id, reason,
        status, rebuttal_deadline, filed_at
    FROM court_claims";
