//! Task board: the lifecycle state machine
//!
//! Tasks move open → accepted → submitted → approved, with cancel, expiry,
//! dispute and ruling branches. Each transition is a status-guarded update,
//! so concurrent attempts on one task resolve to exactly one winner and the
//! losers observe `conflict`. The periodic sweep drives the three
//! time-based transitions and is idempotent.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use agora_core::{id, EconomyError, EconomyResult};

use crate::bank::BankService;
use crate::court::CourtService;
use crate::events::{Event, EventLog, EventPayload};
use crate::models::{Asset, Bid, Claim, ExpiryReason, Task, TaskStatus};
use crate::store::{map_unique, Store};

/// Configuration for the task board
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub default_bidding_seconds: i64,
    pub default_execution_seconds: i64,
    pub default_review_seconds: i64,
    /// Court rebuttal window opened when a dispute files a claim
    pub rebuttal_window_seconds: i64,
    pub asset_storage_dir: PathBuf,
    pub max_asset_size_bytes: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            default_bidding_seconds: 3600,
            default_execution_seconds: 86_400,
            default_review_seconds: 3600,
            rebuttal_window_seconds: 3600,
            asset_storage_dir: PathBuf::from("./assets"),
            max_asset_size_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Task creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub poster_id: String,
    pub title: String,
    pub spec: String,
    pub reward: i64,
    pub bidding_deadline_seconds: Option<i64>,
    pub execution_deadline_seconds: Option<i64>,
    pub review_deadline_seconds: Option<i64>,
}

/// Bid submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBidRequest {
    pub bidder_id: String,
    pub proposal: String,
}

/// Bid acceptance request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptBidRequest {
    pub poster_id: String,
    pub bid_id: String,
}

/// Work submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWorkRequest {
    pub worker_id: String,
}

/// Approval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveTaskRequest {
    pub poster_id: String,
}

/// Dispute request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeTaskRequest {
    pub poster_id: String,
    pub reason: String,
}

/// Cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub poster_id: String,
}

/// Asset upload request; content travels base64-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAssetRequest {
    pub uploader_id: String,
    pub filename: String,
    pub content_type: String,
    pub content_base64: String,
}

/// What one sweep pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_bidding: u32,
    pub expired_execution: u32,
    pub auto_approved: u32,
}

#[derive(Clone)]
pub struct TaskBoardService {
    store: Store,
    events: EventLog,
    config: BoardConfig,
}

impl TaskBoardService {
    pub fn new(store: Store, events: EventLog, config: BoardConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Create a task and lock its escrow in one atomic unit. Any failed
    /// pre-condition aborts with no side effect.
    pub async fn create_task(&self, request: CreateTaskRequest) -> EconomyResult<Task> {
        id::ensure(id::AGENT, &request.poster_id, "agent")?;
        if request.title.trim().is_empty() {
            return Err(EconomyError::validation("title cannot be empty"));
        }
        if request.reward <= 0 {
            return Err(EconomyError::validation("reward must be positive"));
        }
        let bidding = request
            .bidding_deadline_seconds
            .unwrap_or(self.config.default_bidding_seconds);
        let execution = request
            .execution_deadline_seconds
            .unwrap_or(self.config.default_execution_seconds);
        let review = request
            .review_deadline_seconds
            .unwrap_or(self.config.default_review_seconds);
        if bidding <= 0 || execution <= 0 || review <= 0 {
            return Err(EconomyError::validation(
                "deadline durations must be positive",
            ));
        }

        let task_id = id::fresh(id::TASK);
        let mut tx = self.store.begin().await?;

        let (escrow, escrow_event) =
            BankService::lock_escrow_in(&mut tx, &request.poster_id, request.reward, &task_id)
                .await?;

        let mut task = Task::new(
            request.poster_id,
            request.title,
            request.spec,
            request.reward,
            bidding,
            execution,
            review,
            escrow.escrow_id,
        );
        task.task_id = task_id;

        sqlx::query(
            "INSERT INTO board_tasks
             (task_id, poster_id, title, spec, reward,
              bidding_seconds, execution_seconds, review_seconds,
              bidding_deadline, escrow_id, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.poster_id)
        .bind(&task.title)
        .bind(&task.spec)
        .bind(task.reward)
        .bind(task.bidding_seconds)
        .bind(task.execution_seconds)
        .bind(task.review_seconds)
        .bind(task.bidding_deadline)
        .bind(&task.escrow_id)
        .bind(task.status)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await?;

        let created = EventLog::append(
            &mut tx,
            EventPayload::TaskCreated {
                task_id: task.task_id.clone(),
                poster_id: task.poster_id.clone(),
                title: task.title.clone(),
                reward: task.reward,
            },
        )
        .await?;

        tx.commit().await?;
        self.events.publish_all([escrow_event, created]);
        info!(task_id = %task.task_id, poster = %task.poster_id, reward = task.reward, "task created");
        Ok(task)
    }

    /// Place a bid; one per (task, bidder), final once submitted.
    pub async fn place_bid(&self, task_id: &str, request: PlaceBidRequest) -> EconomyResult<Bid> {
        if request.proposal.trim().is_empty() {
            return Err(EconomyError::validation("proposal cannot be empty"));
        }

        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        if !task.status.can_bid() {
            return Err(EconomyError::conflict(format!(
                "task is {}, bids require open",
                task.status.as_str()
            )));
        }
        if request.bidder_id == task.poster_id {
            return Err(EconomyError::forbidden("poster cannot bid on own task"));
        }
        Self::ensure_registered(&mut tx, &request.bidder_id).await?;

        let bid = Bid {
            bid_id: id::fresh(id::BID),
            task_id: task.task_id.clone(),
            bidder_id: request.bidder_id,
            proposal: request.proposal,
            submitted_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO board_bids (bid_id, task_id, bidder_id, proposal, submitted_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&bid.bid_id)
        .bind(&bid.task_id)
        .bind(&bid.bidder_id)
        .bind(&bid.proposal)
        .bind(bid.submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_unique(err, "bid already placed for this task"))?;

        let event = EventLog::append(
            &mut tx,
            EventPayload::BidSubmitted {
                task_id: bid.task_id.clone(),
                bid_id: bid.bid_id.clone(),
                bidder_id: bid.bidder_id.clone(),
            },
        )
        .await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        Ok(bid)
    }

    /// Accept a bid: exactly one concurrent accept wins; the others fail
    /// with conflict reporting the observed status.
    pub async fn accept_bid(&self, task_id: &str, request: AcceptBidRequest) -> EconomyResult<Task> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        task.ensure_transition(task.status.can_accept(), TaskStatus::Accepted)?;
        if request.poster_id != task.poster_id {
            return Err(EconomyError::forbidden("only the poster can accept a bid"));
        }
        if now > task.bidding_deadline {
            return Err(EconomyError::conflict("bidding deadline has passed"));
        }

        let bid = sqlx::query_as::<_, Bid>(
            "SELECT bid_id, task_id, bidder_id, proposal, submitted_at
             FROM board_bids WHERE bid_id = ?",
        )
        .bind(&request.bid_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("bid {}", request.bid_id)))?;
        if bid.task_id != task.task_id {
            return Err(EconomyError::validation("bid belongs to a different task"));
        }

        let execution_deadline = now + Duration::seconds(task.execution_seconds);
        let updated = sqlx::query(
            "UPDATE board_tasks
             SET status = 'accepted', worker_id = ?, accepted_bid_id = ?,
                 accepted_at = ?, execution_deadline = ?
             WHERE task_id = ? AND status = 'open'",
        )
        .bind(&bid.bidder_id)
        .bind(&bid.bid_id)
        .bind(now)
        .bind(execution_deadline)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(&mut tx, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Accepted.as_str(),
                "another transition won",
            ));
        }

        let event = EventLog::append(
            &mut tx,
            EventPayload::TaskAccepted {
                task_id: task.task_id.clone(),
                bid_id: bid.bid_id.clone(),
                worker_id: bid.bidder_id.clone(),
            },
        )
        .await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        info!(task_id, worker = %bid.bidder_id, "bid accepted");
        Ok(task)
    }

    /// Worker submits delivered work; the review clock starts.
    pub async fn submit_work(
        &self,
        task_id: &str,
        request: SubmitWorkRequest,
    ) -> EconomyResult<Task> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        task.ensure_transition(task.status.can_submit(), TaskStatus::Submitted)?;
        if task.worker_id.as_deref() != Some(request.worker_id.as_str()) {
            return Err(EconomyError::forbidden(
                "only the assigned worker can submit",
            ));
        }
        match task.execution_deadline {
            Some(deadline) if now < deadline => {}
            _ => return Err(EconomyError::conflict("execution deadline has passed")),
        }

        let review_deadline = now + Duration::seconds(task.review_seconds);
        let updated = sqlx::query(
            "UPDATE board_tasks
             SET status = 'submitted', submitted_at = ?, review_deadline = ?
             WHERE task_id = ? AND status = 'accepted'",
        )
        .bind(now)
        .bind(review_deadline)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(&mut tx, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Submitted.as_str(),
                "another transition won",
            ));
        }

        let event = EventLog::append(
            &mut tx,
            EventPayload::TaskSubmitted {
                task_id: task.task_id.clone(),
                worker_id: request.worker_id.clone(),
            },
        )
        .await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        info!(task_id, "work submitted");
        Ok(task)
    }

    /// Poster approves the submission; escrow releases to the worker.
    pub async fn approve(&self, task_id: &str, request: ApproveTaskRequest) -> EconomyResult<Task> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        task.ensure_transition(task.status.can_approve(), TaskStatus::Approved)?;
        if request.poster_id != task.poster_id {
            return Err(EconomyError::forbidden("only the poster can approve"));
        }
        let worker = task
            .worker_id
            .clone()
            .ok_or_else(|| EconomyError::invariant("submitted task has no worker"))?;

        let updated = sqlx::query(
            "UPDATE board_tasks SET status = 'approved', approved_at = ?
             WHERE task_id = ? AND status = 'submitted'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(&mut tx, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Approved.as_str(),
                "another transition won",
            ));
        }

        let approved = EventLog::append(
            &mut tx,
            EventPayload::TaskApproved {
                task_id: task.task_id.clone(),
                poster_id: task.poster_id.clone(),
            },
        )
        .await?;
        let (_, released) =
            BankService::release_escrow_in(&mut tx, &task.escrow_id, &worker).await?;

        let task = Self::fetch_task(&mut tx, task_id).await?;
        tx.commit().await?;
        self.events.publish_all([approved, released]);
        info!(task_id, worker = %worker, "task approved");
        Ok(task)
    }

    /// Poster contests the submission; the court claim is filed in the
    /// same atomic unit.
    pub async fn dispute(
        &self,
        task_id: &str,
        request: DisputeTaskRequest,
    ) -> EconomyResult<(Task, Claim)> {
        if request.reason.trim().is_empty() {
            return Err(EconomyError::validation("dispute reason cannot be empty"));
        }
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        task.ensure_transition(task.status.can_dispute(), TaskStatus::Disputed)?;
        if request.poster_id != task.poster_id {
            return Err(EconomyError::forbidden("only the poster can dispute"));
        }
        match task.review_deadline {
            Some(deadline) if now < deadline => {}
            _ => return Err(EconomyError::conflict("review deadline has passed")),
        }

        let updated = sqlx::query(
            "UPDATE board_tasks SET status = 'disputed', disputed_at = ?, dispute_reason = ?
             WHERE task_id = ? AND status = 'submitted'",
        )
        .bind(now)
        .bind(&request.reason)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(&mut tx, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Disputed.as_str(),
                "another transition won",
            ));
        }

        let disputed = EventLog::append(
            &mut tx,
            EventPayload::TaskDisputed {
                task_id: task.task_id.clone(),
                poster_id: task.poster_id.clone(),
                reason: request.reason.clone(),
            },
        )
        .await?;

        let task = Self::fetch_task(&mut tx, task_id).await?;
        let (claim, filed) = CourtService::file_claim_in(
            &mut tx,
            &task,
            &request.reason,
            self.config.rebuttal_window_seconds,
        )
        .await?;

        tx.commit().await?;
        self.events.publish_all([disputed, filed]);
        info!(task_id, claim_id = %claim.claim_id, "task disputed");
        Ok((task, claim))
    }

    /// Poster withdraws an open task; escrow returns to the poster.
    pub async fn cancel(&self, task_id: &str, request: CancelTaskRequest) -> EconomyResult<Task> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        task.ensure_transition(task.status.can_cancel(), TaskStatus::Cancelled)?;
        if request.poster_id != task.poster_id {
            return Err(EconomyError::forbidden("only the poster can cancel"));
        }

        let updated = sqlx::query(
            "UPDATE board_tasks SET status = 'cancelled', cancelled_at = ?
             WHERE task_id = ? AND status = 'open'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(&mut tx, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Cancelled.as_str(),
                "another transition won",
            ));
        }

        let cancelled = EventLog::append(
            &mut tx,
            EventPayload::TaskCancelled {
                task_id: task.task_id.clone(),
                poster_id: task.poster_id.clone(),
            },
        )
        .await?;
        let (_, released) =
            BankService::release_escrow_in(&mut tx, &task.escrow_id, &task.poster_id).await?;

        let task = Self::fetch_task(&mut tx, task_id).await?;
        tx.commit().await?;
        self.events.publish_all([cancelled, released]);
        info!(task_id, "task cancelled");
        Ok(task)
    }

    /// Record a court ruling on the task. Court-internal; runs inside the
    /// court's ruling transaction.
    pub async fn apply_ruling_in(
        conn: &mut SqliteConnection,
        task_id: &str,
        ruling_id: &str,
        worker_pct: i64,
        summary: &str,
    ) -> EconomyResult<(Task, Event)> {
        let task = Self::fetch_task(conn, task_id).await?;
        task.ensure_transition(task.status.can_rule(), TaskStatus::Ruled)?;

        let updated = sqlx::query(
            "UPDATE board_tasks
             SET status = 'ruled', ruled_at = ?, ruling_id = ?, worker_pct = ?, ruling_summary = ?
             WHERE task_id = ? AND status = 'disputed'",
        )
        .bind(Utc::now())
        .bind(ruling_id)
        .bind(worker_pct)
        .bind(summary)
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
        if updated.rows_affected() == 0 {
            let observed = Self::fetch_task(conn, task_id).await?;
            return Err(EconomyError::transition(
                observed.status.as_str(),
                TaskStatus::Ruled.as_str(),
                "another transition won",
            ));
        }

        let event = EventLog::append(
            conn,
            EventPayload::TaskRuled {
                task_id: task_id.to_string(),
                ruling_id: ruling_id.to_string(),
                worker_pct,
            },
        )
        .await?;
        let task = Self::fetch_task(conn, task_id).await?;
        Ok((task, event))
    }

    /// Store a deliverable: worker-only, `accepted` only, size-capped.
    /// The blob lands under the asset storage dir; the row and event commit
    /// atomically, and the blob is removed again if they cannot.
    pub async fn upload_asset(
        &self,
        task_id: &str,
        request: UploadAssetRequest,
    ) -> EconomyResult<Asset> {
        if request.filename.trim().is_empty() || request.filename.contains(['/', '\\']) {
            return Err(EconomyError::validation("invalid asset filename"));
        }
        let content = BASE64
            .decode(&request.content_base64)
            .map_err(|_| EconomyError::validation("asset content is not valid base64"))?;
        if content.len() as u64 > self.config.max_asset_size_bytes {
            return Err(EconomyError::validation(format!(
                "asset exceeds {} bytes",
                self.config.max_asset_size_bytes
            )));
        }

        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        if !task.status.can_upload_asset() {
            return Err(EconomyError::conflict(format!(
                "task is {}, uploads require accepted",
                task.status.as_str()
            )));
        }
        if task.worker_id.as_deref() != Some(request.uploader_id.as_str()) {
            return Err(EconomyError::forbidden(
                "only the assigned worker can upload assets",
            ));
        }

        let asset_id = id::fresh(id::ASSET);
        let dir = self.config.asset_storage_dir.join(task_id);
        let path = dir.join(&asset_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| EconomyError::internal(format!("asset dir: {}", err)))?;
        tokio::fs::write(&path, &content)
            .await
            .map_err(|err| EconomyError::internal(format!("asset write: {}", err)))?;

        let asset = Asset {
            asset_id,
            task_id: task.task_id.clone(),
            uploader_id: request.uploader_id,
            filename: request.filename,
            content_type: request.content_type,
            size_bytes: content.len() as i64,
            storage_path: path.to_string_lossy().into_owned(),
            uploaded_at: Utc::now(),
        };

        let stored = async {
            sqlx::query(
                "INSERT INTO board_assets
                 (asset_id, task_id, uploader_id, filename, content_type,
                  size_bytes, storage_path, uploaded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&asset.asset_id)
            .bind(&asset.task_id)
            .bind(&asset.uploader_id)
            .bind(&asset.filename)
            .bind(&asset.content_type)
            .bind(asset.size_bytes)
            .bind(&asset.storage_path)
            .bind(asset.uploaded_at)
            .execute(&mut *tx)
            .await?;

            let event = EventLog::append(
                &mut tx,
                EventPayload::AssetUploaded {
                    task_id: asset.task_id.clone(),
                    asset_id: asset.asset_id.clone(),
                    uploader_id: asset.uploader_id.clone(),
                    filename: asset.filename.clone(),
                    size_bytes: asset.size_bytes,
                },
            )
            .await?;
            tx.commit().await?;
            Ok::<Event, EconomyError>(event)
        }
        .await;

        match stored {
            Ok(event) => {
                self.events.publish_all([event]);
                info!(task_id, asset_id = %asset.asset_id, "asset uploaded");
                Ok(asset)
            }
            Err(err) => {
                // The row never committed; take the blob back out too.
                if let Err(remove) = tokio::fs::remove_file(&path).await {
                    warn!(path = %asset.storage_path, "orphan asset blob left behind: {}", remove);
                }
                Err(err)
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> EconomyResult<Task> {
        let mut conn = self.store.pool().acquire().await?;
        Self::fetch_task(&mut conn, task_id).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> EconomyResult<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "{} WHERE status = ? ORDER BY created_at",
                    TASK_SELECT
                ))
                .bind(status)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Task>(&format!("{} ORDER BY created_at", TASK_SELECT))
                    .fetch_all(self.store.pool())
                    .await?
            }
        };
        Ok(rows)
    }

    /// Bids are open books; they remain attached to the task for audit.
    pub async fn list_bids(&self, task_id: &str) -> EconomyResult<Vec<Bid>> {
        Ok(sqlx::query_as::<_, Bid>(
            "SELECT bid_id, task_id, bidder_id, proposal, submitted_at
             FROM board_bids WHERE task_id = ? ORDER BY submitted_at, bid_id",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?)
    }

    /// Asset listing is restricted to the poster, the worker and the Court
    /// (`requester = None` is the internal court path).
    pub async fn list_assets(
        &self,
        task_id: &str,
        requester: Option<&str>,
    ) -> EconomyResult<Vec<Asset>> {
        let task = self.get_task(task_id).await?;
        if let Some(agent) = requester {
            let participant =
                agent == task.poster_id || task.worker_id.as_deref() == Some(agent);
            if !participant {
                return Err(EconomyError::forbidden(
                    "assets are visible to poster and worker only",
                ));
            }
        }
        Self::assets_for_task(self.store.pool(), task_id).await
    }

    pub(crate) async fn assets_for_task(
        pool: &sqlx::SqlitePool,
        task_id: &str,
    ) -> EconomyResult<Vec<Asset>> {
        Ok(sqlx::query_as::<_, Asset>(
            "SELECT asset_id, task_id, uploader_id, filename, content_type,
                    size_bytes, storage_path, uploaded_at
             FROM board_assets WHERE task_id = ? ORDER BY uploaded_at, asset_id",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?)
    }

    /// One sweep pass. Expired-bidding is checked before expired-execution;
    /// each action is a guarded transition, so a repeated pass is a no-op.
    pub async fn sweep(&self) -> EconomyResult<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for task in self.list_tasks(Some(TaskStatus::Open)).await? {
            if now >= task.bidding_deadline
                && self
                    .expire_task(&task.task_id, ExpiryReason::Bidding)
                    .await?
            {
                report.expired_bidding += 1;
            }
        }

        for task in self.list_tasks(Some(TaskStatus::Accepted)).await? {
            if matches!(task.execution_deadline, Some(deadline) if now >= deadline)
                && self
                    .expire_task(&task.task_id, ExpiryReason::Execution)
                    .await?
            {
                report.expired_execution += 1;
            }
        }

        for task in self.list_tasks(Some(TaskStatus::Submitted)).await? {
            if matches!(task.review_deadline, Some(deadline) if now >= deadline)
                && self.auto_approve(&task.task_id).await?
            {
                report.auto_approved += 1;
            }
        }

        Ok(report)
    }

    /// Expire one task and return its escrow to the poster. Returns false
    /// when some other transition already won.
    async fn expire_task(&self, task_id: &str, reason: ExpiryReason) -> EconomyResult<bool> {
        let expected = match reason {
            ExpiryReason::Bidding => TaskStatus::Open,
            ExpiryReason::Execution => TaskStatus::Accepted,
        };
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        if task.status != expected {
            return Ok(false);
        }

        let updated = sqlx::query(
            "UPDATE board_tasks SET status = 'expired', expired_at = ?, expired_reason = ?
             WHERE task_id = ? AND status = ?",
        )
        .bind(Utc::now())
        .bind(reason.as_str())
        .bind(task_id)
        .bind(expected)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        let expired = EventLog::append(
            &mut tx,
            EventPayload::TaskExpired {
                task_id: task.task_id.clone(),
                reason: reason.as_str().to_string(),
            },
        )
        .await?;
        let (_, released) =
            BankService::release_escrow_in(&mut tx, &task.escrow_id, &task.poster_id).await?;
        tx.commit().await?;
        self.events.publish_all([expired, released]);
        info!(task_id, reason = reason.as_str(), "task expired");
        Ok(true)
    }

    /// Review timeout: approve with `auto = true`, escrow to the worker.
    async fn auto_approve(&self, task_id: &str) -> EconomyResult<bool> {
        let mut tx = self.store.begin().await?;
        let task = Self::fetch_task(&mut tx, task_id).await?;
        if task.status != TaskStatus::Submitted {
            return Ok(false);
        }
        let worker = task
            .worker_id
            .clone()
            .ok_or_else(|| EconomyError::invariant("submitted task has no worker"))?;

        let updated = sqlx::query(
            "UPDATE board_tasks SET status = 'approved', approved_at = ?
             WHERE task_id = ? AND status = 'submitted'",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        let approved = EventLog::append(
            &mut tx,
            EventPayload::TaskAutoApproved {
                task_id: task.task_id.clone(),
                auto: true,
            },
        )
        .await?;
        let (_, released) =
            BankService::release_escrow_in(&mut tx, &task.escrow_id, &worker).await?;
        tx.commit().await?;
        self.events.publish_all([approved, released]);
        info!(task_id, "task auto-approved on review timeout");
        Ok(true)
    }

    pub(crate) async fn fetch_task(
        conn: &mut SqliteConnection,
        task_id: &str,
    ) -> EconomyResult<Task> {
        sqlx::query_as::<_, Task>(&format!("{} WHERE task_id = ?", TASK_SELECT))
            .bind(task_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| EconomyError::not_found(format!("task {}", task_id)))
    }

    async fn ensure_registered(conn: &mut SqliteConnection, agent_id: &str) -> EconomyResult<()> {
        let found = sqlx::query("SELECT agent_id FROM identity_agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_none() {
            return Err(EconomyError::unauthorized(format!(
                "agent {} is not registered",
                agent_id
            )));
        }
        Ok(())
    }
}

const TASK_SELECT: &str = "SELECT task_id, poster_id, title, spec, reward,
        bidding_seconds, execution_seconds, review_seconds,
        bidding_deadline, execution_deadline, review_deadline,
        escrow_id, worker_id, accepted_bid_id, dispute_reason,
        ruling_id, worker_pct, ruling_summary, status, expired_reason,
        created_at, accepted_at, submitted_at, approved_at,
        cancelled_at, disputed_at, ruled_at, expired_at
    FROM board_tasks";
