//! Economy node: constructs and wires every service
//!
//! One node owns the store, the event bus and the five services; the HTTP
//! layer and the schedulers borrow from here. The judge panel is chosen
//! from settings: an HTTP panel when an endpoint is configured, otherwise
//! the abstaining null panel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use agora_core::EconomyResult;

use crate::bank::BankService;
use crate::board::TaskBoardService;
use crate::config::Settings;
use crate::court::{CourtConfig, CourtService};
use crate::events::{self, Event, EventLog};
use crate::identity::IdentityService;
use crate::judge::{HttpJudgePanel, JudgePanel, NullJudgePanel};
use crate::reputation::ReputationService;
use crate::scheduler::{SalaryScheduler, Sweeper};
use crate::store::Store;

pub struct EconomyNode {
    settings: Settings,
    store: Store,
    events: EventLog,
    identity: IdentityService,
    bank: BankService,
    board: TaskBoardService,
    reputation: ReputationService,
    court: CourtService,
}

/// Node health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl EconomyNode {
    /// Build a node from settings, picking the judge panel from
    /// `judge_panel_url`.
    pub async fn new(settings: Settings) -> EconomyResult<Self> {
        let panel: Arc<dyn JudgePanel> = match &settings.judge_panel_url {
            Some(url) => Arc::new(HttpJudgePanel::new(url.clone())),
            None => Arc::new(NullJudgePanel),
        };
        Self::with_judge_panel(settings, panel).await
    }

    /// Build a node with an explicit judge panel (tests and embedders).
    pub async fn with_judge_panel(
        settings: Settings,
        panel: Arc<dyn JudgePanel>,
    ) -> EconomyResult<Self> {
        let store = Store::open(&settings.database_path).await?;
        let events = EventLog::new();

        let identity = IdentityService::new(store.clone(), events.clone());
        let bank = BankService::new(store.clone(), events.clone());
        let board = TaskBoardService::new(store.clone(), events.clone(), settings.board_config());
        let reputation =
            ReputationService::new(store.clone(), events.clone(), settings.reputation_config());
        let court = CourtService::new(
            store.clone(),
            events.clone(),
            panel,
            CourtConfig {
                judge_panel_size: settings.judge_panel_size,
                judge_timeout: Duration::from_secs(settings.judge_timeout_seconds),
                rebuttal_window_seconds: settings.rebuttal_window_seconds(),
            },
        );

        info!("economy node initialized");
        Ok(Self {
            settings,
            store,
            events,
            identity,
            bank,
            board,
            reputation,
            court,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn bank(&self) -> &BankService {
        &self.bank
    }

    pub fn board(&self) -> &TaskBoardService {
        &self.board
    }

    pub fn reputation(&self) -> &ReputationService {
        &self.reputation
    }

    pub fn court(&self) -> &CourtService {
        &self.court
    }

    /// Lifecycle sweeper ready to spawn
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            self.board.clone(),
            self.court.clone(),
            Duration::from_secs(self.settings.sweep_interval_seconds.max(1)),
        )
    }

    /// Salary scheduler ready to spawn
    pub fn salary_scheduler(&self) -> SalaryScheduler {
        SalaryScheduler::new(
            self.store.clone(),
            self.bank.clone(),
            self.settings.salary_amount,
            Duration::from_secs(self.settings.salary_period_seconds.max(1)),
        )
    }

    /// Event catch-up passthrough for the read surface
    pub async fn events_after(&self, after: i64, limit: i64) -> EconomyResult<Vec<Event>> {
        events::events_after(&self.store, after, limit).await
    }

    pub async fn events_for_task(&self, task_id: &str) -> EconomyResult<Vec<Event>> {
        events::events_for_task(&self.store, task_id).await
    }

    /// Cheap liveness plus the ledger conservation check
    pub async fn health(&self) -> NodeHealth {
        let mut issues = Vec::new();

        if let Err(err) = sqlx::query("SELECT 1").execute(self.store.pool()).await {
            issues.push(format!("store: {}", err));
        }
        match self.bank.audit().await {
            Ok(audit) if !audit.consistent => {
                issues.push("ledger conservation violated".to_string())
            }
            Ok(_) => {}
            Err(err) => issues.push(format!("audit: {}", err)),
        }

        NodeHealth {
            healthy: issues.is_empty(),
            issues,
            timestamp: Utc::now(),
        }
    }
}
