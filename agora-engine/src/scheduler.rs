//! Process-wide periodic jobs
//!
//! Two schedulers run per node: the lifecycle sweeper (task deadlines plus
//! court rebuttal windows) and the salary payer. Each takes a startup
//! advisory lock on a well-known row so a second instance of the same
//! service refuses to double-fire, and a crashed holder is taken over once
//! its heartbeat goes stale.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agora_core::{EconomyError, EconomyResult};

use crate::bank::BankService;
use crate::board::TaskBoardService;
use crate::court::CourtService;
use crate::store::Store;

/// A holder whose heartbeat is older than this is considered dead.
const LOCK_STALE_AFTER_SECONDS: i64 = 60;

/// Take (or take over) the advisory lock row for `service`.
async fn acquire_advisory_lock(
    store: &Store,
    service: &str,
    instance: &str,
) -> EconomyResult<()> {
    let now = Utc::now();
    let stale_cutoff = now - chrono::Duration::seconds(LOCK_STALE_AFTER_SECONDS);
    sqlx::query(
        "INSERT INTO scheduler_locks (service, instance, heartbeat_at) VALUES (?, ?, ?)
         ON CONFLICT(service) DO UPDATE
            SET instance = excluded.instance, heartbeat_at = excluded.heartbeat_at
          WHERE scheduler_locks.heartbeat_at < ?",
    )
    .bind(service)
    .bind(instance)
    .bind(now)
    .bind(stale_cutoff)
    .execute(store.pool())
    .await?;

    let holder: String = sqlx::query_scalar("SELECT instance FROM scheduler_locks WHERE service = ?")
        .bind(service)
        .fetch_one(store.pool())
        .await?;
    if holder == instance {
        info!(service, instance, "advisory lock acquired");
        Ok(())
    } else {
        Err(EconomyError::conflict(format!(
            "another {} instance holds the scheduler lock",
            service
        )))
    }
}

/// Refresh our heartbeat; false means the lock was taken over.
async fn heartbeat(store: &Store, service: &str, instance: &str) -> EconomyResult<bool> {
    let updated = sqlx::query(
        "UPDATE scheduler_locks SET heartbeat_at = ? WHERE service = ? AND instance = ?",
    )
    .bind(Utc::now())
    .bind(service)
    .bind(instance)
    .execute(store.pool())
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Drives the time-based transitions: task deadline expiry / auto-approval
/// and court rebuttal-window expiry. One pass is idempotent, so the
/// cadence only bounds reaction latency.
pub struct Sweeper {
    store: Store,
    board: TaskBoardService,
    court: CourtService,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Store,
        board: TaskBoardService,
        court: CourtService,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            board,
            court,
            interval,
        }
    }

    pub async fn run(self) {
        let instance = Uuid::new_v4().to_string();
        if let Err(err) = acquire_advisory_lock(&self.store, "board_sweeper", &instance).await {
            error!("sweeper not started: {}", err);
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match heartbeat(&self.store, "board_sweeper", &instance).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("sweeper lock taken over; stopping");
                    return;
                }
                Err(err) => {
                    warn!("sweeper heartbeat failed: {}", err);
                    continue;
                }
            }

            match self.board.sweep().await {
                Ok(report)
                    if report.expired_bidding + report.expired_execution + report.auto_approved
                        > 0 =>
                {
                    info!(
                        expired_bidding = report.expired_bidding,
                        expired_execution = report.expired_execution,
                        auto_approved = report.auto_approved,
                        "sweep pass"
                    );
                }
                Ok(_) => debug!("sweep pass: nothing due"),
                Err(err) => warn!("sweep pass failed: {}", err),
            }

            match self.court.expire_rebuttals().await {
                Ok(claims) => {
                    for claim_id in claims {
                        let court = self.court.clone();
                        tokio::spawn(async move {
                            if let Err(err) = court.run_judging(&claim_id).await {
                                warn!(%claim_id, "judging failed: {}", err);
                            }
                        });
                    }
                }
                Err(err) => warn!("rebuttal expiry failed: {}", err),
            }
        }
    }
}

/// Pays every account the configured salary once per period. The round id
/// derives from wall-clock epochs, so a crash and restart inside one period
/// re-issues the same round and the credit idempotency key absorbs it.
pub struct SalaryScheduler {
    store: Store,
    bank: BankService,
    amount: i64,
    period: Duration,
}

impl SalaryScheduler {
    pub fn new(store: Store, bank: BankService, amount: i64, period: Duration) -> Self {
        Self {
            store,
            bank,
            amount,
            period,
        }
    }

    pub async fn run(self) {
        let instance = Uuid::new_v4().to_string();
        if let Err(err) = acquire_advisory_lock(&self.store, "bank_salary", &instance).await {
            error!("salary scheduler not started: {}", err);
            return;
        }

        let period_seconds = self.period.as_secs().max(1) as i64;
        let mut ticker = tokio::time::interval(self.period);
        loop {
            ticker.tick().await;
            match heartbeat(&self.store, "bank_salary", &instance).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("salary lock taken over; stopping");
                    return;
                }
                Err(err) => {
                    warn!("salary heartbeat failed: {}", err);
                    continue;
                }
            }

            let round_id = Utc::now().timestamp() / period_seconds;
            match self.bank.pay_salary(round_id, self.amount).await {
                Ok(credited) if !credited.is_empty() => {
                    info!(round_id, count = credited.len(), "salary round paid");
                }
                Ok(_) => debug!(round_id, "salary round already paid"),
                Err(err) => warn!(round_id, "salary round failed: {}", err),
            }
        }
    }
}
