//! Central bank: accounts, ledger, escrow
//!
//! All money movement funnels through here. Credits are idempotent on
//! (account, reference); escrow resolution is exactly-once because the
//! status transition out of `locked` is a guarded update. Every operation
//! writes its transaction row, its escrow row where applicable, and its
//! event inside one store transaction.

use chrono::Utc;
use sqlx::SqliteConnection;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use agora_core::{id, EconomyError, EconomyResult};

use crate::events::{Event, EventLog, EventPayload};
use crate::models::{Account, Escrow, EscrowStatus, LedgerTransaction, TxKind};
use crate::store::Store;

/// Attempts for transient storage failures on idempotent operations
const IDEMPOTENT_RETRIES: u32 = 3;

/// Conservation check over the whole ledger
#[derive(Debug, Clone)]
pub struct LedgerAudit {
    /// Sum of plain credits (salary, top-ups)
    pub credits: i64,
    /// Sum of escrow payouts back into balances
    pub escrow_payouts: i64,
    /// Sum of funds ever moved into escrow
    pub escrow_locks: i64,
    /// Sum of spendable balances right now
    pub spendable: i64,
    /// Sum of escrows still locked
    pub locked_outstanding: i64,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct BankService {
    store: Store,
    events: EventLog,
}

impl BankService {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    /// Open an account for `agent_id`; a second call is a no-op.
    pub async fn open_account(&self, agent_id: &str) -> EconomyResult<Account> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(50);
        loop {
            let result: EconomyResult<Account> = async {
                let mut tx = self.store.begin().await?;
                let (account, event) = Self::open_account_in(&mut tx, agent_id).await?;
                tx.commit().await?;
                self.events.publish_all(event);
                Ok(account)
            }
            .await;
            match result {
                Err(err) if err.is_transient() && attempt + 1 < IDEMPOTENT_RETRIES => {
                    attempt += 1;
                    warn!(agent_id, attempt, "open_account retrying after {}", err);
                    sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    /// Open an account inside the caller's transaction. Returns the event
    /// only when the account is actually new.
    pub async fn open_account_in(
        conn: &mut SqliteConnection,
        agent_id: &str,
    ) -> EconomyResult<(Account, Option<Event>)> {
        id::ensure(id::AGENT, agent_id, "agent")?;
        if let Some(existing) = Self::fetch_account(conn, agent_id).await? {
            return Ok((existing, None));
        }

        let account = Account {
            account_id: agent_id.to_string(),
            balance: 0,
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO bank_accounts (account_id, balance, created_at) VALUES (?, 0, ?)")
            .bind(&account.account_id)
            .bind(account.created_at)
            .execute(&mut *conn)
            .await?;

        let event = EventLog::append(
            conn,
            EventPayload::AccountCreated {
                account_id: account.account_id.clone(),
            },
        )
        .await?;
        Ok((account, Some(event)))
    }

    pub async fn get_account(&self, account_id: &str) -> EconomyResult<Account> {
        sqlx::query_as::<_, Account>(
            "SELECT account_id, balance, created_at FROM bank_accounts WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("account {}", account_id)))
    }

    /// Transaction history, oldest first
    pub async fn transactions(&self, account_id: &str) -> EconomyResult<Vec<LedgerTransaction>> {
        Ok(sqlx::query_as::<_, LedgerTransaction>(
            "SELECT tx_id, account_id, kind, amount, resulting_balance, reference, created_at
             FROM bank_transactions WHERE account_id = ? ORDER BY created_at, tx_id",
        )
        .bind(account_id)
        .fetch_all(self.store.pool())
        .await?)
    }

    pub async fn get_escrow(&self, escrow_id: &str) -> EconomyResult<Escrow> {
        sqlx::query_as::<_, Escrow>(
            "SELECT escrow_id, payer_account_id, amount, task_id, status, created_at, resolved_at
             FROM bank_escrows WHERE escrow_id = ?",
        )
        .bind(escrow_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("escrow {}", escrow_id)))
    }

    /// Idempotent credit: a replay with the same (account, reference)
    /// returns the earlier transaction unchanged.
    pub async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        reference: &str,
    ) -> EconomyResult<LedgerTransaction> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(50);
        loop {
            let result: EconomyResult<LedgerTransaction> = async {
                let mut tx = self.store.begin().await?;
                let (entry, _) = Self::credit_in(&mut tx, account_id, amount, reference).await?;
                tx.commit().await?;
                Ok(entry)
            }
            .await;
            match result {
                Err(err) if err.is_transient() && attempt + 1 < IDEMPOTENT_RETRIES => {
                    attempt += 1;
                    warn!(account_id, reference, attempt, "credit retrying after {}", err);
                    sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    /// Credit inside the caller's transaction; the bool reports whether a
    /// new ledger row was written.
    pub async fn credit_in(
        conn: &mut SqliteConnection,
        account_id: &str,
        amount: i64,
        reference: &str,
    ) -> EconomyResult<(LedgerTransaction, bool)> {
        if amount <= 0 {
            return Err(EconomyError::validation("credit amount must be positive"));
        }
        if let Some(existing) = sqlx::query_as::<_, LedgerTransaction>(
            "SELECT tx_id, account_id, kind, amount, resulting_balance, reference, created_at
             FROM bank_transactions
             WHERE account_id = ? AND reference = ? AND kind = 'credit'",
        )
        .bind(account_id)
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await?
        {
            return Ok((existing, false));
        }

        let entry =
            Self::write_ledger_entry(conn, account_id, TxKind::Credit, amount, reference).await?;
        Ok((entry, true))
    }

    /// Lock `amount` from the payer's spendable balance for a task.
    pub async fn lock_escrow(
        &self,
        payer: &str,
        amount: i64,
        task_id: &str,
    ) -> EconomyResult<Escrow> {
        let mut tx = self.store.begin().await?;
        let (escrow, event) = Self::lock_escrow_in(&mut tx, payer, amount, task_id).await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        Ok(escrow)
    }

    pub async fn lock_escrow_in(
        conn: &mut SqliteConnection,
        payer: &str,
        amount: i64,
        task_id: &str,
    ) -> EconomyResult<(Escrow, Event)> {
        if amount <= 0 {
            return Err(EconomyError::validation("escrow amount must be positive"));
        }

        let account = Self::fetch_account(conn, payer)
            .await?
            .ok_or_else(|| EconomyError::not_found(format!("account {}", payer)))?;
        if account.balance < amount {
            return Err(EconomyError::InsufficientFunds {
                balance: account.balance,
                required: amount,
            });
        }

        let active = sqlx::query(
            "SELECT escrow_id FROM bank_escrows
             WHERE payer_account_id = ? AND task_id = ? AND status = 'locked'",
        )
        .bind(payer)
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;
        if active.is_some() {
            return Err(EconomyError::EscrowExists {
                payer: payer.to_string(),
                task_id: task_id.to_string(),
            });
        }

        Self::write_ledger_entry(
            conn,
            payer,
            TxKind::EscrowLock,
            amount,
            &format!("escrow_lock_{}", task_id),
        )
        .await?;

        let escrow = Escrow {
            escrow_id: id::fresh(id::ESCROW),
            payer_account_id: payer.to_string(),
            amount,
            task_id: task_id.to_string(),
            status: EscrowStatus::Locked,
            created_at: Utc::now(),
            resolved_at: None,
        };
        sqlx::query(
            "INSERT INTO bank_escrows
             (escrow_id, payer_account_id, amount, task_id, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&escrow.escrow_id)
        .bind(&escrow.payer_account_id)
        .bind(escrow.amount)
        .bind(&escrow.task_id)
        .bind(escrow.status)
        .bind(escrow.created_at)
        .execute(&mut *conn)
        .await?;

        let event = EventLog::append(
            conn,
            EventPayload::EscrowLocked {
                escrow_id: escrow.escrow_id.clone(),
                task_id: escrow.task_id.clone(),
                payer_id: escrow.payer_account_id.clone(),
                amount,
            },
        )
        .await?;
        info!(escrow_id = %escrow.escrow_id, task_id, amount, "escrow locked");
        Ok((escrow, event))
    }

    /// Release the full escrow amount to a single recipient. Valid only
    /// from `locked`.
    pub async fn release_escrow(&self, escrow_id: &str, recipient: &str) -> EconomyResult<Escrow> {
        let mut tx = self.store.begin().await?;
        let (escrow, event) = Self::release_escrow_in(&mut tx, escrow_id, recipient).await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        Ok(escrow)
    }

    pub async fn release_escrow_in(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        recipient: &str,
    ) -> EconomyResult<(Escrow, Event)> {
        let mut escrow = Self::resolve_escrow(conn, escrow_id, EscrowStatus::Released).await?;
        escrow.status = EscrowStatus::Released;

        Self::write_ledger_entry(
            conn,
            recipient,
            TxKind::EscrowRelease,
            escrow.amount,
            &format!("escrow_release_{}", escrow_id),
        )
        .await?;

        let event = EventLog::append(
            conn,
            EventPayload::EscrowReleased {
                escrow_id: escrow.escrow_id.clone(),
                task_id: escrow.task_id.clone(),
                recipient_id: recipient.to_string(),
                amount: escrow.amount,
            },
        )
        .await?;
        info!(escrow_id, recipient, amount = escrow.amount, "escrow released");
        Ok((escrow, event))
    }

    /// Split the escrow between worker and poster by the ruled percentage.
    /// The worker share is floored; the two credits sum exactly to the
    /// original amount; zero-amount credits are skipped.
    pub async fn split_escrow(
        &self,
        escrow_id: &str,
        worker_pct: i64,
        worker: &str,
        poster: &str,
    ) -> EconomyResult<Escrow> {
        let mut tx = self.store.begin().await?;
        let (escrow, event) =
            Self::split_escrow_in(&mut tx, escrow_id, worker_pct, worker, poster).await?;
        tx.commit().await?;
        self.events.publish_all([event]);
        Ok(escrow)
    }

    pub async fn split_escrow_in(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        worker_pct: i64,
        worker: &str,
        poster: &str,
    ) -> EconomyResult<(Escrow, Event)> {
        if !(0..=100).contains(&worker_pct) {
            return Err(EconomyError::validation(
                "worker percentage must lie in [0, 100]",
            ));
        }

        let mut escrow = Self::resolve_escrow(conn, escrow_id, EscrowStatus::Split).await?;
        escrow.status = EscrowStatus::Split;

        let worker_amount = escrow.amount * worker_pct / 100;
        let poster_amount = escrow.amount - worker_amount;

        if worker_amount > 0 {
            Self::write_ledger_entry(
                conn,
                worker,
                TxKind::EscrowRelease,
                worker_amount,
                &format!("escrow_split_{}_worker", escrow_id),
            )
            .await?;
        }
        if poster_amount > 0 {
            Self::write_ledger_entry(
                conn,
                poster,
                TxKind::EscrowRelease,
                poster_amount,
                &format!("escrow_split_{}_poster", escrow_id),
            )
            .await?;
        }

        let event = EventLog::append(
            conn,
            EventPayload::EscrowSplit {
                escrow_id: escrow.escrow_id.clone(),
                task_id: escrow.task_id.clone(),
                worker_id: worker.to_string(),
                poster_id: poster.to_string(),
                worker_pct,
                worker_amount,
                poster_amount,
            },
        )
        .await?;
        info!(escrow_id, worker_pct, worker_amount, poster_amount, "escrow split");
        Ok((escrow, event))
    }

    /// Credit every account `amount` for salary round `round_id`. The
    /// shared reference makes re-invocation with the same round a no-op.
    pub async fn pay_salary(&self, round_id: i64, amount: i64) -> EconomyResult<Vec<String>> {
        if amount <= 0 {
            return Err(EconomyError::validation("salary amount must be positive"));
        }
        let reference = format!("salary_round_{}", round_id);

        let mut tx = self.store.begin().await?;
        let accounts: Vec<String> =
            sqlx::query_scalar("SELECT account_id FROM bank_accounts ORDER BY account_id")
                .fetch_all(&mut *tx)
                .await?;

        let mut credited = Vec::new();
        for account in &accounts {
            let (_, fresh) = Self::credit_in(&mut tx, account, amount, &reference).await?;
            if fresh {
                credited.push(account.clone());
            }
        }

        let mut events = Vec::new();
        if !credited.is_empty() {
            events.push(
                EventLog::append(
                    &mut tx,
                    EventPayload::SalaryPaid {
                        round_id,
                        amount,
                        accounts: credited.clone(),
                    },
                )
                .await?,
            );
            info!(round_id, amount, count = credited.len(), "salary paid");
        }
        tx.commit().await?;
        self.events.publish_all(events);
        Ok(credited)
    }

    /// Recompute the conservation invariant: inflows minus locks equals
    /// spendable balances, and unresolved locks match the escrow table.
    /// A violation appends `system.invariant_violation`.
    pub async fn audit(&self) -> EconomyResult<LedgerAudit> {
        let credits = self.sum_transactions("credit").await?;
        let escrow_payouts = self.sum_transactions("escrow_release").await?;
        let escrow_locks = self.sum_transactions("escrow_lock").await?;
        let spendable: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0) FROM bank_accounts")
                .fetch_one(self.store.pool())
                .await?;
        let locked_outstanding: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM bank_escrows WHERE status = 'locked'",
        )
        .fetch_one(self.store.pool())
        .await?;

        let consistent = credits + escrow_payouts - escrow_locks == spendable
            && escrow_locks - escrow_payouts == locked_outstanding;

        if !consistent {
            warn!(
                credits,
                escrow_payouts, escrow_locks, spendable, locked_outstanding, "ledger inconsistent"
            );
            let mut tx = self.store.begin().await?;
            let event = EventLog::append(
                &mut tx,
                EventPayload::InvariantViolation {
                    context: format!(
                        "ledger: credits {} + payouts {} - locks {} != spendable {} (locked {})",
                        credits, escrow_payouts, escrow_locks, spendable, locked_outstanding
                    ),
                },
            )
            .await?;
            tx.commit().await?;
            self.events.publish_all([event]);
        }

        Ok(LedgerAudit {
            credits,
            escrow_payouts,
            escrow_locks,
            spendable,
            locked_outstanding,
            consistent,
        })
    }

    async fn sum_transactions(&self, kind: &str) -> EconomyResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM bank_transactions WHERE kind = ?",
        )
        .bind(kind)
        .fetch_one(self.store.pool())
        .await?)
    }

    async fn fetch_account(
        conn: &mut SqliteConnection,
        account_id: &str,
    ) -> EconomyResult<Option<Account>> {
        Ok(sqlx::query_as::<_, Account>(
            "SELECT account_id, balance, created_at FROM bank_accounts WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Flip an escrow out of `locked` with a guarded update; the loser of a
    /// concurrent resolution observes `conflict`.
    async fn resolve_escrow(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        to: EscrowStatus,
    ) -> EconomyResult<Escrow> {
        let escrow = sqlx::query_as::<_, Escrow>(
            "SELECT escrow_id, payer_account_id, amount, task_id, status, created_at, resolved_at
             FROM bank_escrows WHERE escrow_id = ?",
        )
        .bind(escrow_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("escrow {}", escrow_id)))?;

        let updated = sqlx::query(
            "UPDATE bank_escrows SET status = ?, resolved_at = ?
             WHERE escrow_id = ? AND status = 'locked'",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(escrow_id)
        .execute(&mut *conn)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EconomyError::conflict(format!(
                "escrow {} is not locked",
                escrow_id
            )));
        }
        Ok(escrow)
    }

    /// Write one ledger row and adjust the balance it reports.
    async fn write_ledger_entry(
        conn: &mut SqliteConnection,
        account_id: &str,
        kind: TxKind,
        amount: i64,
        reference: &str,
    ) -> EconomyResult<LedgerTransaction> {
        let delta = match kind {
            TxKind::Credit | TxKind::EscrowRelease => amount,
            TxKind::EscrowLock => -amount,
        };
        let resulting_balance: i64 = sqlx::query_scalar(
            "UPDATE bank_accounts SET balance = balance + ? WHERE account_id = ? RETURNING balance",
        )
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("account {}", account_id)))?;

        let entry = LedgerTransaction {
            tx_id: id::fresh(id::TRANSACTION),
            account_id: account_id.to_string(),
            kind,
            amount,
            resulting_balance,
            reference: reference.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO bank_transactions
             (tx_id, account_id, kind, amount, resulting_balance, reference, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.tx_id)
        .bind(&entry.account_id)
        .bind(entry.kind)
        .bind(entry.amount)
        .bind(entry.resulting_balance)
        .bind(&entry.reference)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityService, RegisterAgentRequest};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use ed25519_dalek::SigningKey;

    async fn setup() -> (BankService, IdentityService) {
        let store = Store::open_in_memory().await.unwrap();
        let events = EventLog::new();
        (
            BankService::new(store.clone(), events.clone()),
            IdentityService::new(store, events),
        )
    }

    async fn register(identity: &IdentityService, seed: u8, name: &str) -> String {
        let key = SigningKey::from_bytes(&[seed; 32]);
        identity
            .register(RegisterAgentRequest {
                name: name.into(),
                public_key: format!(
                    "ed25519:{}",
                    BASE64.encode(key.verifying_key().to_bytes())
                ),
            })
            .await
            .unwrap()
            .agent_id
    }

    async fn bank_with_agent(seed: u8) -> (BankService, String) {
        let (bank, identity) = setup().await;
        let agent = register(&identity, seed, "agent").await;
        (bank, agent)
    }

    #[tokio::test]
    async fn credit_is_idempotent() {
        let (bank, agent) = bank_with_agent(10).await;
        let first = bank.credit(&agent, 50, "genesis").await.unwrap();
        let replay = bank.credit(&agent, 50, "genesis").await.unwrap();
        assert_eq!(first.tx_id, replay.tx_id);
        assert_eq!(bank.get_account(&agent).await.unwrap().balance, 50);
    }

    #[tokio::test]
    async fn lock_requires_funds_and_uniqueness() {
        let (bank, agent) = bank_with_agent(11).await;
        bank.credit(&agent, 20, "genesis").await.unwrap();

        let err = bank.lock_escrow(&agent, 30, "t-task").await.unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");

        bank.lock_escrow(&agent, 15, "t-task").await.unwrap();
        assert_eq!(bank.get_account(&agent).await.unwrap().balance, 5);

        let err = bank.lock_escrow(&agent, 5, "t-task").await.unwrap_err();
        assert_eq!(err.kind(), "escrow_exists");
    }

    #[tokio::test]
    async fn release_pays_full_amount_once() {
        let (bank, identity) = setup().await;
        let payer = register(&identity, 12, "payer").await;
        let worker = register(&identity, 13, "worker").await;

        bank.credit(&payer, 100, "genesis").await.unwrap();
        let escrow = bank.lock_escrow(&payer, 10, "t-job").await.unwrap();
        bank.release_escrow(&escrow.escrow_id, &worker).await.unwrap();

        assert_eq!(bank.get_account(&worker).await.unwrap().balance, 10);
        let err = bank
            .release_escrow(&escrow.escrow_id, &worker)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let audit = bank.audit().await.unwrap();
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn split_boundaries_skip_zero_credits() {
        let (bank, identity) = setup().await;
        let payer = register(&identity, 15, "payer").await;
        let worker = register(&identity, 16, "worker").await;

        bank.credit(&payer, 100, "genesis").await.unwrap();

        // worker_pct = 0: everything returns to the poster, no worker row.
        let escrow = bank.lock_escrow(&payer, 10, "t-zero").await.unwrap();
        bank.split_escrow(&escrow.escrow_id, 0, &worker, &payer)
            .await
            .unwrap();
        assert_eq!(bank.get_account(&worker).await.unwrap().balance, 0);
        assert!(bank.transactions(&worker).await.unwrap().is_empty());

        // worker_pct = 100: everything to the worker, no poster row.
        let escrow = bank.lock_escrow(&payer, 10, "t-full").await.unwrap();
        bank.split_escrow(&escrow.escrow_id, 100, &worker, &payer)
            .await
            .unwrap();
        assert_eq!(bank.get_account(&worker).await.unwrap().balance, 10);

        // 40%: floor split sums exactly.
        let escrow = bank.lock_escrow(&payer, 10, "t-split").await.unwrap();
        bank.split_escrow(&escrow.escrow_id, 40, &worker, &payer)
            .await
            .unwrap();
        // Payer: 100 credited, 30 locked across three escrows, 10 + 6 returned.
        assert_eq!(bank.get_account(&worker).await.unwrap().balance, 14);
        assert_eq!(bank.get_account(&payer).await.unwrap().balance, 86);

        let audit = bank.audit().await.unwrap();
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn salary_round_is_replay_safe() {
        let (bank, agent) = bank_with_agent(17).await;
        let credited = bank.pay_salary(7, 25).await.unwrap();
        assert_eq!(credited, vec![agent.clone()]);

        let replay = bank.pay_salary(7, 25).await.unwrap();
        assert!(replay.is_empty());
        assert_eq!(bank.get_account(&agent).await.unwrap().balance, 25);
    }
}
