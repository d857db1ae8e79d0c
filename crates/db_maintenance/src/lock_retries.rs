//! Bounded retries for statements that need a short exclusive lock.
//!
//! Each attempt waits at most `lock_timeout` for the lock so a blocked DDL
//! statement never queues every other query on the table behind it. Between
//! attempts the coordinator sleeps, giving long-running transactions a chance
//! to finish. Once the schedule runs out the block is either given up on or
//! run one last time without a lock timeout.
use std::time::Duration;

use tokio::time::sleep;

use crate::{
    connection::MaintenanceConnection,
    errors::{
        AttemptsExhaustedError,
        DbError,
        LockRetriesError,
    },
    identifiers::Identifier,
    knobs::DISABLE_LOCK_RETRIES,
    metrics::{
        LockAttemptOutcome,
        log_lock_attempt,
    },
    statement::{
        SettingScope,
        Statement,
    },
};

const SAVEPOINT_NAME: &str = "lock_retries";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingEntry {
    pub lock_timeout: Duration,
    pub sleep: Duration,
}

impl TimingEntry {
    pub const fn new(lock_timeout: Duration, sleep: Duration) -> Self {
        Self {
            lock_timeout,
            sleep,
        }
    }
}

const fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

const fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

const DEFAULT_TIMING: [TimingEntry; 20] = [
    TimingEntry::new(ms(100), ms(50)),
    TimingEntry::new(ms(100), ms(50)),
    TimingEntry::new(ms(200), ms(50)),
    TimingEntry::new(ms(300), ms(100)),
    TimingEntry::new(ms(400), ms(150)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(secs(1), secs(5)),
    TimingEntry::new(secs(1), secs(60)),
    TimingEntry::new(ms(100), ms(50)),
    TimingEntry::new(ms(100), ms(50)),
    TimingEntry::new(ms(200), ms(50)),
    TimingEntry::new(ms(300), ms(100)),
    TimingEntry::new(ms(400), ms(150)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(ms(500), secs(2)),
    TimingEntry::new(secs(3), secs(3 * 60)),
];

const REMOVE_INDEX_ATTEMPTS: usize = 30;

/// Ordered `(lock_timeout, sleep)` pairs. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingSchedule {
    entries: Vec<TimingEntry>,
}

impl TimingSchedule {
    pub fn new(entries: Vec<TimingEntry>) -> anyhow::Result<Self> {
        anyhow::ensure!(!entries.is_empty(), "timing schedule must not be empty");
        Ok(Self { entries })
    }

    /// Long timeouts for dropping indexes, which only needs its lock briefly
    /// but often queues behind long-running queries.
    pub fn remove_index() -> Self {
        Self {
            entries: vec![TimingEntry::new(secs(60), secs(9 * 60)); REMOVE_INDEX_ATTEMPTS],
        }
    }

    pub fn entries(&self) -> &[TimingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn total_sleep(&self) -> Duration {
        self.timed_entries().iter().map(|entry| entry.sleep).sum()
    }

    // The last entry only marks the end of the schedule.
    fn timed_entries(&self) -> &[TimingEntry] {
        &self.entries[..self.entries.len() - 1]
    }
}

impl Default for TimingSchedule {
    fn default() -> Self {
        Self {
            entries: DEFAULT_TIMING.to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockRetriesMode {
    /// Every attempt runs in its own transaction block, or a savepoint when
    /// the caller already opened a transaction.
    #[default]
    InTransaction,
    /// For statements Postgres refuses inside a transaction block. The lock
    /// timeout is set for the session and no transaction is opened.
    OutsideTransaction,
}

// How the current attempt is scoped, so it can be closed the same way.
enum Attempt {
    Transaction,
    Savepoint(Identifier),
    Session,
}

pub struct LockRetries<'a> {
    conn: &'a dyn MaintenanceConnection,
    schedule: TimingSchedule,
    context: String,
    mode: LockRetriesMode,
    disabled: bool,
}

impl<'a> LockRetries<'a> {
    pub fn new(
        conn: &'a dyn MaintenanceConnection,
        schedule: TimingSchedule,
        context: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            schedule,
            context: context.into(),
            mode: LockRetriesMode::default(),
            disabled: *DISABLE_LOCK_RETRIES,
        }
    }

    pub fn with_mode(mut self, mode: LockRetriesMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Runs `block` under the timing schedule. Only lock timeouts are retried;
    /// any other error rolls back the attempt and is returned as is.
    ///
    /// With `raise_on_exhaustion` an exhausted schedule is an error. Otherwise
    /// the block runs once more with no lock timeout at all.
    pub async fn run<T>(
        &self,
        raise_on_exhaustion: bool,
        mut block: impl AsyncFnMut() -> Result<T, DbError>,
    ) -> Result<T, LockRetriesError> {
        if self.disabled {
            tracing::info!(
                context = %self.context,
                "DISABLE_LOCK_RETRIES is set, executing the block without retry"
            );
            return Ok(block().await?);
        }
        if self.mode == LockRetriesMode::OutsideTransaction && self.conn.transaction_open() {
            return Err(DbError::Other(anyhow::anyhow!(
                "{}: lock retries outside a transaction cannot run while a transaction is open",
                self.context
            ))
            .into());
        }

        let timed = self.schedule.timed_entries();
        for (iteration, entry) in (1..).zip(timed) {
            let attempt = match self.open_attempt(entry.lock_timeout).await {
                Ok(attempt) => attempt,
                Err(e) => return self.finish(Err(e.into())).await,
            };
            match block().await {
                Ok(value) => {
                    log_lock_attempt(LockAttemptOutcome::Acquired);
                    let closed = self.close_attempt(&attempt).await;
                    return self.finish(closed.map(|()| value).map_err(Into::into)).await;
                },
                Err(e) => {
                    if let Err(rollback_error) = self.rollback_attempt(&attempt).await {
                        tracing::error!(
                            context = %self.context,
                            "failed to roll back lock retry attempt: {rollback_error}"
                        );
                        return self.finish(Err(e.into())).await;
                    }
                    if !e.is_lock_timeout() {
                        log_lock_attempt(LockAttemptOutcome::Failed);
                        return self.finish(Err(e.into())).await;
                    }
                    log_lock_attempt(LockAttemptOutcome::LockTimeout);
                    tracing::info!(
                        context = %self.context,
                        iteration,
                        lock_timeout_ms = entry.lock_timeout.as_millis() as u64,
                        sleep_ms = entry.sleep.as_millis() as u64,
                        "lock timeout, retrying"
                    );
                    if let Err(e) = self.prepare_for_sleep().await {
                        return self.finish(Err(e.into())).await;
                    }
                    sleep(entry.sleep).await;
                },
            }
        }

        if raise_on_exhaustion {
            log_lock_attempt(LockAttemptOutcome::Exhausted);
            let exhausted = AttemptsExhaustedError {
                context: self.context.clone(),
                attempts: timed.len(),
            };
            return self.finish(Err(exhausted.into())).await;
        }

        tracing::warn!(
            context = %self.context,
            iteration = timed.len() + 1,
            "couldn't acquire lock, executing without lock timeout"
        );
        log_lock_attempt(LockAttemptOutcome::Unprotected);
        let scope = if self.conn.transaction_open() {
            SettingScope::Local
        } else {
            SettingScope::Session
        };
        let disable_timeout = Statement::SetLockTimeout {
            timeout: Duration::ZERO,
            scope,
        };
        if let Err(e) = self.conn.execute(&disable_timeout).await {
            return self.finish(Err(e.into())).await;
        }
        let result = block().await;
        self.finish(result.map_err(Into::into)).await
    }

    async fn open_attempt(&self, lock_timeout: Duration) -> Result<Attempt, DbError> {
        let (attempt, scope) = match self.mode {
            LockRetriesMode::OutsideTransaction => (Attempt::Session, SettingScope::Session),
            LockRetriesMode::InTransaction if self.conn.transaction_open() => {
                let savepoint = Identifier::new(SAVEPOINT_NAME)?;
                self.conn
                    .execute(&Statement::Savepoint(savepoint.clone()))
                    .await?;
                (Attempt::Savepoint(savepoint), SettingScope::Local)
            },
            LockRetriesMode::InTransaction => {
                self.conn.execute(&Statement::Begin).await?;
                (Attempt::Transaction, SettingScope::Local)
            },
        };
        let set_timeout = Statement::SetLockTimeout {
            timeout: lock_timeout,
            scope,
        };
        if let Err(e) = self.conn.execute(&set_timeout).await {
            if let Err(rollback_error) = self.rollback_attempt(&attempt).await {
                tracing::error!(
                    context = %self.context,
                    "failed to roll back lock retry attempt: {rollback_error}"
                );
            }
            return Err(e);
        }
        Ok(attempt)
    }

    async fn close_attempt(&self, attempt: &Attempt) -> Result<(), DbError> {
        match attempt {
            Attempt::Transaction => self.conn.execute(&Statement::Commit).await,
            Attempt::Savepoint(name) => {
                self.conn
                    .execute(&Statement::ReleaseSavepoint(name.clone()))
                    .await
            },
            Attempt::Session => Ok(()),
        }
    }

    async fn rollback_attempt(&self, attempt: &Attempt) -> Result<(), DbError> {
        match attempt {
            Attempt::Transaction => self.conn.execute(&Statement::Rollback).await,
            Attempt::Savepoint(name) => {
                self.conn
                    .execute(&Statement::RollbackToSavepoint(name.clone()))
                    .await?;
                self.conn
                    .execute(&Statement::ReleaseSavepoint(name.clone()))
                    .await
            },
            Attempt::Session => Ok(()),
        }
    }

    // An outer transaction sits idle while we sleep; keep the server from
    // terminating it.
    async fn prepare_for_sleep(&self) -> Result<(), DbError> {
        self.conn.execute(&Statement::ResetLockSettings).await?;
        if self.conn.transaction_open() {
            self.conn
                .execute(&Statement::SetIdleInTransactionTimeout {
                    timeout: Duration::ZERO,
                    scope: SettingScope::Local,
                })
                .await?;
        }
        Ok(())
    }

    async fn finish<T>(
        &self,
        result: Result<T, LockRetriesError>,
    ) -> Result<T, LockRetriesError> {
        let reset = self.conn.execute(&Statement::ResetLockSettings).await;
        match (result, reset) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(reset_error)) => {
                tracing::warn!(
                    context = %self.context,
                    "failed to reset lock settings after error: {reset_error}"
                );
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::testing::{
        SimulatedError,
        TestConnection,
        TestIndex,
    };

    fn schedule(entries: &[(u64, u64)]) -> anyhow::Result<TimingSchedule> {
        TimingSchedule::new(
            entries
                .iter()
                .map(|&(timeout, sleep)| TimingEntry::new(ms(timeout), ms(sleep)))
                .collect(),
        )
    }

    fn trigger_on(conn: &TestConnection, table: &str) -> anyhow::Result<Statement> {
        conn.add_table(table);
        conn.install_write_block_function();
        Statement::create_write_trigger(&table.parse()?)
    }

    #[test]
    fn test_default_schedule() {
        let schedule = TimingSchedule::default();
        assert_eq!(schedule.len(), 20);
        assert_eq!(schedule.entries()[0], TimingEntry::new(ms(100), ms(50)));
        assert_eq!(
            schedule.entries()[19],
            TimingEntry::new(secs(3), secs(180))
        );
        assert_eq!(
            TimingSchedule::remove_index().entries(),
            &[TimingEntry::new(secs(60), secs(540)); 30]
        );
        assert!(TimingSchedule::new(vec![]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_first_attempt() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        let retries = LockRetries::new(&conn, schedule(&[(100, 50), (200, 50)])?, "test")
            .with_disabled(false);

        let start = Instant::now();
        retries.run(false, async || conn.execute(&create).await).await?;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(conn.has_trigger("orders", "gitlab_schema_write_trigger_for_orders"));
        assert_eq!(conn.transaction_depth(), 0);
        assert_eq!(conn.lock_timeout(), Duration::ZERO);
        assert_eq!(
            conn.statements()[..3],
            [
                "BEGIN".to_owned(),
                "SET LOCAL lock_timeout TO '100ms'".to_owned(),
                create.to_sql(),
            ]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_lock_is_free() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", Some(2));
        let retries = LockRetries::new(
            &conn,
            schedule(&[(100, 10), (200, 20), (300, 30), (400, 40)])?,
            "test",
        )
        .with_disabled(false);

        let start = Instant::now();
        retries.run(true, async || conn.execute(&create).await).await?;
        // Two lock timeouts, so two sleeps.
        assert_eq!(start.elapsed(), ms(30));
        assert!(conn.has_trigger("orders", "gitlab_schema_write_trigger_for_orders"));
        assert_eq!(conn.transaction_depth(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_raises_after_n_minus_one_attempts() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", None);
        let retries = LockRetries::new(
            &conn,
            schedule(&[(100, 10), (200, 20), (300, 30), (400, 40)])?,
            "add trigger",
        )
        .with_disabled(false);

        let start = Instant::now();
        let mut calls = 0;
        let err = retries
            .run(true, async || {
                calls += 1;
                conn.execute(&create).await
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), ms(60));
        let LockRetriesError::AttemptsExhausted(exhausted) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.context, "add trigger");
        assert!(!conn.has_trigger("orders", "gitlab_schema_write_trigger_for_orders"));
        assert_eq!(conn.transaction_depth(), 0);
        assert_eq!(conn.lock_timeout(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_runs_block_without_lock_timeout() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", None);
        let retries = LockRetries::new(&conn, schedule(&[(100, 10), (200, 20), (300, 30)])?, "t")
            .with_disabled(false);

        let start = Instant::now();
        let mut calls = 0;
        retries
            .run(false, async || {
                calls += 1;
                conn.execute(&create).await
            })
            .await?;
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), ms(30));
        assert!(conn.has_trigger("orders", "gitlab_schema_write_trigger_for_orders"));
        assert!(
            conn.statements()
                .contains(&"SET lock_timeout TO '0ms'".to_owned())
        );
        assert_eq!(conn.lock_timeout(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprotected_attempt_surfaces_statement_timeout() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", None);
        conn.execute(&Statement::SetStatementTimeout(secs(1))).await?;
        let retries = LockRetries::new(&conn, schedule(&[(100, 10), (200, 20)])?, "t")
            .with_disabled(false);

        let err = retries
            .run(false, async || conn.execute(&create).await)
            .await
            .unwrap_err();
        assert!(err.is_query_canceled(), "{err:?}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_propagate_immediately() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.inject_failure("CREATE TRIGGER", SimulatedError::Other);
        let retries =
            LockRetries::new(&conn, TimingSchedule::default(), "t").with_disabled(false);

        let start = Instant::now();
        let mut calls = 0;
        let err = retries
            .run(false, async || {
                calls += 1;
                conn.execute(&create).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockRetriesError::Db(DbError::Other(_))));
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(conn.transaction_depth(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_savepoints_inside_open_transaction() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", Some(1));
        conn.execute(&Statement::Begin).await?;
        let retries = LockRetries::new(&conn, schedule(&[(100, 10), (200, 20), (300, 30)])?, "t")
            .with_disabled(false);

        retries.run(true, async || conn.execute(&create).await).await?;
        // The outer transaction stays open and usable.
        assert_eq!(conn.transaction_depth(), 1);
        let statements = conn.statements();
        assert!(statements.contains(&"SAVEPOINT \"lock_retries\"".to_owned()));
        assert!(statements.contains(&"ROLLBACK TO SAVEPOINT \"lock_retries\"".to_owned()));
        assert!(
            statements.contains(&"SET LOCAL idle_in_transaction_session_timeout TO '0ms'".to_owned())
        );
        conn.execute(&Statement::Commit).await?;
        assert!(conn.has_trigger("orders", "gitlab_schema_write_trigger_for_orders"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_runs_once_without_protection() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        let create = trigger_on(&conn, "orders")?;
        conn.hold_table_lock("orders", Some(1));
        let retries = LockRetries::new(&conn, TimingSchedule::default(), "t").with_disabled(true);

        let mut calls = 0;
        retries
            .run(true, async || {
                calls += 1;
                conn.execute(&create).await
            })
            .await?;
        assert_eq!(calls, 1);
        assert_eq!(conn.statements().last(), Some(&create.to_sql()));
        assert!(!conn.statements().iter().any(|s| s.contains("lock_timeout")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_outside_transaction_mode() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        conn.add_table("users");
        conn.add_index(TestIndex::btree("idx_users_name", "users", "name"));
        conn.hold_table_lock("users", Some(1));
        let drop = Statement::DropIndexConcurrently("idx_users_name".parse()?);
        let retries = LockRetries::new(&conn, schedule(&[(100, 10), (200, 20), (300, 30)])?, "t")
            .with_mode(LockRetriesMode::OutsideTransaction)
            .with_disabled(false);
        retries.run(false, async || conn.execute(&drop).await).await?;
        assert!(!conn.has_index("idx_users_name"));
        assert!(conn.statements().contains(&"SET lock_timeout TO '100ms'".to_owned()));
        assert!(!conn.statements().contains(&"BEGIN".to_owned()));

        conn.execute(&Statement::Begin).await?;
        assert!(retries.run(false, async || Ok(())).await.is_err());
        Ok(())
    }
}
