use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::{
    catalog::LockState,
    connection::MaintenanceConnection,
    errors::{
        DbError,
        LockRetriesError,
    },
    identifiers::QualifiedName,
    knobs::LOCK_WRITES_STATEMENT_TIMEOUT_RETRIES,
    lock_retries::{
        LockRetries,
        TimingSchedule,
    },
    metrics::log_lock_writes,
    statement::{
        Statement,
        write_trigger_name,
    },
};

const LOCK_RETRIES_CONTEXT: &str = "gitlab:db:lock_writes";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWritesAction {
    Locked,
    Unlocked,
    Skipped,
    NeedsLock,
    NeedsUnlock,
}

impl LockWritesAction {
    pub fn as_label(self) -> &'static str {
        match self {
            LockWritesAction::Locked => "locked",
            LockWritesAction::Unlocked => "unlocked",
            LockWritesAction::Skipped => "skipped",
            LockWritesAction::NeedsLock => "needs_lock",
            LockWritesAction::NeedsUnlock => "needs_unlock",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockWritesResult {
    pub action: LockWritesAction,
    pub database: String,
    pub table: String,
    pub dry_run: bool,
}

/// Installs the function every write-block trigger calls. Must run on a
/// database before any of its tables are locked.
pub async fn install_write_block_function(conn: &dyn MaintenanceConnection) -> anyhow::Result<()> {
    conn.execute(&Statement::CreateWriteBlockFunction)
        .await
        .context("failed to install the write block function")
}

/// Locks or unlocks one table for writes on one logical database.
///
/// Locking installs a statement-level trigger that rejects every INSERT,
/// UPDATE, DELETE and TRUNCATE. Both directions check the catalog first and
/// skip tables that are missing or already in the wanted state.
pub struct LockWritesManager {
    table: QualifiedName,
    conn: Arc<dyn MaintenanceConnection>,
    database: String,
    with_retries: bool,
    dry_run: bool,
    schedule: TimingSchedule,
}

impl LockWritesManager {
    pub fn new(
        table: QualifiedName,
        conn: Arc<dyn MaintenanceConnection>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            table,
            conn,
            database: database.into(),
            with_retries: true,
            dry_run: false,
            schedule: TimingSchedule::default(),
        }
    }

    /// Run the trigger DDL under [`LockRetries`]. Requires that no
    /// transaction is open on the connection.
    pub fn with_retries(mut self, with_retries: bool) -> Self {
        self.with_retries = with_retries;
        self
    }

    /// Only log the DDL that would run.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_schedule(mut self, schedule: TimingSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub async fn table_locked_for_writes(&self) -> anyhow::Result<bool> {
        Ok(self.lock_state().await? == LockState::Locked)
    }

    pub async fn lock_state(&self) -> anyhow::Result<LockState> {
        if !self.conn.table_exists(&self.table).await? {
            return Ok(LockState::Missing);
        }
        let trigger = write_trigger_name(&self.table)?;
        if self.conn.trigger_exists(&self.table, &trigger).await? {
            Ok(LockState::Locked)
        } else {
            Ok(LockState::Unlocked)
        }
    }

    pub async fn lock_writes(&self) -> anyhow::Result<LockWritesResult> {
        match self.lock_state().await? {
            LockState::Missing => {
                tracing::info!(
                    database = %self.database,
                    table = %self.table,
                    "Skipping lock_writes, because the table does not exist"
                );
                return Ok(self.result(LockWritesAction::Skipped));
            },
            LockState::Locked => {
                tracing::info!(
                    database = %self.database,
                    table = %self.table,
                    "Skipping lock_writes, because the table is already locked for writes"
                );
                return Ok(self.result(LockWritesAction::Skipped));
            },
            LockState::Unlocked => {},
        }
        tracing::info!(database = %self.database, table = %self.table, "Lock writes");
        let statement = Statement::create_write_trigger(&self.table)?;
        self.process(&statement, LockWritesAction::NeedsLock, LockWritesAction::Locked)
            .await
    }

    pub async fn unlock_writes(&self) -> anyhow::Result<LockWritesResult> {
        if self.lock_state().await? != LockState::Locked {
            tracing::info!(
                database = %self.database,
                table = %self.table,
                "Skipping unlock_writes, because the table is not locked for writes"
            );
            return Ok(self.result(LockWritesAction::Skipped));
        }
        tracing::info!(database = %self.database, table = %self.table, "Allow writes");
        let statement = Statement::drop_write_trigger(&self.table)?;
        self.process(
            &statement,
            LockWritesAction::NeedsUnlock,
            LockWritesAction::Unlocked,
        )
        .await
    }

    async fn process(
        &self,
        statement: &Statement,
        dry_run_action: LockWritesAction,
        action: LockWritesAction,
    ) -> anyhow::Result<LockWritesResult> {
        if self.dry_run {
            tracing::info!(database = %self.database, sql = %statement, "dry run");
            return Ok(self.result(dry_run_action));
        }
        self.execute_with_statement_timeout_retries(statement)
            .await
            .with_context(|| {
                format!(
                    "failed to {} on {} in database {}",
                    statement.kind(),
                    self.table,
                    self.database
                )
            })?;
        Ok(self.result(action))
    }

    // A statement canceled by `statement_timeout` is retried from scratch,
    // lock retries included.
    async fn execute_with_statement_timeout_retries(
        &self,
        statement: &Statement,
    ) -> Result<(), LockRetriesError> {
        let attempts = (*LOCK_WRITES_STATEMENT_TIMEOUT_RETRIES).max(1);
        let mut attempt = 1;
        loop {
            match self.execute(statement).await {
                Err(e) if e.is_query_canceled() && attempt < attempts => {
                    tracing::warn!(
                        database = %self.database,
                        table = %self.table,
                        attempt,
                        "statement timed out, retrying: {e}"
                    );
                    attempt += 1;
                },
                result => return result,
            }
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<(), LockRetriesError> {
        let conn = &*self.conn;
        if !self.with_retries {
            return Ok(conn.execute(statement).await?);
        }
        if conn.transaction_open() {
            return Err(DbError::Other(anyhow::anyhow!(
                "cannot change write locks with lock retries inside an open transaction"
            ))
            .into());
        }
        LockRetries::new(conn, self.schedule.clone(), LOCK_RETRIES_CONTEXT)
            .run(false, async || conn.execute(statement).await)
            .await
    }

    fn result(&self, action: LockWritesAction) -> LockWritesResult {
        log_lock_writes(action);
        LockWritesResult {
            action,
            database: self.database.clone(),
            table: self.table.to_string(),
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{
        SimulatedError,
        TestConnection,
    };

    const TRIGGER: &str = "gitlab_schema_write_trigger_for_orders";

    async fn setup() -> anyhow::Result<TestConnection> {
        let conn = TestConnection::new();
        conn.add_table("orders");
        install_write_block_function(&conn).await?;
        conn.clear_statements();
        Ok(conn)
    }

    fn manager_for(conn: &TestConnection, table: &str) -> anyhow::Result<LockWritesManager> {
        Ok(LockWritesManager::new(table.parse()?, Arc::new(conn.clone()), "main"))
    }

    #[tokio::test]
    async fn test_lock_then_delete_is_rejected() -> anyhow::Result<()> {
        let conn = setup().await?;
        let manager = manager_for(&conn, "orders")?;
        assert!(conn.delete_from("orders").is_ok());

        let result = manager.lock_writes().await?;
        assert_eq!(result.action, LockWritesAction::Locked);
        assert!(manager.table_locked_for_writes().await?);
        let err = conn.delete_from("orders").unwrap_err();
        assert!(err.to_string().contains("is write protected"), "{err}");

        let result = manager.unlock_writes().await?;
        assert_eq!(result.action, LockWritesAction::Unlocked);
        assert!(!manager.table_locked_for_writes().await?);
        conn.delete_from("orders")?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_is_idempotent() -> anyhow::Result<()> {
        let conn = setup().await?;
        let manager = manager_for(&conn, "orders")?;
        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Locked);
        let executed = conn.statements().len();

        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Skipped);
        assert_eq!(conn.statements().len(), executed);
        assert!(conn.has_trigger("orders", TRIGGER));

        assert_eq!(manager.unlock_writes().await?.action, LockWritesAction::Unlocked);
        let executed = conn.statements().len();
        assert_eq!(manager.unlock_writes().await?.action, LockWritesAction::Skipped);
        assert_eq!(conn.statements().len(), executed);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_table_is_skipped() -> anyhow::Result<()> {
        let conn = setup().await?;
        let manager = manager_for(&conn, "gitlab_partitions_dynamic.orders_202401")?;
        assert_eq!(manager.lock_state().await?, LockState::Missing);
        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Skipped);
        assert_eq!(manager.unlock_writes().await?.action, LockWritesAction::Skipped);
        assert!(conn.statements().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() -> anyhow::Result<()> {
        let conn = setup().await?;
        let manager = manager_for(&conn, "orders")?.dry_run(true);

        let result = manager.lock_writes().await?;
        assert_eq!(result.action, LockWritesAction::NeedsLock);
        assert!(conn.statements().is_empty());
        assert!(!conn.has_trigger("orders", TRIGGER));
        assert_eq!(
            serde_json::to_value(&result)?,
            json!({
                "action": "needs_lock",
                "database": "main",
                "table": "orders",
                "dry_run": true,
            })
        );

        manager_for(&conn, "orders")?.lock_writes().await?;
        conn.clear_statements();
        assert_eq!(manager.unlock_writes().await?.action, LockWritesAction::NeedsUnlock);
        assert!(conn.statements().is_empty());
        assert!(conn.has_trigger("orders", TRIGGER));
        Ok(())
    }

    #[tokio::test]
    async fn test_statement_timeouts_are_retried() -> anyhow::Result<()> {
        let conn = setup().await?;
        conn.inject_failure_times("CREATE TRIGGER", SimulatedError::StatementTimeout, 2);
        let manager = manager_for(&conn, "orders")?;
        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Locked);
        let creates = conn
            .statements()
            .iter()
            .filter(|sql| sql.starts_with("CREATE TRIGGER"))
            .count();
        assert_eq!(creates, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_statement_timeout_retries_are_bounded() -> anyhow::Result<()> {
        let conn = setup().await?;
        conn.inject_failure("DROP TRIGGER", SimulatedError::StatementTimeout);
        let manager = manager_for(&conn, "orders")?.with_retries(false);
        manager.lock_writes().await?;

        conn.clear_statements();
        let err = manager.unlock_writes().await.unwrap_err();
        assert!(
            err.downcast_ref::<LockRetriesError>()
                .is_some_and(LockRetriesError::is_query_canceled),
            "{err:?}"
        );
        assert!(conn.has_trigger("orders", TRIGGER));
        let drops = conn
            .statements()
            .iter()
            .filter(|sql| sql.starts_with("DROP TRIGGER"))
            .count();
        assert_eq!(drops, (*LOCK_WRITES_STATEMENT_TIMEOUT_RETRIES).max(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_refuse_open_transaction() -> anyhow::Result<()> {
        let conn = setup().await?;
        conn.execute(&Statement::Begin).await?;
        assert!(manager_for(&conn, "orders")?.lock_writes().await.is_err());
        conn.execute(&Statement::Rollback).await?;

        conn.execute(&Statement::Begin).await?;
        let manager = manager_for(&conn, "orders")?.with_retries(false);
        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Locked);
        conn.execute(&Statement::Commit).await?;
        assert!(conn.has_trigger("orders", TRIGGER));
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_schema() -> anyhow::Result<()> {
        let conn = setup().await?;
        conn.add_table("gitlab_partitions_dynamic.orders_202401");
        let manager = manager_for(&conn, "gitlab_partitions_dynamic.orders_202401")?;
        assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Locked);
        assert!(conn.has_trigger(
            "gitlab_partitions_dynamic.orders_202401",
            "gitlab_schema_write_trigger_for_orders_202401"
        ));
        assert!(!conn.has_trigger("orders", TRIGGER));
        Ok(())
    }
}
