//! Rebuilding an index without blocking writes.
//!
//! The replacement is built concurrently under a temporary name, then
//! swapped in with three renames inside one lock-retried transaction. The
//! original index stays usable under its own name until that transaction
//! commits, so every failure leaves the table as it was.
use std::{
    sync::Arc,
    time::Instant,
};

use crate::{
    catalog::IndexDescriptor,
    connection::MaintenanceConnection,
    errors::{
        DbError,
        LockRetriesError,
        ReindexError,
    },
    identifiers::{
        Identifier,
        QualifiedName,
    },
    knobs::{
        DISABLE_LOCK_RETRIES,
        REINDEX_STATEMENT_TIMEOUT,
    },
    lock_retries::{
        LockRetries,
        LockRetriesMode,
        TimingSchedule,
    },
    metrics::log_reindex,
    statement::Statement,
};

pub const REPLACEMENT_INDEX_PREFIX: &str = "tmp_reindex_";
pub const REPLACED_INDEX_PREFIX: &str = "old_reindex_";

const LEASE_KEY_PREFIX: &str = "gitlab/database/reindexing/coordinator";

pub struct ConcurrentReindex {
    index: QualifiedName,
    conn: Arc<dyn MaintenanceConnection>,
    swap_schedule: TimingSchedule,
    remove_schedule: TimingSchedule,
    lock_retries_disabled: bool,
}

impl ConcurrentReindex {
    pub fn new(index: QualifiedName, conn: Arc<dyn MaintenanceConnection>) -> Self {
        Self {
            index,
            conn,
            swap_schedule: TimingSchedule::default(),
            remove_schedule: TimingSchedule::remove_index(),
            lock_retries_disabled: *DISABLE_LOCK_RETRIES,
        }
    }

    pub fn with_swap_schedule(mut self, schedule: TimingSchedule) -> Self {
        self.swap_schedule = schedule;
        self
    }

    pub fn with_remove_schedule(mut self, schedule: TimingSchedule) -> Self {
        self.remove_schedule = schedule;
        self
    }

    pub fn with_lock_retries_disabled(mut self, disabled: bool) -> Self {
        self.lock_retries_disabled = disabled;
        self
    }

    pub async fn execute(&self) -> Result<(), ReindexError> {
        let start = Instant::now();
        let result = self.reindex().await;
        let status = match &result {
            Ok(()) => "success",
            Err(_) => "error",
        };
        log_reindex(status, start.elapsed());
        result
    }

    async fn reindex(&self) -> Result<(), ReindexError> {
        let index = self.verify_index().await?;
        let replacement = index.name.sibling(
            Identifier::prefixed(REPLACEMENT_INDEX_PREFIX, &index.name.name).map_err(DbError::from)?,
        );
        let replaced =
            Identifier::prefixed(REPLACED_INDEX_PREFIX, &index.name.name).map_err(DbError::from)?;

        if self.conn.find_index(&replacement).await?.is_some() {
            tracing::warn!(
                index = %index.name,
                replacement = %replacement,
                "removing replacement index left over from a previous run"
            );
            self.remove_index(&replacement)
                .await
                .map_err(flatten_lock_retries_error)?;
        }

        let result = self.rebuild(&index, &replacement, &replaced).await;
        // After a successful swap `replacement` names the old index.
        self.cleanup(&replacement).await;
        match &result {
            Ok(()) => tracing::info!(index = %index.name, "reindex finished"),
            Err(e) => tracing::error!(index = %index.name, "reindex failed: {e}"),
        }
        result
    }

    async fn verify_index(&self) -> Result<IndexDescriptor, ReindexError> {
        if self.conn.transaction_open() {
            return Err(DbError::Other(anyhow::anyhow!(
                "cannot reindex {} inside an open transaction",
                self.index
            ))
            .into());
        }
        let Some(index) = self.conn.find_index(&self.index).await? else {
            return Err(ReindexError::DoesNotExist(self.index.to_string()));
        };
        if !index.valid {
            return Err(ReindexError::Invalid(index.name.to_string()));
        }
        if index.unique {
            return Err(ReindexError::Unique);
        }
        if index.partitioned {
            return Err(ReindexError::Partitioned);
        }
        if index.exclusion {
            return Err(ReindexError::Exclusion);
        }
        let name = &index.name.name;
        if name.starts_with(REPLACEMENT_INDEX_PREFIX) || name.starts_with(REPLACED_INDEX_PREFIX) {
            return Err(ReindexError::LeftoverTemporaryIndex);
        }
        Ok(index)
    }

    async fn rebuild(
        &self,
        index: &IndexDescriptor,
        replacement: &QualifiedName,
        replaced: &Identifier,
    ) -> Result<(), ReindexError> {
        tracing::info!(index = %index.name, replacement = %replacement, "creating replacement index");
        self.create_replacement(index, &replacement.name)
            .await
            .map_err(|source| ReindexError::Build {
                index: index.name.to_string(),
                source,
            })?;

        let valid = self
            .conn
            .find_index(replacement)
            .await?
            .is_some_and(|created| created.valid);
        if !valid {
            return Err(ReindexError::InvalidReplacement {
                index: index.name.to_string(),
            });
        }

        if index.expression {
            // Expression statistics belong to the index, so the new one starts
            // without any.
            tracing::info!(table = %index.table, "analyzing table for expression index");
            self.conn
                .execute(&Statement::Analyze(index.table.clone()))
                .await?;
        }

        tracing::info!(index = %index.name, "swapping replacement index");
        self.swap(index, replacement, replaced)
            .await
            .map_err(|source| ReindexError::Swap {
                index: index.name.to_string(),
                source,
            })
    }

    async fn create_replacement(
        &self,
        index: &IndexDescriptor,
        replacement: &Identifier,
    ) -> Result<(), DbError> {
        let create = Statement::create_index_concurrently(index, replacement)?;
        self.conn
            .execute(&Statement::SetStatementTimeout(*REINDEX_STATEMENT_TIMEOUT))
            .await?;
        let result = self.conn.execute(&create).await;
        let reset = self.conn.execute(&Statement::ResetStatementTimeout).await;
        if let (Err(_), Err(reset_error)) = (&result, &reset) {
            tracing::warn!("failed to reset statement_timeout after failed build: {reset_error}");
        }
        result.and(reset)
    }

    // original -> replaced, replacement -> original, replaced -> replacement.
    async fn swap(
        &self,
        index: &IndexDescriptor,
        replacement: &QualifiedName,
        replaced: &Identifier,
    ) -> Result<(), LockRetriesError> {
        let conn = &*self.conn;
        let renames = [
            Statement::RenameIndex {
                index: index.name.clone(),
                to: replaced.clone(),
            },
            Statement::RenameIndex {
                index: replacement.clone(),
                to: index.name.name.clone(),
            },
            Statement::RenameIndex {
                index: index.name.sibling(replaced.clone()),
                to: replacement.name.clone(),
            },
        ];
        let retries = LockRetries::new(
            conn,
            self.swap_schedule.clone(),
            format!("reindex swap of {}", index.name),
        )
        .with_disabled(self.lock_retries_disabled);
        let rename_all = async || -> Result<(), DbError> {
            for rename in &renames {
                conn.execute(rename).await?;
            }
            Ok(())
        };
        if !self.lock_retries_disabled {
            return retries.run(true, rename_all).await;
        }

        // Disabled retries run the block bare. The renames still have to
        // commit together or not at all.
        conn.execute(&Statement::Begin).await?;
        match retries.run(true, rename_all).await {
            Ok(()) => Ok(conn.execute(&Statement::Commit).await?),
            Err(e) => {
                if let Err(rollback_error) = conn.execute(&Statement::Rollback).await {
                    tracing::error!(
                        index = %index.name,
                        "failed to roll back index swap: {rollback_error}"
                    );
                }
                Err(e)
            },
        }
    }

    async fn cleanup(&self, replacement: &QualifiedName) {
        if let Err(e) = self.remove_index(replacement).await {
            tracing::error!(index = %replacement, "failed to remove replacement index: {e}");
        }
    }

    async fn remove_index(&self, index: &QualifiedName) -> Result<(), LockRetriesError> {
        let conn = &*self.conn;
        let drop = Statement::DropIndexConcurrently(index.clone());
        LockRetries::new(
            conn,
            self.remove_schedule.clone(),
            format!("remove index {index}"),
        )
        .with_mode(LockRetriesMode::OutsideTransaction)
        .with_disabled(self.lock_retries_disabled)
        .run(false, async || conn.execute(&drop).await)
        .await
    }
}

fn flatten_lock_retries_error(e: LockRetriesError) -> ReindexError {
    match e {
        LockRetriesError::Db(e) => ReindexError::Db(e),
        e @ LockRetriesError::AttemptsExhausted(_) => ReindexError::Db(DbError::Other(e.into())),
    }
}

/// A session-level advisory lock. Held until [`ExclusiveLease::cancel`] or
/// until the session ends.
pub struct ExclusiveLease {
    conn: Arc<dyn MaintenanceConnection>,
    key: String,
}

impl ExclusiveLease {
    pub fn new(conn: Arc<dyn MaintenanceConnection>, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn try_obtain(&self) -> Result<bool, DbError> {
        self.conn.try_advisory_lock(&self.key).await
    }

    pub async fn cancel(&self) -> Result<(), DbError> {
        self.conn.advisory_unlock(&self.key).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReindexOutcome {
    Reindexed,
    /// Another run holds the lease; nothing was done.
    LeaseTaken,
}

/// Serializes reindexing per logical database.
pub struct ReindexCoordinator {
    conn: Arc<dyn MaintenanceConnection>,
    lease: ExclusiveLease,
}

impl ReindexCoordinator {
    pub fn new(conn: Arc<dyn MaintenanceConnection>, database: &str) -> Self {
        let lease = ExclusiveLease::new(conn.clone(), format!("{LEASE_KEY_PREFIX}/{database}"));
        Self { conn, lease }
    }

    pub async fn perform(&self, index: QualifiedName) -> Result<ReindexOutcome, ReindexError> {
        self.run(&ConcurrentReindex::new(index, self.conn.clone()))
            .await
    }

    pub async fn run(&self, reindex: &ConcurrentReindex) -> Result<ReindexOutcome, ReindexError> {
        if !self.lease.try_obtain().await? {
            tracing::info!(
                lease = self.lease.key(),
                index = %reindex.index,
                "another reindexing run holds the lease, skipping"
            );
            return Ok(ReindexOutcome::LeaseTaken);
        }
        let result = reindex.execute().await;
        if let Err(e) = self.lease.cancel().await {
            tracing::error!(lease = self.lease.key(), "failed to release lease: {e}");
        }
        result.map(|()| ReindexOutcome::Reindexed)
    }
}
