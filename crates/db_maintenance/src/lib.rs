//! Online schema maintenance for Postgres: lock-retried DDL, per-table write
//! locks across logical databases, and concurrent index rebuilds.
mod catalog;
mod connection;
pub mod errors;
mod identifiers;
pub mod knobs;
mod lock_retries;
mod lock_writes;
pub mod metrics;
mod reindex;
mod sql;
mod statement;
mod tables_locker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use self::{
    catalog::{
        IndexDescriptor,
        LockState,
        Partition,
    },
    connection::{
        MaintenanceConnection,
        PgMaintenanceConnection,
    },
    errors::{
        AttemptsExhaustedError,
        DbError,
        LockRetriesError,
        ReindexError,
    },
    identifiers::{
        Identifier,
        MAX_IDENTIFIER_LEN,
        QualifiedName,
    },
    lock_retries::{
        LockRetries,
        LockRetriesMode,
        TimingEntry,
        TimingSchedule,
    },
    lock_writes::{
        LockWritesAction,
        LockWritesManager,
        LockWritesResult,
        install_write_block_function,
    },
    reindex::{
        ConcurrentReindex,
        ExclusiveLease,
        REPLACED_INDEX_PREFIX,
        REPLACEMENT_INDEX_PREFIX,
        ReindexCoordinator,
        ReindexOutcome,
    },
    sql::{
        DYNAMIC_PARTITIONS_SCHEMA,
        WRITE_BLOCK_FUNCTION,
        WRITE_TRIGGER_PREFIX,
    },
    statement::{
        SettingScope,
        Statement,
        write_trigger_name,
    },
    tables_locker::{
        GitlabSchema,
        LogicalDatabase,
        SchemaDictionary,
        TablesLocker,
    },
};
