use std::{
    sync::LazyLock,
    time::Duration,
};

use prometheus::{
    HistogramVec,
    IntCounterVec,
    Registry,
    register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry,
};

use crate::{
    errors::DbError,
    lock_writes::LockWritesAction,
};

const STATUS_LABEL: &str = "status";

/// Everything this crate reports. Callers expose it next to their own
/// registry.
pub static DB_MAINTENANCE_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static DB_MAINTENANCE_STATEMENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "db_maintenance_statements_total",
        "Statements issued by maintenance runs",
        &["kind"],
        DB_MAINTENANCE_METRICS_REGISTRY
    )
    .expect("Metric initialization failed")
});
pub fn log_statement(kind: &'static str) {
    DB_MAINTENANCE_STATEMENTS_TOTAL
        .with_label_values(&[kind])
        .inc();
}

static DB_MAINTENANCE_STATEMENT_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "db_maintenance_statement_errors_total",
        "Failed maintenance statements by error class",
        &["kind", "class"],
        DB_MAINTENANCE_METRICS_REGISTRY
    )
    .expect("Metric initialization failed")
});
pub fn log_statement_error(kind: &'static str, error: &DbError) {
    let class = match error {
        DbError::LockTimeout(_) => "lock_timeout",
        DbError::QueryCanceled(_) => "query_canceled",
        DbError::Other(_) => "other",
    };
    DB_MAINTENANCE_STATEMENT_ERRORS_TOTAL
        .with_label_values(&[kind, class])
        .inc();
}

static DB_MAINTENANCE_LOCK_RETRY_ATTEMPTS_TOTAL: LazyLock<IntCounterVec> =
    LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "db_maintenance_lock_retry_attempts_total",
            "Lock retry attempts by outcome",
            &["outcome"],
            DB_MAINTENANCE_METRICS_REGISTRY
        )
        .expect("Metric initialization failed")
    });

#[derive(Clone, Copy, Debug)]
pub enum LockAttemptOutcome {
    Acquired,
    LockTimeout,
    Failed,
    Exhausted,
    Unprotected,
}

impl LockAttemptOutcome {
    fn as_label(self) -> &'static str {
        match self {
            LockAttemptOutcome::Acquired => "acquired",
            LockAttemptOutcome::LockTimeout => "lock_timeout",
            LockAttemptOutcome::Failed => "failed",
            LockAttemptOutcome::Exhausted => "exhausted",
            LockAttemptOutcome::Unprotected => "unprotected",
        }
    }
}

pub fn log_lock_attempt(outcome: LockAttemptOutcome) {
    DB_MAINTENANCE_LOCK_RETRY_ATTEMPTS_TOTAL
        .with_label_values(&[outcome.as_label()])
        .inc();
}

static DB_MAINTENANCE_LOCK_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "db_maintenance_lock_writes_total",
        "Write-lock results by action",
        &["action"],
        DB_MAINTENANCE_METRICS_REGISTRY
    )
    .expect("Metric initialization failed")
});
pub fn log_lock_writes(action: LockWritesAction) {
    DB_MAINTENANCE_LOCK_WRITES_TOTAL
        .with_label_values(&[action.as_label()])
        .inc();
}

static DB_MAINTENANCE_REINDEX_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec_with_registry!(
        "db_maintenance_reindex_seconds",
        "Time to rebuild an index concurrently",
        &[STATUS_LABEL],
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 4.0 * 3600.0, 12.0 * 3600.0],
        DB_MAINTENANCE_METRICS_REGISTRY
    )
    .expect("Metric initialization failed")
});
pub fn log_reindex(status: &'static str, elapsed: Duration) {
    DB_MAINTENANCE_REINDEX_SECONDS
        .with_label_values(&[status])
        .observe(elapsed.as_secs_f64());
}
