use tokio_postgres::error::SqlState;

/// Database error, classified by what a retry loop should do with it.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// `lock_timeout` expired while waiting for a lock (SQLSTATE 55P03).
    /// The only class `LockRetries` retries.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// The statement was canceled, usually by `statement_timeout`
    /// (SQLSTATE 57014).
    #[error("query canceled: {0}")]
    QueryCanceled(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DbError::LockTimeout(_))
    }

    pub fn is_query_canceled(&self) -> bool {
        matches!(self, DbError::QueryCanceled(_))
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.code() {
            Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => {
                DbError::LockTimeout(display_db_error(&e))
            },
            Some(code) if *code == SqlState::QUERY_CANCELED => {
                DbError::QueryCanceled(display_db_error(&e))
            },
            _ => DbError::Other(e.into()),
        }
    }
}

fn display_db_error(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => db_error.message().to_owned(),
        None => e.to_string(),
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("configured attempts to obtain locks are exhausted for {context} after {attempts} attempts")]
pub struct AttemptsExhaustedError {
    pub context: String,
    pub attempts: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum LockRetriesError {
    #[error(transparent)]
    AttemptsExhausted(#[from] AttemptsExhaustedError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl LockRetriesError {
    pub fn is_query_canceled(&self) -> bool {
        matches!(self, LockRetriesError::Db(e) if e.is_query_canceled())
    }
}

/// Why a reindex did not happen. Every variant leaves the original index
/// usable under its original name.
#[derive(thiserror::Error, Debug)]
pub enum ReindexError {
    #[error("index {0} does not exist")]
    DoesNotExist(String),
    #[error("index {0} is INVALID, rebuild it with REINDEX or drop it")]
    Invalid(String),
    #[error("UNIQUE indexes are currently not supported")]
    Unique,
    #[error("partitioned indexes are currently not supported")]
    Partitioned,
    #[error("indexes serving an exclusion constraint are currently not supported")]
    Exclusion,
    #[error("index is a left-over temporary index from a previous reindexing run")]
    LeftoverTemporaryIndex,
    #[error("failed to reindex {index}: replacement index was created as INVALID")]
    InvalidReplacement { index: String },
    #[error("failed to reindex {index}: building the replacement failed: {source}")]
    Build {
        index: String,
        #[source]
        source: DbError,
    },
    #[error("failed to reindex {index}: swapping in the replacement failed: {source}")]
    Swap {
        index: String,
        #[source]
        source: LockRetriesError,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}
