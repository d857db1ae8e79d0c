//! Tunable limits for maintenance runs. Each knob can be overridden with an
//! environment variable of the same name.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::{
    env_config,
    env_flag,
};

/// Runs lock-retry blocks exactly once with no lock timeout. Set this when
/// the caller already sits inside its own retry loop.
pub static DISABLE_LOCK_RETRIES: LazyLock<bool> =
    LazyLock::new(|| env_flag("DISABLE_LOCK_RETRIES", false));

/// How many times installing or removing a write trigger is attempted when
/// the statement keeps getting canceled by `statement_timeout`.
pub static LOCK_WRITES_STATEMENT_TIMEOUT_RETRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("LOCK_WRITES_STATEMENT_TIMEOUT_RETRIES", 3));

/// `statement_timeout` used while a replacement index builds. Large indexes
/// take hours to build concurrently.
pub static REINDEX_STATEMENT_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("REINDEX_STATEMENT_TIMEOUT_SECS", 6 * 60 * 60))
});

/// Client-side bound on catalog queries and transaction control statements.
/// DDL is not bounded here since it is governed by the server-side timeouts.
pub static POSTGRES_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("POSTGRES_TIMEOUT_SECONDS", 30)));
