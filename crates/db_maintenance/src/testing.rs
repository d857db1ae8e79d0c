//! An in-memory session that behaves enough like Postgres for the
//! maintenance coordinators: a small catalog, transactions and savepoints
//! that roll the catalog back, `SET` / `SET LOCAL` scoping, lock contention
//! from an imaginary second session, and failure injection.
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use cmd_util::env::config_test;
use parking_lot::Mutex;

use crate::{
    catalog::{
        IndexDescriptor,
        Partition,
    },
    connection::MaintenanceConnection,
    errors::DbError,
    identifiers::{
        Identifier,
        QualifiedName,
    },
    sql::{
        WRITE_BLOCK_FUNCTION,
        WRITE_TRIGGER_PREFIX,
    },
    statement::{
        SettingScope,
        Statement,
    },
};

const DEFAULT_SCHEMA: &str = "public";

/// Error raised by a statement matching an injected failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulatedError {
    LockTimeout,
    StatementTimeout,
    Other,
}

impl SimulatedError {
    fn to_db_error(self, sql: &str) -> DbError {
        match self {
            SimulatedError::LockTimeout => lock_timeout_error(),
            SimulatedError::StatementTimeout => statement_timeout_error(),
            SimulatedError::Other => DbError::Other(anyhow::anyhow!("injected failure: {sql}")),
        }
    }
}

fn lock_timeout_error() -> DbError {
    DbError::LockTimeout("canceling statement due to lock timeout".to_owned())
}

fn statement_timeout_error() -> DbError {
    DbError::QueryCanceled("canceling statement due to statement timeout".to_owned())
}

fn other_error(message: String) -> DbError {
    DbError::Other(anyhow::anyhow!(message))
}

/// Index to seed the catalog with. Names may be schema-qualified; unqualified
/// names live in `public`.
#[derive(Clone, Debug)]
pub struct TestIndex {
    name: String,
    table: String,
    method: String,
    columns: String,
    unique: bool,
    exclusion: bool,
    partitioned: bool,
    valid: bool,
}

impl TestIndex {
    pub fn btree(name: &str, table: &str, columns: &str) -> Self {
        Self {
            name: name.to_owned(),
            table: table.to_owned(),
            method: "btree".to_owned(),
            columns: columns.to_owned(),
            unique: false,
            exclusion: false,
            partitioned: false,
            valid: true,
        }
    }

    pub fn using(mut self, method: &str) -> Self {
        self.method = method.to_owned();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn exclusion(mut self) -> Self {
        self.exclusion = true;
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }
}

#[derive(Clone, Debug)]
struct SimIndex {
    schema: String,
    name: String,
    table: String,
    method: String,
    columns: String,
    unique: bool,
    exclusion: bool,
    partitioned: bool,
    valid: bool,
}

impl SimIndex {
    fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    // Same shape as `pg_get_indexdef`.
    fn definition(&self) -> String {
        let unique = if self.unique { "UNIQUE " } else { "" };
        format!(
            "CREATE {unique}INDEX {} ON {} USING {} ({})",
            self.name, self.table, self.method, self.columns
        )
    }

    fn descriptor(&self) -> anyhow::Result<IndexDescriptor> {
        Ok(IndexDescriptor {
            name: self.key().parse()?,
            table: self.table.parse()?,
            unique: self.unique,
            valid: self.valid,
            partitioned: self.partitioned,
            exclusion: self.exclusion,
            expression: self.columns.contains('('),
            definition: self.definition(),
        })
    }
}

#[derive(Clone, Debug, Default)]
struct Catalog {
    // Table name to the triggers defined on it.
    tables: BTreeMap<String, BTreeSet<String>>,
    indexes: BTreeMap<String, SimIndex>,
    write_block_function: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct Settings {
    lock_timeout: Duration,
    idle_in_transaction_timeout: Duration,
    statement_timeout: Duration,
}

#[derive(Debug)]
struct Frame {
    savepoint: Option<Identifier>,
    catalog: Catalog,
    settings: Settings,
    session: Settings,
}

#[derive(Debug)]
struct InjectedFailure {
    pattern: String,
    error: SimulatedError,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    catalog: Catalog,
    // Effective settings, including `SET LOCAL` overrides.
    settings: Settings,
    // Settings that survive the end of the current transaction.
    session: Settings,
    frames: Vec<Frame>,
    aborted: bool,
    // Tables another session holds a conflicting lock on, with how many
    // lock timeouts it takes before it lets go. `None` never lets go while a
    // lock timeout is set.
    held_locks: BTreeMap<String, Option<usize>>,
    failures: Vec<InjectedFailure>,
    invalid_builds: bool,
    statements: Vec<String>,
    analyzed: Vec<String>,
    dynamic_partitions: Vec<(String, String)>,
    detached_partitions: Vec<String>,
    // Advisory lock keys, mapped to whether this session is the holder.
    advisory_locks: BTreeMap<String, bool>,
}

fn qualify(name: &QualifiedName) -> String {
    let schema = name
        .schema
        .as_ref()
        .map(Identifier::as_str)
        .unwrap_or(DEFAULT_SCHEMA);
    format!("{schema}.{}", name.name)
}

fn key(name: &str) -> String {
    if name.contains('.') {
        name.to_owned()
    } else {
        format!("{DEFAULT_SCHEMA}.{name}")
    }
}

impl Inner {
    fn check_readable(&self) -> Result<(), DbError> {
        if self.aborted {
            return Err(other_error(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    fn take_injected_failure(&mut self, sql: &str) -> Option<DbError> {
        let position = self
            .failures
            .iter()
            .position(|failure| sql.contains(&failure.pattern))?;
        let error = self.failures[position].error.to_db_error(sql);
        match self.failures[position].remaining {
            Some(n) if n <= 1 => {
                self.failures.remove(position);
            },
            Some(n) => self.failures[position].remaining = Some(n - 1),
            None => {},
        }
        Some(error)
    }

    fn acquire(&mut self, table: &str) -> Result<(), DbError> {
        let Some(remaining) = self.held_locks.get(table).copied() else {
            return Ok(());
        };
        if !self.settings.lock_timeout.is_zero() {
            match remaining {
                Some(n) if n <= 1 => {
                    self.held_locks.remove(table);
                },
                Some(n) => {
                    self.held_locks.insert(table.to_owned(), Some(n - 1));
                },
                None => {},
            }
            return Err(lock_timeout_error());
        }
        if !self.settings.statement_timeout.is_zero() {
            return Err(statement_timeout_error());
        }
        // Waited for as long as it took the other session to finish.
        self.held_locks.remove(table);
        Ok(())
    }

    fn set(&mut self, scope: SettingScope, update: impl Fn(&mut Settings)) {
        match scope {
            // Outside a transaction block `SET LOCAL` only warns.
            SettingScope::Local if self.frames.is_empty() => {},
            SettingScope::Local => update(&mut self.settings),
            SettingScope::Session => {
                update(&mut self.settings);
                update(&mut self.session);
            },
        }
    }

    fn rollback(&mut self) {
        if let Some(frame) = self.frames.first() {
            self.catalog = frame.catalog.clone();
            self.settings = frame.session;
            self.session = frame.session;
        }
        self.frames.clear();
        self.aborted = false;
    }

    fn savepoint_position(&self, name: &Identifier) -> Result<usize, DbError> {
        self.frames
            .iter()
            .rposition(|frame| frame.savepoint.as_ref() == Some(name))
            .ok_or_else(|| other_error(format!("savepoint \"{name}\" does not exist")))
    }

    fn push_frame(&mut self, savepoint: Option<Identifier>) {
        self.frames.push(Frame {
            savepoint,
            catalog: self.catalog.clone(),
            settings: self.settings,
            session: self.session,
        });
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut BTreeSet<String>, DbError> {
        self.catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| other_error(format!("relation \"{table}\" does not exist")))
    }

    fn apply(&mut self, statement: &Statement, sql: &str) -> Result<(), DbError> {
        match statement {
            Statement::Rollback => {
                self.rollback();
                return Ok(());
            },
            Statement::Commit => {
                if self.aborted {
                    self.rollback();
                } else {
                    self.frames.clear();
                    self.settings = self.session;
                }
                return Ok(());
            },
            Statement::RollbackToSavepoint(name) => {
                let position = self.savepoint_position(name)?;
                let frame = &self.frames[position];
                self.catalog = frame.catalog.clone();
                self.settings = frame.settings;
                self.session = frame.session;
                self.frames.truncate(position + 1);
                self.aborted = false;
                return Ok(());
            },
            _ => {},
        }
        self.check_readable()?;
        if statement.is_concurrent() && !self.frames.is_empty() {
            return Err(other_error(format!(
                "{} cannot run inside a transaction block",
                statement.kind()
            )));
        }
        let injected = self.take_injected_failure(sql);
        if let Some(e) = injected {
            // A failed concurrent build leaves its invalid index behind.
            if let Statement::CreateIndexConcurrently {
                source,
                replacement,
                ..
            } = statement
            {
                self.create_index(source, replacement, false)?;
            }
            return Err(e);
        }

        match statement {
            Statement::Begin => {
                if !self.frames.is_empty() {
                    return Err(other_error(
                        "there is already a transaction in progress".to_owned(),
                    ));
                }
                self.push_frame(None);
            },
            Statement::Savepoint(name) => {
                if self.frames.is_empty() {
                    return Err(other_error(
                        "SAVEPOINT can only be used in transaction blocks".to_owned(),
                    ));
                }
                self.push_frame(Some(name.clone()));
            },
            Statement::ReleaseSavepoint(name) => {
                let position = self.savepoint_position(name)?;
                self.frames.truncate(position);
            },
            Statement::SetLockTimeout { timeout, scope } => {
                let timeout = *timeout;
                self.set(*scope, |s| s.lock_timeout = timeout);
            },
            Statement::SetIdleInTransactionTimeout { timeout, scope } => {
                let timeout = *timeout;
                self.set(*scope, |s| s.idle_in_transaction_timeout = timeout);
            },
            Statement::ResetLockSettings => self.set(SettingScope::Session, |s| {
                s.lock_timeout = Duration::ZERO;
                s.idle_in_transaction_timeout = Duration::ZERO;
            }),
            Statement::SetStatementTimeout(timeout) => {
                let timeout = *timeout;
                self.set(SettingScope::Session, |s| s.statement_timeout = timeout);
            },
            Statement::ResetStatementTimeout => {
                self.set(SettingScope::Session, |s| s.statement_timeout = Duration::ZERO)
            },
            Statement::CreateIndexConcurrently {
                source,
                replacement,
                ..
            } => {
                let valid = !self.invalid_builds;
                self.create_index(source, replacement, valid)?;
            },
            Statement::DropIndexConcurrently(index) => {
                let index = qualify(index);
                if let Some(table) = self.catalog.indexes.get(&index).map(|i| i.table.clone()) {
                    self.acquire(&table)?;
                    self.catalog.indexes.remove(&index);
                }
            },
            Statement::RenameIndex { index, to } => {
                let from = qualify(index);
                let Some(mut renamed) = self.catalog.indexes.get(&from).cloned() else {
                    return Err(other_error(format!("relation \"{index}\" does not exist")));
                };
                renamed.name = to.to_string();
                if self.catalog.indexes.contains_key(&renamed.key()) {
                    return Err(other_error(format!("relation \"{to}\" already exists")));
                }
                self.acquire(&renamed.table)?;
                self.catalog.indexes.remove(&from);
                self.catalog.indexes.insert(renamed.key(), renamed);
            },
            Statement::Analyze(table) => {
                let table = qualify(table);
                self.table_mut(&table)?;
                self.analyzed.push(table);
            },
            Statement::CreateWriteBlockFunction => self.catalog.write_block_function = true,
            Statement::CreateWriteTrigger { table, trigger } => {
                let table = qualify(table);
                self.table_mut(&table)?;
                if !self.catalog.write_block_function {
                    return Err(other_error(format!(
                        "function {WRITE_BLOCK_FUNCTION}() does not exist"
                    )));
                }
                self.acquire(&table)?;
                if !self.table_mut(&table)?.insert(trigger.to_string()) {
                    return Err(other_error(format!(
                        "trigger \"{trigger}\" for relation \"{table}\" already exists"
                    )));
                }
            },
            Statement::DropWriteTrigger { table, trigger } => {
                let table = qualify(table);
                self.table_mut(&table)?;
                self.acquire(&table)?;
                self.table_mut(&table)?.remove(trigger.as_str());
            },
            Statement::Commit | Statement::Rollback | Statement::RollbackToSavepoint(_) => {},
        }
        Ok(())
    }

    fn create_index(
        &mut self,
        source: &QualifiedName,
        replacement: &QualifiedName,
        valid: bool,
    ) -> Result<(), DbError> {
        let Some(mut index) = self.catalog.indexes.get(&qualify(source)).cloned() else {
            return Err(other_error(format!("relation \"{source}\" does not exist")));
        };
        if self.catalog.indexes.contains_key(&qualify(replacement)) {
            return Err(other_error(format!(
                "relation \"{replacement}\" already exists"
            )));
        }
        index.name = replacement.name.to_string();
        index.valid = valid;
        self.catalog.indexes.insert(index.key(), index);
        Ok(())
    }
}

#[derive(Clone)]
pub struct TestConnection {
    inner: Arc<Mutex<Inner>>,
}

impl TestConnection {
    pub fn new() -> Self {
        config_test();
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn add_table(&self, table: &str) {
        self.inner
            .lock()
            .catalog
            .tables
            .entry(key(table))
            .or_default();
    }

    pub fn add_index(&self, index: TestIndex) {
        let (schema, name) = match index.name.split_once('.') {
            Some((schema, name)) => (schema.to_owned(), name.to_owned()),
            None => (DEFAULT_SCHEMA.to_owned(), index.name.clone()),
        };
        let index = SimIndex {
            schema,
            name,
            table: key(&index.table),
            method: index.method,
            columns: index.columns,
            unique: index.unique,
            exclusion: index.exclusion,
            partitioned: index.partitioned,
            valid: index.valid,
        };
        let mut inner = self.inner.lock();
        inner.catalog.tables.entry(index.table.clone()).or_default();
        inner.catalog.indexes.insert(index.key(), index);
    }

    pub fn install_write_block_function(&self) {
        self.inner.lock().catalog.write_block_function = true;
    }

    pub fn write_block_function_installed(&self) -> bool {
        self.inner.lock().catalog.write_block_function
    }

    /// `partition` must be schema-qualified; `parent` is the parent table's
    /// bare name.
    pub fn add_dynamic_partition(&self, partition: &str, parent: &str) {
        self.add_table(partition);
        self.inner
            .lock()
            .dynamic_partitions
            .push((partition.to_owned(), parent.to_owned()));
    }

    pub fn add_detached_partition(&self, partition: &str) {
        self.add_table(partition);
        self.inner
            .lock()
            .detached_partitions
            .push(partition.to_owned());
    }

    /// Another session holds a lock on `table` that conflicts with DDL. With
    /// `Some(n)` it lets go after `n` lock timeouts; a statement without a
    /// lock timeout always waits it out unless a statement timeout is set.
    pub fn hold_table_lock(&self, table: &str, lock_timeouts: Option<usize>) {
        self.inner.lock().held_locks.insert(key(table), lock_timeouts);
    }

    /// Another session holds the advisory lock `key`.
    pub fn hold_advisory_lock(&self, key: &str) {
        self.inner
            .lock()
            .advisory_locks
            .insert(key.to_owned(), false);
    }

    pub fn advisory_lock_held(&self, key: &str) -> bool {
        self.inner.lock().advisory_locks.get(key) == Some(&true)
    }

    /// Every statement whose SQL contains `pattern` fails with `error`.
    pub fn inject_failure(&self, pattern: &str, error: SimulatedError) {
        self.inner.lock().failures.push(InjectedFailure {
            pattern: pattern.to_owned(),
            error,
            remaining: None,
        });
    }

    /// Like [`Self::inject_failure`], for the next `times` matching statements.
    pub fn inject_failure_times(&self, pattern: &str, error: SimulatedError, times: usize) {
        if times == 0 {
            return;
        }
        self.inner.lock().failures.push(InjectedFailure {
            pattern: pattern.to_owned(),
            error,
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Concurrent builds finish but leave the new index INVALID.
    pub fn set_invalid_builds(&self, invalid: bool) {
        self.inner.lock().invalid_builds = invalid;
    }

    /// SQL of every statement executed so far, failed ones included.
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.inner.lock().statements.clear();
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.inner.lock().catalog.tables.contains_key(&key(table))
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.inner.lock().catalog.indexes.contains_key(&key(index))
    }

    pub fn index_names(&self) -> Vec<String> {
        self.inner.lock().catalog.indexes.keys().cloned().collect()
    }

    pub fn index_definition(&self, index: &str) -> Option<String> {
        self.inner
            .lock()
            .catalog
            .indexes
            .get(&key(index))
            .map(SimIndex::definition)
    }

    pub fn index_valid(&self, index: &str) -> Option<bool> {
        self.inner
            .lock()
            .catalog
            .indexes
            .get(&key(index))
            .map(|index| index.valid)
    }

    pub fn has_trigger(&self, table: &str, trigger: &str) -> bool {
        self.inner
            .lock()
            .catalog
            .tables
            .get(&key(table))
            .is_some_and(|triggers| triggers.contains(trigger))
    }

    pub fn analyzed_tables(&self) -> Vec<String> {
        self.inner.lock().analyzed.clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock().settings.lock_timeout
    }

    pub fn idle_in_transaction_timeout(&self) -> Duration {
        self.inner.lock().settings.idle_in_transaction_timeout
    }

    pub fn statement_timeout(&self) -> Duration {
        self.inner.lock().settings.statement_timeout
    }

    /// Runs `DELETE FROM table` as an application would, through the write
    /// block trigger if one is installed.
    pub fn delete_from(&self, table: &str) -> Result<(), DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        let table = key(table);
        let Some(triggers) = inner.catalog.tables.get(&table) else {
            return Err(other_error(format!("relation \"{table}\" does not exist")));
        };
        let protected = inner.catalog.write_block_function
            && triggers
                .iter()
                .any(|trigger| trigger.starts_with(WRITE_TRIGGER_PREFIX));
        if protected {
            let name = table.rsplit('.').next().unwrap_or(&table);
            return Err(other_error(format!(
                "Table: \"{name}\" is write protected within this Gitlab database."
            )));
        }
        Ok(())
    }
}

impl Default for TestConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MaintenanceConnection for TestConnection {
    async fn execute(&self, statement: &Statement) -> Result<(), DbError> {
        let sql = statement.to_sql();
        let mut inner = self.inner.lock();
        inner.statements.push(sql.clone());
        let result = inner.apply(statement, &sql);
        if result.is_err() && !inner.frames.is_empty() {
            inner.aborted = true;
        }
        result
    }

    fn transaction_depth(&self) -> usize {
        self.inner.lock().frames.len()
    }

    async fn find_index(&self, index: &QualifiedName) -> Result<Option<IndexDescriptor>, DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        Ok(inner
            .catalog
            .indexes
            .get(&qualify(index))
            .map(SimIndex::descriptor)
            .transpose()?)
    }

    async fn table_exists(&self, table: &QualifiedName) -> Result<bool, DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        Ok(inner.catalog.tables.contains_key(&qualify(table)))
    }

    async fn trigger_exists(
        &self,
        table: &QualifiedName,
        trigger: &Identifier,
    ) -> Result<bool, DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        Ok(inner
            .catalog
            .tables
            .get(&qualify(table))
            .is_some_and(|triggers| triggers.contains(trigger.as_str())))
    }

    async fn dynamic_partitions(&self) -> Result<Vec<Partition>, DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        let mut partitions = vec![];
        for (name, parent) in &inner.dynamic_partitions {
            partitions.push(Partition {
                name: name.parse()?,
                parent: parent.parse()?,
            });
        }
        Ok(partitions)
    }

    async fn detached_partitions(&self) -> Result<Vec<QualifiedName>, DbError> {
        let inner = self.inner.lock();
        inner.check_readable()?;
        let mut partitions = vec![];
        for name in &inner.detached_partitions {
            partitions.push(name.parse()?);
        }
        Ok(partitions)
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool, DbError> {
        let mut inner = self.inner.lock();
        inner.check_readable()?;
        Ok(*inner.advisory_locks.entry(key.to_owned()).or_insert(true))
    }

    async fn advisory_unlock(&self, key: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.advisory_locks.get(key) == Some(&true) {
            inner.advisory_locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rollback_restores_catalog_and_settings() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        conn.add_index(TestIndex::btree("idx_foo", "users", "name"));
        conn.execute(&Statement::Begin).await?;
        conn.execute(&Statement::SetLockTimeout {
            timeout: Duration::from_millis(100),
            scope: SettingScope::Local,
        })
        .await?;
        conn.execute(&Statement::RenameIndex {
            index: "idx_foo".parse()?,
            to: "idx_bar".parse()?,
        })
        .await?;
        assert!(conn.has_index("idx_bar"));
        assert_eq!(conn.lock_timeout(), Duration::from_millis(100));
        conn.execute(&Statement::Rollback).await?;
        assert!(conn.has_index("idx_foo"));
        assert!(!conn.has_index("idx_bar"));
        assert_eq!(conn.lock_timeout(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn test_aborted_transaction_rejects_statements() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        conn.add_index(TestIndex::btree("idx_foo", "users", "name"));
        conn.execute(&Statement::Begin).await?;
        let rename = Statement::RenameIndex {
            index: "idx_missing".parse()?,
            to: "idx_bar".parse()?,
        };
        assert!(conn.execute(&rename).await.is_err());
        assert!(conn.find_index(&"idx_foo".parse()?).await.is_err());
        // COMMIT of an aborted transaction rolls back.
        conn.execute(&Statement::Commit).await?;
        assert_eq!(conn.transaction_depth(), 0);
        assert!(conn.find_index(&"idx_foo".parse()?).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_statements_refused_in_transaction() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        conn.add_index(TestIndex::btree("idx_foo", "users", "name"));
        conn.execute(&Statement::Begin).await?;
        let drop = Statement::DropIndexConcurrently("idx_foo".parse()?);
        assert!(conn.execute(&drop).await.is_err());
        conn.execute(&Statement::Rollback).await?;
        conn.execute(&drop).await?;
        assert!(!conn.has_index("idx_foo"));
        Ok(())
    }

    #[tokio::test]
    async fn test_descriptor_matches_catalog_definition() -> anyhow::Result<()> {
        let conn = TestConnection::new();
        conn.add_index(TestIndex::btree("idx_lower", "users", "lower(name)").unique());
        let index = conn
            .find_index(&"idx_lower".parse()?)
            .await?
            .expect("index exists");
        assert_eq!(index.name.to_string(), "public.idx_lower");
        assert_eq!(index.table.to_string(), "public.users");
        assert!(index.unique);
        assert!(index.expression);
        assert_eq!(
            index.definition,
            "CREATE UNIQUE INDEX idx_lower ON public.users USING btree (lower(name))"
        );
        Ok(())
    }
}
