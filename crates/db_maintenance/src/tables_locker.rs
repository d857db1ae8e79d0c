//! Write-locks every table on the databases that don't own it.
//!
//! A table belongs to one gitlab schema. On a database whose home schemas
//! include it, or when the schema is shared by all databases, the table
//! must accept writes. Everywhere else it is locked so that a misrouted
//! write fails loudly instead of silently splitting the data.
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    sync::Arc,
};

use anyhow::Context as _;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    connection::MaintenanceConnection,
    identifiers::QualifiedName,
    lock_writes::{
        LockWritesManager,
        LockWritesResult,
        install_write_block_function,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GitlabSchema(String);

impl GitlabSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GitlabSchema {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for GitlabSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which gitlab schema every table belongs to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchemaDictionary {
    tables: BTreeMap<String, GitlabSchema>,
    /// Schemas whose tables are written on every database.
    #[serde(default)]
    shared_schemas: BTreeSet<GitlabSchema>,
}

impl SchemaDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, schema: impl Into<GitlabSchema>) -> Self {
        self.tables.insert(table.to_owned(), schema.into());
        self
    }

    pub fn with_shared_schema(mut self, schema: impl Into<GitlabSchema>) -> Self {
        self.shared_schemas.insert(schema.into());
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &GitlabSchema)> {
        self.tables.iter().map(|(table, schema)| (table.as_str(), schema))
    }

    pub fn table_schema(&self, table: &str) -> Option<&GitlabSchema> {
        self.tables.get(table)
    }

    pub fn is_shared(&self, schema: &GitlabSchema) -> bool {
        self.shared_schemas.contains(schema)
    }

    /// Schema of the longest table name that `partition` starts with.
    /// Partitions are named after their parent table plus an `_` suffix.
    pub fn schema_for_partition(&self, partition: &str) -> Option<&GitlabSchema> {
        self.tables
            .iter()
            .filter_map(|(table, schema)| {
                let bare = table.rsplit('.').next().unwrap_or(table);
                let suffix = partition.strip_prefix(bare)?;
                suffix.starts_with('_').then_some((bare.len(), schema))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, schema)| schema)
    }
}

pub struct LogicalDatabase {
    pub name: String,
    pub connection: Arc<dyn MaintenanceConnection>,
    /// Gitlab schemas this database is the home of.
    pub schemas: BTreeSet<GitlabSchema>,
    /// Set when this database is served by another database's connection,
    /// in which case that database covers it.
    pub shares_connection_with: Option<String>,
}

impl LogicalDatabase {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn MaintenanceConnection>,
        schemas: impl IntoIterator<Item = GitlabSchema>,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            schemas: schemas.into_iter().collect(),
            shares_connection_with: None,
        }
    }

    pub fn sharing_connection_with(mut self, database: impl Into<String>) -> Self {
        self.shares_connection_with = Some(database.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Lock,
    Unlock,
}

pub struct TablesLocker {
    databases: Vec<LogicalDatabase>,
    dictionary: SchemaDictionary,
    include_partitions: bool,
    dry_run: bool,
    with_retries: bool,
}

impl TablesLocker {
    pub fn new(databases: Vec<LogicalDatabase>, dictionary: SchemaDictionary) -> Self {
        Self {
            databases,
            dictionary,
            include_partitions: true,
            dry_run: false,
            with_retries: true,
        }
    }

    pub fn include_partitions(mut self, include_partitions: bool) -> Self {
        self.include_partitions = include_partitions;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_retries(mut self, with_retries: bool) -> Self {
        self.with_retries = with_retries;
        self
    }

    /// Locks every table on the databases that don't own it and unlocks it on
    /// the ones that do.
    pub async fn lock_writes(&self) -> anyhow::Result<Vec<LockWritesResult>> {
        self.process(Mode::Lock).await
    }

    pub async fn unlock_writes(&self) -> anyhow::Result<Vec<LockWritesResult>> {
        self.process(Mode::Unlock).await
    }

    async fn process(&self, mode: Mode) -> anyhow::Result<Vec<LockWritesResult>> {
        let mut results = vec![];
        for database in &self.databases {
            if let Some(owner) = &database.shares_connection_with {
                tracing::info!(
                    database = %database.name,
                    shares_connection_with = %owner,
                    "skipping database that shares its connection"
                );
                continue;
            }
            if mode == Mode::Lock && !self.dry_run {
                install_write_block_function(&*database.connection)
                    .await
                    .with_context(|| format!("database {}", database.name))?;
            }
            for (table, schema) in self.dictionary.tables() {
                let table: QualifiedName = table
                    .parse()
                    .with_context(|| format!("invalid table name {table:?} in schema dictionary"))?;
                results.push(self.process_table(database, table, schema, mode).await?);
            }
            if self.include_partitions {
                self.process_partitions(database, mode, &mut results)
                    .await?;
            }
        }
        Ok(results)
    }

    async fn process_partitions(
        &self,
        database: &LogicalDatabase,
        mode: Mode,
        results: &mut Vec<LockWritesResult>,
    ) -> anyhow::Result<()> {
        for partition in database.connection.dynamic_partitions().await? {
            let Some(schema) = self.dictionary.table_schema(partition.parent.as_str()) else {
                tracing::warn!(
                    database = %database.name,
                    table = %partition.name,
                    parent = %partition.parent,
                    "skipping partition whose parent is not in the schema dictionary"
                );
                continue;
            };
            results.push(
                self.process_table(database, partition.name, schema, mode)
                    .await?,
            );
        }
        for partition in database.connection.detached_partitions().await? {
            let Some(schema) = self
                .dictionary
                .schema_for_partition(partition.name.as_str())
            else {
                tracing::warn!(
                    database = %database.name,
                    table = %partition,
                    "skipping detached partition with no matching table in the schema dictionary"
                );
                continue;
            };
            results.push(self.process_table(database, partition, schema, mode).await?);
        }
        Ok(())
    }

    async fn process_table(
        &self,
        database: &LogicalDatabase,
        table: QualifiedName,
        schema: &GitlabSchema,
        mode: Mode,
    ) -> anyhow::Result<LockWritesResult> {
        let manager = LockWritesManager::new(table, database.connection.clone(), &database.name)
            .with_retries(self.with_retries)
            .dry_run(self.dry_run);
        let lock = mode == Mode::Lock
            && !self.dictionary.is_shared(schema)
            && !database.schemas.contains(schema);
        if lock {
            manager.lock_writes().await
        } else {
            manager.unlock_writes().await
        }
    }
}
