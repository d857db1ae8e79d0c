use std::{
    env,
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering::SeqCst,
        },
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{
    Future,
    FutureExt as _,
    select_biased,
};
use rustls::{
    ClientConfig,
    RootCertStore,
};
use rustls_pki_types::{
    CertificateDer,
    pem::PemObject,
};
use tokio::{
    task::JoinHandle,
    time::sleep,
};
use tokio_postgres::Row;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::{
    catalog::{
        IndexDescriptor,
        Partition,
    },
    errors::DbError,
    identifiers::{
        Identifier,
        QualifiedName,
    },
    knobs::POSTGRES_TIMEOUT,
    metrics::{
        log_statement,
        log_statement_error,
    },
    sql,
    statement::Statement,
};

/// The slice of a database session the maintenance engine needs. All state
/// lives in the catalog; implementations only track how many transaction
/// blocks are open on the session.
///
/// A connection is one session: `SET LOCAL`, savepoints and advisory locks
/// only make sense if every call goes to the same backend.
#[async_trait]
pub trait MaintenanceConnection: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<(), DbError>;

    /// Open transaction blocks: the transaction itself plus any savepoints.
    fn transaction_depth(&self) -> usize;

    fn transaction_open(&self) -> bool {
        self.transaction_depth() > 0
    }

    async fn find_index(&self, index: &QualifiedName) -> Result<Option<IndexDescriptor>, DbError>;

    async fn table_exists(&self, table: &QualifiedName) -> Result<bool, DbError>;

    async fn trigger_exists(
        &self,
        table: &QualifiedName,
        trigger: &Identifier,
    ) -> Result<bool, DbError>;

    /// Partitions in the dynamic partitions schema, with their parent table.
    async fn dynamic_partitions(&self) -> Result<Vec<Partition>, DbError>;

    /// Partitions detached from their parent but not dropped yet.
    async fn detached_partitions(&self) -> Result<Vec<QualifiedName>, DbError>;

    /// Session-level advisory lock keyed by `key`. Returns false if another
    /// session holds it.
    async fn try_advisory_lock(&self, key: &str) -> Result<bool, DbError>;

    async fn advisory_unlock(&self, key: &str) -> Result<(), DbError>;
}

// Catalog reads and transaction control should come back quickly; a hung
// connection here would otherwise stall a maintenance run forever. DDL is not
// wrapped since index builds legitimately run for hours.
pub(crate) async fn with_timeout<R, E, Fut>(f: Fut) -> Result<R, DbError>
where
    Fut: Future<Output = Result<R, E>>,
    E: Into<DbError>,
{
    select_biased! {
        r = f.fuse() => r.map_err(Into::into),
        _ = sleep(*POSTGRES_TIMEOUT).fuse() => {
            Err(DbError::Other(anyhow::anyhow!("Postgres timeout")))
        },
    }
}

/// A single tokio-postgres session.
pub struct PgMaintenanceConnection {
    client: tokio_postgres::Client,
    depth: AtomicUsize,
    worker: JoinHandle<()>,
}

impl PgMaintenanceConnection {
    pub async fn connect(url: &str) -> anyhow::Result<Arc<Self>> {
        let config: tokio_postgres::Config =
            url.parse().context("invalid postgres connection url")?;
        let (client, connection) = config
            .connect(make_tls_connector()?)
            .await
            .context("failed to connect to postgres")?;
        let worker = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection closed with error: {e}");
            }
        });
        Ok(Arc::new(Self {
            client,
            depth: AtomicUsize::new(0),
            worker,
        }))
    }

    fn track_depth(&self, statement: &Statement) {
        match statement {
            Statement::Begin | Statement::Savepoint(_) => {
                self.depth.fetch_add(1, SeqCst);
            },
            Statement::ReleaseSavepoint(_) => {
                let _ = self
                    .depth
                    .fetch_update(SeqCst, SeqCst, |depth| depth.checked_sub(1));
            },
            Statement::Commit | Statement::Rollback => self.depth.store(0, SeqCst),
            _ => {},
        }
    }

    async fn query_opt(
        &self,
        statement: &'static str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<Row>, DbError> {
        with_timeout(self.client.query_opt(statement, params)).await
    }

    async fn query(
        &self,
        statement: &'static str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        with_timeout(self.client.query(statement, params)).await
    }
}

impl Drop for PgMaintenanceConnection {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn is_transaction_control(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Begin
            | Statement::Commit
            | Statement::Rollback
            | Statement::Savepoint(_)
            | Statement::ReleaseSavepoint(_)
            | Statement::RollbackToSavepoint(_)
    )
}

#[async_trait]
impl MaintenanceConnection for PgMaintenanceConnection {
    async fn execute(&self, statement: &Statement) -> Result<(), DbError> {
        let sql = statement.to_sql();
        tracing::debug!(%sql, "executing statement");
        log_statement(statement.kind());
        let result = if is_transaction_control(statement) {
            with_timeout(self.client.batch_execute(&sql)).await
        } else {
            self.client.batch_execute(&sql).await.map_err(DbError::from)
        };
        match result {
            Ok(()) => {
                self.track_depth(statement);
                Ok(())
            },
            Err(e) => {
                log_statement_error(statement.kind(), &e);
                Err(e)
            },
        }
    }

    fn transaction_depth(&self) -> usize {
        self.depth.load(SeqCst)
    }

    async fn find_index(&self, index: &QualifiedName) -> Result<Option<IndexDescriptor>, DbError> {
        let schema = index.schema.as_ref().map(Identifier::as_str);
        let Some(row) = self
            .query_opt(sql::FIND_INDEX_SQL, &[&schema, &index.name.as_str()])
            .await?
        else {
            return Ok(None);
        };
        let index_schema: String = row.try_get("index_schema")?;
        let index_name: String = row.try_get("index_name")?;
        let table_schema: String = row.try_get("table_schema")?;
        let table_name: String = row.try_get("table_name")?;
        Ok(Some(IndexDescriptor {
            name: QualifiedName::new(Some(index_schema.parse()?), index_name.parse()?),
            table: QualifiedName::new(Some(table_schema.parse()?), table_name.parse()?),
            unique: row.try_get("is_unique")?,
            valid: row.try_get("is_valid")?,
            partitioned: row.try_get("is_partitioned")?,
            exclusion: row.try_get("is_exclusion")?,
            expression: row.try_get("is_expression")?,
            definition: row.try_get("definition")?,
        }))
    }

    async fn table_exists(&self, table: &QualifiedName) -> Result<bool, DbError> {
        let schema = table.schema.as_ref().map(Identifier::as_str);
        Ok(self
            .query_opt(sql::TABLE_EXISTS_SQL, &[&schema, &table.name.as_str()])
            .await?
            .is_some())
    }

    async fn trigger_exists(
        &self,
        table: &QualifiedName,
        trigger: &Identifier,
    ) -> Result<bool, DbError> {
        let schema = table.schema.as_ref().map(Identifier::as_str);
        Ok(self
            .query_opt(
                sql::TRIGGER_EXISTS_SQL,
                &[&schema, &table.name.as_str(), &trigger.as_str()],
            )
            .await?
            .is_some())
    }

    async fn dynamic_partitions(&self) -> Result<Vec<Partition>, DbError> {
        let rows = self
            .query(sql::DYNAMIC_PARTITIONS_SQL, &[&sql::DYNAMIC_PARTITIONS_SCHEMA])
            .await?;
        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: String = row.try_get("partition_schema")?;
            let name: String = row.try_get("partition_name")?;
            let parent: String = row.try_get("parent_name")?;
            partitions.push(Partition {
                name: QualifiedName::new(Some(schema.parse()?), name.parse()?),
                parent: parent.parse()?,
            });
        }
        Ok(partitions)
    }

    async fn detached_partitions(&self) -> Result<Vec<QualifiedName>, DbError> {
        let exists: bool = self
            .query_opt(sql::DETACHED_PARTITIONS_TABLE_EXISTS_SQL, &[])
            .await?
            .map(|row| row.try_get(0))
            .transpose()?
            .unwrap_or(false);
        if !exists {
            return Ok(vec![]);
        }
        let rows = self.query(sql::DETACHED_PARTITIONS_SQL, &[]).await?;
        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            // Rows are stored schema-qualified, but older rows may not be.
            let name = if name.contains('.') {
                name.parse()?
            } else {
                QualifiedName::new(Some(sql::DYNAMIC_PARTITIONS_SCHEMA.parse()?), name.parse()?)
            };
            partitions.push(name);
        }
        Ok(partitions)
    }

    async fn try_advisory_lock(&self, key: &str) -> Result<bool, DbError> {
        let row = self
            .query_opt(sql::TRY_ADVISORY_LOCK_SQL, &[&key])
            .await?
            .context("pg_try_advisory_lock returned nothing?")?;
        Ok(row.try_get(0)?)
    }

    async fn advisory_unlock(&self, key: &str) -> Result<(), DbError> {
        let released: Option<bool> = self
            .query_opt(sql::ADVISORY_UNLOCK_SQL, &[&key])
            .await?
            .map(|row| row.try_get(0))
            .transpose()?;
        if released != Some(true) {
            tracing::warn!("advisory lock {key} was not held by this session");
        }
        Ok(())
    }
}

fn make_tls_connector() -> anyhow::Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    if let Some(ca_file_path) = env::var_os("PG_CA_FILE")
        && !ca_file_path.is_empty()
    {
        let ca_file_path = Path::new(&ca_file_path);
        let ca_file_content = fs::read(ca_file_path)
            .with_context(|| format!("Failed to read CA file: {}", ca_file_path.display()))?;
        for ca_cert in CertificateDer::pem_slice_iter(&ca_file_content) {
            roots.add(ca_cert.with_context(|| {
                format!("Failed to parse CA file as PEM: {}", ca_file_path.display())
            })?)?;
        }
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}
