//! Runs the coordinators against a real Postgres cluster. Skipped unless
//! `DB_MAINTENANCE_TEST_CLUSTER` is set.
use crate::{
    ConcurrentReindex,
    LockState,
    LockWritesAction,
    LockWritesManager,
    MaintenanceConnection,
    PgMaintenanceConnection,
    ReindexError,
    install_write_block_function,
    itest,
};

const INDEX_DEFINITION_SQL: &str = "SELECT pg_get_indexdef(to_regclass($1)::oid)";

async fn index_definition(
    client: &tokio_postgres::Client,
    index: &str,
) -> anyhow::Result<Option<String>> {
    let row = client.query_one(INDEX_DEFINITION_SQL, &[&index]).await?;
    Ok(row.try_get(0)?)
}

#[tokio::test]
async fn test_reindex_against_postgres() -> anyhow::Result<()> {
    let Some((url, client)) = itest::new_db().await? else {
        return Ok(());
    };
    client
        .batch_execute(
            "CREATE TABLE users (id bigserial PRIMARY KEY, name text);
             INSERT INTO users (name) SELECT 'user' || g FROM generate_series(1, 1000) g;
             CREATE INDEX idx_foo ON users (name);
             CREATE INDEX idx_lower_name ON users (lower(name));
             CREATE UNIQUE INDEX idx_unique_name ON users (name);",
        )
        .await?;
    let before = index_definition(&client, "idx_foo").await?;
    assert!(before.is_some());

    let conn = PgMaintenanceConnection::connect(&url).await?;
    ConcurrentReindex::new("idx_foo".parse()?, conn.clone())
        .execute()
        .await?;
    assert_eq!(index_definition(&client, "idx_foo").await?, before);
    assert_eq!(index_definition(&client, "tmp_reindex_idx_foo").await?, None);
    assert_eq!(index_definition(&client, "old_reindex_idx_foo").await?, None);

    ConcurrentReindex::new("idx_lower_name".parse()?, conn.clone())
        .execute()
        .await?;
    let unique = ConcurrentReindex::new("idx_unique_name".parse()?, conn.clone())
        .execute()
        .await;
    assert!(matches!(unique, Err(ReindexError::Unique)), "{unique:?}");
    assert_eq!(conn.transaction_depth(), 0);
    Ok(())
}

#[tokio::test]
async fn test_lock_writes_against_postgres() -> anyhow::Result<()> {
    let Some((url, client)) = itest::new_db().await? else {
        return Ok(());
    };
    client
        .batch_execute("CREATE TABLE orders (id bigserial PRIMARY KEY, total numeric);")
        .await?;
    let conn = PgMaintenanceConnection::connect(&url).await?;
    install_write_block_function(&*conn).await?;
    let manager = LockWritesManager::new("orders".parse()?, conn.clone(), "main");

    assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Locked);
    assert_eq!(manager.lock_state().await?, LockState::Locked);
    let err = client
        .batch_execute("DELETE FROM orders")
        .await
        .unwrap_err();
    let message = err
        .as_db_error()
        .map(|e| e.message().to_owned())
        .unwrap_or_default();
    assert!(message.contains("is write protected"), "{err:?}");
    assert_eq!(manager.lock_writes().await?.action, LockWritesAction::Skipped);

    assert_eq!(manager.unlock_writes().await?.action, LockWritesAction::Unlocked);
    client.batch_execute("DELETE FROM orders").await?;

    let missing = LockWritesManager::new("missing_table".parse()?, conn.clone(), "main");
    assert_eq!(missing.lock_state().await?, LockState::Missing);
    Ok(())
}
