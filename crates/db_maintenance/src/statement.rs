use std::{
    fmt,
    time::Duration,
};

use crate::{
    catalog::IndexDescriptor,
    identifiers::{
        Identifier,
        QualifiedName,
    },
    sql::{
        CREATE_WRITE_BLOCK_FUNCTION_SQL,
        WRITE_BLOCK_FUNCTION,
        WRITE_TRIGGER_PREFIX,
    },
};

/// Whether a `SET` lasts until the end of the current transaction or for the
/// rest of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingScope {
    Local,
    Session,
}

/// Every statement the maintenance engine issues. Names are validated
/// [`Identifier`]s, so rendering never interpolates raw strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Savepoint(Identifier),
    ReleaseSavepoint(Identifier),
    RollbackToSavepoint(Identifier),
    SetLockTimeout {
        timeout: Duration,
        scope: SettingScope,
    },
    SetIdleInTransactionTimeout {
        timeout: Duration,
        scope: SettingScope,
    },
    /// `RESET` both `lock_timeout` and `idle_in_transaction_session_timeout`.
    ResetLockSettings,
    SetStatementTimeout(Duration),
    ResetStatementTimeout,
    CreateIndexConcurrently {
        source: QualifiedName,
        replacement: QualifiedName,
        definition: String,
    },
    DropIndexConcurrently(QualifiedName),
    RenameIndex {
        index: QualifiedName,
        to: Identifier,
    },
    Analyze(QualifiedName),
    CreateWriteBlockFunction,
    CreateWriteTrigger {
        table: QualifiedName,
        trigger: Identifier,
    },
    DropWriteTrigger {
        table: QualifiedName,
        trigger: Identifier,
    },
}

/// Trigger installed on `table` while it is locked for writes.
pub fn write_trigger_name(table: &QualifiedName) -> anyhow::Result<Identifier> {
    Identifier::prefixed(WRITE_TRIGGER_PREFIX, &table.name)
}

impl Statement {
    pub fn create_index_concurrently(
        source: &IndexDescriptor,
        replacement: &Identifier,
    ) -> anyhow::Result<Self> {
        Ok(Statement::CreateIndexConcurrently {
            source: source.name.clone(),
            replacement: source.name.sibling(replacement.clone()),
            definition: source.concurrent_definition(replacement)?,
        })
    }

    pub fn create_write_trigger(table: &QualifiedName) -> anyhow::Result<Self> {
        Ok(Statement::CreateWriteTrigger {
            table: table.clone(),
            trigger: write_trigger_name(table)?,
        })
    }

    pub fn drop_write_trigger(table: &QualifiedName) -> anyhow::Result<Self> {
        Ok(Statement::DropWriteTrigger {
            table: table.clone(),
            trigger: write_trigger_name(table)?,
        })
    }

    /// Statements that Postgres refuses to run inside a transaction block.
    pub fn is_concurrent(&self) -> bool {
        matches!(
            self,
            Statement::CreateIndexConcurrently { .. } | Statement::DropIndexConcurrently(_)
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Begin => "begin",
            Statement::Commit => "commit",
            Statement::Rollback => "rollback",
            Statement::Savepoint(_) => "savepoint",
            Statement::ReleaseSavepoint(_) => "release_savepoint",
            Statement::RollbackToSavepoint(_) => "rollback_to_savepoint",
            Statement::SetLockTimeout { .. }
            | Statement::SetIdleInTransactionTimeout { .. }
            | Statement::ResetLockSettings
            | Statement::SetStatementTimeout(_)
            | Statement::ResetStatementTimeout => "setting",
            Statement::CreateIndexConcurrently { .. } => "create_index",
            Statement::DropIndexConcurrently(_) => "drop_index",
            Statement::RenameIndex { .. } => "rename_index",
            Statement::Analyze(_) => "analyze",
            Statement::CreateWriteBlockFunction => "create_function",
            Statement::CreateWriteTrigger { .. } => "create_trigger",
            Statement::DropWriteTrigger { .. } => "drop_trigger",
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Statement::Begin => "BEGIN".to_owned(),
            Statement::Commit => "COMMIT".to_owned(),
            Statement::Rollback => "ROLLBACK".to_owned(),
            Statement::Savepoint(name) => format!("SAVEPOINT {}", name.quoted()),
            Statement::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {}", name.quoted()),
            Statement::RollbackToSavepoint(name) => {
                format!("ROLLBACK TO SAVEPOINT {}", name.quoted())
            },
            Statement::SetLockTimeout { timeout, scope } => {
                set_sql(*scope, "lock_timeout", *timeout)
            },
            Statement::SetIdleInTransactionTimeout { timeout, scope } => {
                set_sql(*scope, "idle_in_transaction_session_timeout", *timeout)
            },
            Statement::ResetLockSettings => {
                "RESET idle_in_transaction_session_timeout; RESET lock_timeout".to_owned()
            },
            Statement::SetStatementTimeout(timeout) => {
                set_sql(SettingScope::Session, "statement_timeout", *timeout)
            },
            Statement::ResetStatementTimeout => "RESET statement_timeout".to_owned(),
            Statement::CreateIndexConcurrently { definition, .. } => definition.clone(),
            Statement::DropIndexConcurrently(index) => {
                format!("DROP INDEX CONCURRENTLY IF EXISTS {}", index.quoted())
            },
            Statement::RenameIndex { index, to } => {
                format!("ALTER INDEX {} RENAME TO {}", index.quoted(), to.quoted())
            },
            Statement::Analyze(table) => format!("ANALYZE {}", table.quoted()),
            Statement::CreateWriteBlockFunction => CREATE_WRITE_BLOCK_FUNCTION_SQL.trim().to_owned(),
            Statement::CreateWriteTrigger { table, trigger } => format!(
                "CREATE TRIGGER {} BEFORE INSERT OR UPDATE OR DELETE OR TRUNCATE ON {} FOR EACH \
                 STATEMENT EXECUTE FUNCTION {WRITE_BLOCK_FUNCTION}()",
                trigger.quoted(),
                table.quoted(),
            ),
            Statement::DropWriteTrigger { table, trigger } => format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                trigger.quoted(),
                table.quoted(),
            ),
        }
    }
}

fn set_sql(scope: SettingScope, setting: &str, value: Duration) -> String {
    let local = match scope {
        SettingScope::Local => "LOCAL ",
        SettingScope::Session => "",
    };
    format!("SET {local}{setting} TO '{}ms'", value.as_millis())
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_session_statements() -> anyhow::Result<()> {
        assert_eq!(
            Statement::SetLockTimeout {
                timeout: Duration::from_millis(100),
                scope: SettingScope::Local,
            }
            .to_sql(),
            "SET LOCAL lock_timeout TO '100ms'"
        );
        assert_eq!(
            Statement::SetStatementTimeout(Duration::from_secs(6 * 60 * 60)).to_sql(),
            "SET statement_timeout TO '21600000ms'"
        );
        assert_eq!(
            Statement::Savepoint(Identifier::new("lock_retries")?).to_sql(),
            "SAVEPOINT \"lock_retries\""
        );
        Ok(())
    }

    #[test]
    fn test_write_trigger_statements() -> anyhow::Result<()> {
        let table: QualifiedName = "orders".parse()?;
        assert_eq!(
            Statement::create_write_trigger(&table)?.to_sql(),
            "CREATE TRIGGER \"gitlab_schema_write_trigger_for_orders\" BEFORE INSERT OR UPDATE \
             OR DELETE OR TRUNCATE ON \"orders\" FOR EACH STATEMENT EXECUTE FUNCTION \
             gitlab_schema_prevent_write()"
        );
        assert_eq!(
            Statement::drop_write_trigger(&table)?.to_sql(),
            "DROP TRIGGER IF EXISTS \"gitlab_schema_write_trigger_for_orders\" ON \"orders\""
        );
        Ok(())
    }

    #[test]
    fn test_index_statements() -> anyhow::Result<()> {
        let index: QualifiedName = "public.idx_foo".parse()?;
        assert_eq!(
            Statement::RenameIndex {
                index: index.clone(),
                to: Identifier::new("old_reindex_idx_foo")?,
            }
            .to_sql(),
            "ALTER INDEX \"public\".\"idx_foo\" RENAME TO \"old_reindex_idx_foo\""
        );
        let drop = Statement::DropIndexConcurrently(index);
        assert!(drop.is_concurrent());
        assert_eq!(
            drop.to_sql(),
            "DROP INDEX CONCURRENTLY IF EXISTS \"public\".\"idx_foo\""
        );
        Ok(())
    }
}
