/// Schema holding dynamically created partitions.
pub const DYNAMIC_PARTITIONS_SCHEMA: &str = "gitlab_partitions_dynamic";

/// Every write-locked table gets a trigger named with this prefix followed
/// by the table name.
pub const WRITE_TRIGGER_PREFIX: &str = "gitlab_schema_write_trigger_for_";

pub const WRITE_BLOCK_FUNCTION: &str = "gitlab_schema_prevent_write";

// Idempotent: safe to run before every lock pass.
pub const CREATE_WRITE_BLOCK_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION gitlab_schema_prevent_write() RETURNS TRIGGER AS $$
BEGIN
    RAISE EXCEPTION 'Table: "%" is write protected within this Gitlab database.', TG_TABLE_NAME
        USING ERRCODE = 'modifying_sql_data_not_permitted',
        HINT = 'Make sure you are using the right database connection';
END
$$ LANGUAGE PLPGSQL
"#;

// Unqualified names resolve against `current_schema()`, which is what an
// unqualified DDL statement on the same connection would touch.
pub(crate) const FIND_INDEX_SQL: &str = r#"
SELECT
    n.nspname::text AS index_schema,
    i.relname::text AS index_name,
    tn.nspname::text AS table_schema,
    t.relname::text AS table_name,
    x.indisunique AS is_unique,
    x.indisvalid AS is_valid,
    i.relkind = 'I' AS is_partitioned,
    x.indisexclusion AS is_exclusion,
    x.indexprs IS NOT NULL AS is_expression,
    pg_get_indexdef(x.indexrelid) AS definition
FROM pg_index x
JOIN pg_class i ON i.oid = x.indexrelid
JOIN pg_namespace n ON n.oid = i.relnamespace
JOIN pg_class t ON t.oid = x.indrelid
JOIN pg_namespace tn ON tn.oid = t.relnamespace
WHERE n.nspname = COALESCE($1::text, current_schema())
  AND i.relname = $2::text
"#;

pub(crate) const TABLE_EXISTS_SQL: &str = r#"
SELECT 1
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = COALESCE($1::text, current_schema())
  AND c.relname = $2::text
  AND c.relkind IN ('r', 'p')
"#;

pub(crate) const TRIGGER_EXISTS_SQL: &str = r#"
SELECT 1
FROM pg_trigger tg
JOIN pg_class c ON c.oid = tg.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = COALESCE($1::text, current_schema())
  AND c.relname = $2::text
  AND tg.tgname = $3::text
"#;

pub(crate) const DYNAMIC_PARTITIONS_SQL: &str = r#"
SELECT
    child_ns.nspname::text AS partition_schema,
    child.relname::text AS partition_name,
    parent.relname::text AS parent_name
FROM pg_inherits inh
JOIN pg_class child ON child.oid = inh.inhrelid
JOIN pg_namespace child_ns ON child_ns.oid = child.relnamespace
JOIN pg_class parent ON parent.oid = inh.inhparent
WHERE child_ns.nspname = $1::text
  AND child.relkind IN ('r', 'p')
ORDER BY child.relname
"#;

// `detached_partitions` only exists once partitioning has been set up, so
// probe for it before reading it.
pub(crate) const DETACHED_PARTITIONS_TABLE_EXISTS_SQL: &str =
    r"SELECT to_regclass('detached_partitions') IS NOT NULL";

pub(crate) const DETACHED_PARTITIONS_SQL: &str =
    r"SELECT table_name::text FROM detached_partitions ORDER BY table_name";

pub(crate) const TRY_ADVISORY_LOCK_SQL: &str = r"SELECT pg_try_advisory_lock(hashtext($1::text))";

pub(crate) const ADVISORY_UNLOCK_SQL: &str = r"SELECT pg_advisory_unlock(hashtext($1::text))";
