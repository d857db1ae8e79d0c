use serde::Serialize;

use crate::identifiers::{
    Identifier,
    QualifiedName,
};

/// An index as the catalog describes it right now. Always read fresh; a
/// descriptor is stale as soon as any DDL runs against the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: QualifiedName,
    pub table: QualifiedName,
    pub unique: bool,
    pub valid: bool,
    pub partitioned: bool,
    pub exclusion: bool,
    /// Has at least one expression column, so its statistics live with the
    /// index rather than the table.
    pub expression: bool,
    /// `pg_get_indexdef` output.
    pub definition: String,
}

impl IndexDescriptor {
    /// The definition of this index rewritten to build `replacement`
    /// concurrently. Only the name changes; columns, method, predicate and
    /// storage parameters are kept verbatim.
    pub fn concurrent_definition(&self, replacement: &Identifier) -> anyhow::Result<String> {
        let name = &self.name.name;
        let target = format!("CREATE INDEX CONCURRENTLY {} ON ", replacement.quoted());
        // `pg_get_indexdef` quotes names only when it has to.
        for current in [name.as_str().to_owned(), name.quoted()] {
            let prefix = format!("CREATE INDEX {current} ON ");
            if let Some(rest) = self.definition.strip_prefix(&prefix) {
                return Ok(format!("{target}{rest}"));
            }
        }
        anyhow::bail!(
            "unexpected definition for index {}: {}",
            self.name,
            self.definition
        )
    }
}

/// A partition living outside the default search path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub name: QualifiedName,
    pub parent: Identifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
    Missing,
}
