use std::{
    fmt,
    str::FromStr,
};

use postgres_protocol::escape::escape_identifier;
use serde::{
    Deserialize,
    Serialize,
};

/// Postgres silently truncates identifiers longer than `NAMEDATALEN - 1`
/// bytes, so we truncate (and validate) before any SQL is formatted.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// A single validated, unquoted Postgres identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn new(raw: impl Into<String>) -> anyhow::Result<Self> {
        let raw = raw.into();
        anyhow::ensure!(
            raw.len() <= MAX_IDENTIFIER_LEN,
            "identifier {raw:?} is longer than {MAX_IDENTIFIER_LEN} bytes"
        );
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            anyhow::bail!("identifier must not be empty");
        };
        anyhow::ensure!(
            first.is_ascii_alphabetic() || first == '_',
            "identifier {raw:?} must start with a letter or underscore"
        );
        anyhow::ensure!(
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
            "identifier {raw:?} contains characters outside [A-Za-z0-9_$]"
        );
        Ok(Self(raw))
    }

    /// `prefix` followed by `name`, cut at the identifier length limit.
    /// Identifiers are ASCII, so any byte offset is a char boundary.
    pub fn prefixed(prefix: &str, name: &Identifier) -> anyhow::Result<Self> {
        let mut combined = format!("{prefix}{}", name.0);
        combined.truncate(MAX_IDENTIFIER_LEN);
        Self::new(combined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Always-quoted form, safe to splice into SQL.
    pub fn quoted(&self) -> String {
        escape_identifier(&self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// A relation name with an optional explicit schema. Without a schema the
/// name resolves through the connection's `search_path`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub schema: Option<Identifier>,
    pub name: Identifier,
}

impl QualifiedName {
    pub fn new(schema: Option<Identifier>, name: Identifier) -> Self {
        Self { schema, name }
    }

    pub fn unqualified(name: Identifier) -> Self {
        Self { schema: None, name }
    }

    /// Same schema, different relation name.
    pub fn sibling(&self, name: Identifier) -> Self {
        Self {
            schema: self.schema.clone(),
            name,
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema.quoted(), self.name.quoted()),
            None => self.name.quoted(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for QualifiedName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, name)) => Ok(Self::new(Some(schema.parse()?), name.parse()?)),
            None => Ok(Self::unqualified(s.parse()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use cmd_util::env::env_config;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_rejects_unsafe_identifiers() {
        assert!(Identifier::new("").is_err());
        assert!(Identifier::new("1users").is_err());
        assert!(Identifier::new("users; DROP TABLE users").is_err());
        assert!(Identifier::new("us\"ers").is_err());
        assert!(Identifier::new("a".repeat(64)).is_err());
        assert!(Identifier::new("a".repeat(63)).is_ok());
        assert!(Identifier::new("_ci_builds$1").is_ok());
    }

    #[test]
    fn test_qualified_name_parsing() -> anyhow::Result<()> {
        let name: QualifiedName = "gitlab_partitions_dynamic.audit_events_202401".parse()?;
        assert_eq!(name.schema.as_ref().map(Identifier::as_str), Some("gitlab_partitions_dynamic"));
        assert_eq!(name.name.as_str(), "audit_events_202401");
        assert_eq!(
            name.quoted(),
            "\"gitlab_partitions_dynamic\".\"audit_events_202401\""
        );
        assert_eq!(name.to_string(), "gitlab_partitions_dynamic.audit_events_202401");

        let name: QualifiedName = "users".parse()?;
        assert_eq!(name.schema, None);
        assert!("a.b.c".parse::<QualifiedName>().is_err());
        Ok(())
    }

    #[test]
    fn test_prefixed_truncates_to_limit() -> anyhow::Result<()> {
        let long = Identifier::new("index_on_merge_request_diff_commits_by_sha_and_project_id")?;
        let prefixed = Identifier::prefixed("tmp_reindex_", &long)?;
        assert_eq!(prefixed.as_str().len(), MAX_IDENTIFIER_LEN);
        assert!(prefixed.starts_with("tmp_reindex_index_on_merge_request"));
        Ok(())
    }

    proptest! {
        #![proptest_config(
            ProptestConfig { cases: 256 * env_config("DB_MAINTENANCE_PROPTEST_MULTIPLIER", 1), failure_persistence: None, ..ProptestConfig::default() }
        )]
        #[test]
        fn test_prefixed_is_always_valid(raw in "[a-z_][a-z0-9_$]{0,62}") {
            let name = Identifier::new(raw).unwrap();
            let prefixed = Identifier::prefixed("old_reindex_", &name).unwrap();
            prop_assert!(prefixed.as_str().len() <= MAX_IDENTIFIER_LEN);
            prop_assert!(prefixed.starts_with("old_reindex_"));
        }
    }
}
