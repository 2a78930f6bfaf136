//! The immutable migration record handed to the coordinator.

/// Errors raised when building a [`Migration`] from invalid input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// The name was empty or whitespace only.
    #[error("migration name must not be empty")]
    EmptyName,
    /// The forward script was empty or whitespace only.
    #[error("migration {0} has an empty forward script")]
    EmptyForward(String),
}

/// One named schema change: a forward script, the script that undoes it, and whether the
/// forward script must run atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: String,
    forward_query: String,
    reverse_query: String,
    transactional: bool,
}

impl Migration {
    /// Creates a transactional migration.
    ///
    /// `reverse` may be empty, in which case rolling the migration back fails with
    /// [`StoreError::MissingReverse`](crate::StoreError::MissingReverse).
    pub fn new(
        name: impl Into<String>,
        forward: impl Into<String>,
        reverse: impl Into<String>,
    ) -> Result<Self, MigrationError> {
        let name = name.into();
        let forward_query = forward.into();

        if name.trim().is_empty() {
            return Err(MigrationError::EmptyName);
        }
        if forward_query.trim().is_empty() {
            return Err(MigrationError::EmptyForward(name));
        }

        Ok(Self {
            name,
            forward_query,
            reverse_query: reverse.into(),
            transactional: true,
        })
    }

    /// Sets whether the scripts run inside a single transaction.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// The unique name of this migration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The script that applies the change.
    pub fn forward_query(&self) -> &str {
        &self.forward_query
    }

    /// The script that undoes the change. May be empty.
    pub fn reverse_query(&self) -> &str {
        &self.reverse_query
    }

    /// Whether a non-empty reverse script is present.
    pub fn has_reverse(&self) -> bool {
        !self.reverse_query.trim().is_empty()
    }

    /// Whether the scripts run inside a transaction.
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_migration_defaults_to_transactional() {
        let migration = Migration::new("create_t", "CREATE TABLE t(id int)", "DROP TABLE t").unwrap();
        assert!(migration.is_transactional());
        assert!(migration.has_reverse());
        assert_eq!(migration.name(), "create_t");
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Migration::new("  ", "CREATE TABLE t(id int)", "").unwrap_err();
        assert_eq!(err, MigrationError::EmptyName);
    }

    #[test]
    fn empty_forward_is_rejected() {
        let err = Migration::new("noop", "\n\t", "DROP TABLE t").unwrap_err();
        assert_eq!(err, MigrationError::EmptyForward("noop".to_string()));
    }

    #[test]
    fn blank_reverse_counts_as_missing() {
        let migration = Migration::new("m", "SELECT 1", "   ").unwrap();
        assert!(!migration.has_reverse());
    }

    #[test]
    fn transactional_flag_can_be_cleared() {
        let migration = Migration::new("idx", "CREATE INDEX CONCURRENTLY i ON t(id)", "")
            .unwrap()
            .with_transactional(false);
        assert!(!migration.is_transactional());
    }
}
