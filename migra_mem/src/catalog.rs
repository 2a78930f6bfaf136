use std::collections::BTreeMap;

/// Errors raised by statements run against a [`Catalog`]. The messages follow PostgreSQL's.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// `CREATE TABLE` on an existing table.
    #[error("relation \"{0}\" already exists")]
    TableExists(String),
    /// The statement references a table that does not exist.
    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),
    /// `ADD COLUMN` on an existing column.
    #[error("column \"{column}\" of relation \"{table}\" already exists")]
    ColumnExists {
        /// The table.
        table: String,
        /// The column.
        column: String,
    },
    /// `DROP COLUMN` on a missing column.
    #[error("column \"{column}\" of relation \"{table}\" does not exist")]
    UnknownColumn {
        /// The table.
        table: String,
        /// The column.
        column: String,
    },
    /// A table statement the catalog could not make sense of.
    #[error("syntax error at or near \"{0}\"")]
    Syntax(String),
}

/// The tables and columns created by the scripts run so far.
///
/// Identifiers are folded to lower case. Statements other than `CREATE TABLE`, `DROP TABLE` and
/// `ALTER TABLE` are accepted without effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    tables: BTreeMap<String, Vec<String>>,
}

const CONSTRAINT_KEYWORDS: [&str; 6] = ["constraint", "primary", "unique", "foreign", "check", "exclude"];

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// The columns of `table` in creation order.
    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables
            .get(&table.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    /// Whether `table` exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_ascii_lowercase())
    }

    /// Runs every statement of `script` in order.
    ///
    /// When `transactional` is set a failing statement discards the effect of the whole script;
    /// otherwise the statements before it stay applied.
    pub fn run_script(&mut self, script: &str, transactional: bool) -> Result<(), CatalogError> {
        let snapshot = transactional.then(|| self.clone());
        for statement in statements(script) {
            if let Err(err) = self.run_statement(&statement) {
                if let Some(snapshot) = snapshot {
                    *self = snapshot;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Runs a single statement.
    pub fn run_statement(&mut self, statement: &str) -> Result<(), CatalogError> {
        let statement = statement.trim().to_ascii_lowercase();
        let (head, body) = match statement.find('(') {
            Some(idx) => (&statement[..idx], Some(&statement[idx..])),
            None => (statement.as_str(), None),
        };
        let words: Vec<&str> = head
            .split_whitespace()
            .map(|word| word.trim_matches('"'))
            .collect();

        match words.as_slice() {
            ["create", "table", rest @ ..] => {
                let (if_not_exists, rest) = match rest {
                    ["if", "not", "exists", rest @ ..] => (true, rest),
                    _ => (false, rest),
                };
                let Some(table) = rest.first() else {
                    return Err(CatalogError::Syntax(statement.clone()));
                };
                let columns = body.map(column_names).unwrap_or_default();
                self.create_table(table, columns, if_not_exists)
            }
            ["drop", "table", rest @ ..] => {
                let (if_exists, rest) = match rest {
                    ["if", "exists", rest @ ..] => (true, rest),
                    _ => (false, rest),
                };
                let tables: Vec<&str> = rest
                    .iter()
                    .filter(|word| !matches!(**word, "cascade" | "restrict"))
                    .flat_map(|word| word.split(','))
                    .map(|word| word.trim_matches('"'))
                    .filter(|word| !word.is_empty())
                    .collect();
                if tables.is_empty() {
                    return Err(CatalogError::Syntax(statement.clone()));
                }
                self.drop_tables(&tables, if_exists)
            }
            ["alter", "table", rest @ ..] => {
                let (if_exists, rest) = match rest {
                    ["if", "exists", rest @ ..] => (true, rest),
                    _ => (false, rest),
                };
                let rest = match rest {
                    ["only", rest @ ..] => rest,
                    _ => rest,
                };
                if let Some(table) = rest.first()
                    && if_exists
                    && !self.has_table(table)
                {
                    return Ok(());
                }
                self.alter_table(rest, &statement)
            }
            _ => Ok(()),
        }
    }

    fn alter_table(&mut self, words: &[&str], statement: &str) -> Result<(), CatalogError> {
        match words {
            [table, "add" | "drop", keyword, ..] if CONSTRAINT_KEYWORDS.contains(keyword) => {
                self.require_table(table).map(|_| ())
            }
            [table, "add", "column", "if", "not", "exists", column, ..] => {
                self.add_column(table, column, true)
            }
            [table, "add", "column", column, ..] | [table, "add", column, ..] => {
                self.add_column(table, column, false)
            }
            [table, "drop", "column", "if", "exists", column, ..] => {
                self.drop_column(table, column, true)
            }
            [table, "drop", "column", column, ..] | [table, "drop", column, ..] => {
                self.drop_column(table, column, false)
            }
            [table, "rename", "to", new_name] => self.rename_table(table, new_name),
            [table, ..] => self.require_table(table).map(|_| ()),
            [] => Err(CatalogError::Syntax(statement.to_string())),
        }
    }

    fn require_table(&mut self, table: &str) -> Result<&mut Vec<String>, CatalogError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| CatalogError::UnknownTable(table.to_string()))
    }

    fn create_table(
        &mut self,
        table: &str,
        columns: Vec<String>,
        if_not_exists: bool,
    ) -> Result<(), CatalogError> {
        if self.tables.contains_key(table) {
            return if if_not_exists {
                Ok(())
            } else {
                Err(CatalogError::TableExists(table.to_string()))
            };
        }
        self.tables.insert(table.to_string(), columns);
        Ok(())
    }

    fn drop_tables(&mut self, tables: &[&str], if_exists: bool) -> Result<(), CatalogError> {
        if !if_exists
            && let Some(missing) = tables.iter().find(|table| !self.tables.contains_key(**table))
        {
            return Err(CatalogError::UnknownTable(missing.to_string()));
        }
        for table in tables {
            self.tables.remove(*table);
        }
        Ok(())
    }

    fn rename_table(&mut self, table: &str, new_name: &str) -> Result<(), CatalogError> {
        if self.tables.contains_key(new_name) {
            return Err(CatalogError::TableExists(new_name.to_string()));
        }
        let columns = self
            .tables
            .remove(table)
            .ok_or_else(|| CatalogError::UnknownTable(table.to_string()))?;
        self.tables.insert(new_name.to_string(), columns);
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &str, if_not_exists: bool) -> Result<(), CatalogError> {
        let columns = self.require_table(table)?;
        if columns.iter().any(|existing| existing == column) {
            return if if_not_exists {
                Ok(())
            } else {
                Err(CatalogError::ColumnExists {
                    table: table.to_string(),
                    column: column.to_string(),
                })
            };
        }
        columns.push(column.to_string());
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str, if_exists: bool) -> Result<(), CatalogError> {
        let columns = self.require_table(table)?;
        match columns.iter().position(|existing| existing == column) {
            Some(idx) => {
                columns.remove(idx);
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(CatalogError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            }),
        }
    }
}

/// Splits a script into statements, dropping `--` comments.
fn statements(script: &str) -> Vec<String> {
    let uncommented: String = script
        .lines()
        .map(|line| match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n");
    uncommented
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

/// Column names from a parenthesised `CREATE TABLE` body.
fn column_names(body: &str) -> Vec<String> {
    let mut depth = 0usize;
    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in body.chars() {
        match ch {
            '(' => {
                depth += 1;
                if depth == 1 {
                    continue;
                }
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            ',' if depth == 1 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);

    let mut columns: Vec<String> = Vec::new();
    for part in parts {
        let Some(name) = part.split_whitespace().next() else {
            continue;
        };
        let name = name.trim_matches('"');
        if CONSTRAINT_KEYWORDS.contains(&name) || columns.iter().any(|column| column == name) {
            continue;
        }
        columns.push(name.to_string());
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_records_columns() {
        let mut catalog = Catalog::new();
        catalog
            .run_statement("CREATE TABLE Users (id BIGSERIAL PRIMARY KEY, name VARCHAR(200) NOT NULL, UNIQUE (name))")
            .unwrap();

        assert_eq!(catalog.tables(), vec!["users".to_string()]);
        assert_eq!(
            catalog.columns("users").unwrap(),
            &["id".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn create_existing_table_fails_unless_guarded() {
        let mut catalog = Catalog::new();
        catalog.run_statement("CREATE TABLE t (id INT)").unwrap();

        assert_eq!(
            catalog.run_statement("CREATE TABLE t (id INT)"),
            Err(CatalogError::TableExists("t".into()))
        );
        assert!(catalog.run_statement("CREATE TABLE IF NOT EXISTS t (id INT)").is_ok());
    }

    #[test]
    fn alter_table_adds_and_drops_columns() {
        let mut catalog = Catalog::new();
        catalog.run_statement("CREATE TABLE t (id INT)").unwrap();
        catalog.run_statement("ALTER TABLE t ADD COLUMN email TEXT").unwrap();
        catalog.run_statement("ALTER TABLE t ADD age INT").unwrap();
        assert_eq!(catalog.columns("t").unwrap().len(), 3);

        catalog.run_statement("ALTER TABLE t DROP COLUMN email").unwrap();
        assert_eq!(
            catalog.columns("t").unwrap(),
            &["id".to_string(), "age".to_string()]
        );
        assert!(matches!(
            catalog.run_statement("ALTER TABLE t DROP COLUMN email"),
            Err(CatalogError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn alter_missing_table_fails() {
        let mut catalog = Catalog::new();
        assert_eq!(
            catalog.run_statement("ALTER TABLE missing ADD COLUMN x INT"),
            Err(CatalogError::UnknownTable("missing".into()))
        );
        assert!(catalog
            .run_statement("ALTER TABLE IF EXISTS missing ADD COLUMN x INT")
            .is_ok());
    }

    #[test]
    fn drop_table_checks_every_table_first() {
        let mut catalog = Catalog::new();
        catalog.run_statement("CREATE TABLE a (id INT)").unwrap();

        assert_eq!(
            catalog.run_statement("DROP TABLE a, b"),
            Err(CatalogError::UnknownTable("b".into()))
        );
        assert!(catalog.has_table("a"));

        catalog.run_statement("DROP TABLE IF EXISTS a, b CASCADE").unwrap();
        assert!(catalog.tables().is_empty());
    }

    #[test]
    fn transactional_script_is_all_or_nothing() {
        let mut catalog = Catalog::new();
        let script = "CREATE TABLE a (id INT);\nALTER TABLE missing ADD COLUMN x INT;";

        assert!(catalog.run_script(script, true).is_err());
        assert!(catalog.tables().is_empty());

        assert!(catalog.run_script(script, false).is_err());
        assert_eq!(catalog.tables(), vec!["a".to_string()]);
    }

    #[test]
    fn comments_and_other_statements_are_ignored() {
        let mut catalog = Catalog::new();
        let script = "-- create things\nCREATE TABLE a (id INT); -- trailing\nINSERT INTO a VALUES (1);\nCREATE INDEX a_idx ON a (id);";

        catalog.run_script(script, true).unwrap();
        assert_eq!(catalog.tables(), vec!["a".to_string()]);
    }

    #[test]
    fn rename_moves_columns() {
        let mut catalog = Catalog::new();
        catalog.run_statement("CREATE TABLE a (id INT)").unwrap();
        catalog.run_statement("ALTER TABLE a RENAME TO b").unwrap();

        assert!(!catalog.has_table("a"));
        assert_eq!(catalog.columns("b").unwrap(), &["id".to_string()]);
    }
}
