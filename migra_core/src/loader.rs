//! Loads migrations from a directory of `<name>.up.sql` / `<name>.down.sql` pairs.

use crate::migration::{Migration, MigrationError};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// A forward script starting with this line runs outside a transaction.
pub const NO_TRANSACTION_DIRECTIVE: &str = "-- migra:no-transaction";

/// Errors raised while loading a migration directory.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Reading the directory or one of its files failed.
    #[error("could not read {path}: {source}")]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A script pair does not form a valid migration.
    #[error("invalid migration in {path}: {source}")]
    Invalid {
        /// The forward script.
        path: PathBuf,
        /// Why the migration is invalid.
        #[source]
        source: MigrationError,
    },
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn wants_transaction(script: &str) -> bool {
    script
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_none_or(|line| !line.eq_ignore_ascii_case(NO_TRANSACTION_DIRECTIVE))
}

/// Reads every migration in `dir`, sorted by name.
///
/// A forward script without a matching reverse script yields a migration with an empty reverse
/// query.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>, LoadError> {
    let entries = fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            warn!("Ignoring non UTF-8 file name in {}", dir.display());
            continue;
        };
        if let Some(name) = file_name.strip_suffix(UP_SUFFIX) {
            names.push(name.to_string());
        } else if let Some(name) = file_name.strip_suffix(DOWN_SUFFIX)
            && !dir.join(format!("{name}{UP_SUFFIX}")).exists()
        {
            warn!("Ignoring {}: no matching {} file", file_name, UP_SUFFIX);
        }
    }
    names.sort();

    let mut migrations = Vec::with_capacity(names.len());
    for name in names {
        let forward_path = dir.join(format!("{name}{UP_SUFFIX}"));
        let reverse_path = dir.join(format!("{name}{DOWN_SUFFIX}"));

        let forward = read(&forward_path)?;
        let reverse = if reverse_path.exists() {
            read(&reverse_path)?
        } else {
            String::new()
        };
        let transactional = wants_transaction(&forward);

        let migration = Migration::new(name, forward, reverse)
            .map_err(|source| LoadError::Invalid {
                path: forward_path.clone(),
                source,
            })?
            .with_transactional(transactional);
        debug!(
            "Loaded migration {} from {}",
            migration.name(),
            forward_path.display()
        );
        migrations.push(migration);
    }

    Ok(migrations)
}
