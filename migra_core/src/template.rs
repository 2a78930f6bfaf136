//! Generator for empty migration script templates.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// The only supported template kind: a pair of plain SQL files.
pub const SQL_KIND: &str = "sql";

/// Errors raised while generating a template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The requested kind has no template.
    #[error("invalid migration type: {0}")]
    UnsupportedKind(String),
    /// The name is empty or would escape the target directory.
    #[error("invalid migration name: {0:?}")]
    InvalidName(String),
    /// Creating one of the files failed.
    #[error("could not create {path}: {source}")]
    Io {
        /// The file that could not be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The files written by [`generate_template`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFiles {
    /// `<name>.up.sql`
    pub forward: PathBuf,
    /// `<name>.down.sql`
    pub reverse: PathBuf,
}

/// Writes an empty forward/reverse script pair for `name` in `dir`.
///
/// Existing files are never overwritten. If the reverse file cannot be created the forward
/// file is removed again, so a failed call leaves nothing behind.
pub fn generate_template(kind: &str, name: &str, dir: &Path) -> Result<TemplateFiles, TemplateError> {
    if kind != SQL_KIND {
        return Err(TemplateError::UnsupportedKind(kind.to_string()));
    }
    if name.trim().is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(TemplateError::InvalidName(name.to_string()));
    }

    let forward = dir.join(format!("{name}.up.sql"));
    let reverse = dir.join(format!("{name}.down.sql"));

    create_empty(&forward)?;
    if let Err(err) = create_empty(&reverse) {
        if let Err(cleanup) = fs::remove_file(&forward) {
            warn!(
                "Could not remove {} after failed template generation: {}",
                forward.display(),
                cleanup
            );
        }
        return Err(err);
    }

    debug!("Created migration template {} in {}", name, dir.display());
    Ok(TemplateFiles { forward, reverse })
}

fn create_empty(path: &Path) -> Result<(), TemplateError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
        .map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Prefixes `name` with a sortable UTC timestamp, so generated migrations load in creation
/// order. Without a name the timestamp alone is used.
pub fn timestamped_name(name: Option<&str>, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S");
    match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("{stamp}_{name}"),
        None => stamp.to_string(),
    }
}
