use clap::{Parser, Subcommand, ValueEnum};
use migra_core::{CoordinatorConfig, RollbackPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Coordinated schema migrations for PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "migra")]
#[command(version, about = "Coordinated schema migrations for PostgreSQL")]
pub struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Directory holding the migration scripts
    #[arg(long, env = "MIGRA_DIR", default_value = "./migrations", global = true)]
    pub dir: PathBuf,

    /// How often to check whether it is our turn, in milliseconds
    #[arg(long, default_value_t = 1000, global = true)]
    pub poll_interval_ms: u64,

    /// Give up waiting for a turn after this many seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create an empty forward/reverse script pair
    Create {
        /// Suffix for the generated file names
        name: Option<String>,
    },
    /// Apply every migration in the directory that is not applied yet
    Up {
        /// What to do with the batch when a migration fails
        #[arg(long, value_enum, default_value_t = Policy::Break)]
        policy: Policy,
    },
    /// Roll back the most recently applied migration
    Down,
    /// Roll back the most recently applied migration and apply it again
    Redo,
    /// Print the migration ledger
    Status {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

/// Failure policy of `up`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Stop and keep what was applied
    Break,
    /// Stop and roll back what this run applied
    Rollback,
}

impl From<Policy> for RollbackPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Break => RollbackPolicy::Break,
            Policy::Rollback => RollbackPolicy::Rollback,
        }
    }
}

/// Output format of `status`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Table,
    Json,
}

impl Cli {
    /// Coordinator settings derived from the flags.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_wait_timeout(self.timeout_secs.map(Duration::from_secs))
    }
}
