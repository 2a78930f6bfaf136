//! # Migra core
//!
//! Coordination core for applying schema migrations against a shared database. A batch of
//! [`Migration`]s is handed to a [`Coordinator`], which registers each one in the status
//! ledger, waits for its turn through a [`TurnStrategy`], executes it through a
//! [`MigrationStore`] and reports progress on a [`MessageStream`].
//!
//! The ledger is the only coordination medium between processes: the sequence id assigned at
//! registration decides who runs first.

#![deny(missing_docs)]

pub mod cancel;
pub mod coordinator;
pub mod loader;
pub mod message;
pub mod migration;
pub mod ordering;
pub mod status;
pub mod store;
pub mod template;

pub use cancel::{CancelHandle, CancelToken, cancellation};
pub use coordinator::{ApplyError, Coordinator, CoordinatorConfig, CoordinatorError, RollbackPolicy};
pub use loader::{LoadError, load_dir};
pub use message::{Message, MessageKind, MessageStream, ProgressSender, progress_channel};
pub use migration::{Migration, MigrationError};
pub use ordering::{PollingTurn, TurnCheck, TurnError, TurnStrategy, check_turn};
pub use status::{MigrationStatus, SchemaState, SequenceId, StatusEntry, UnknownStatusError};
pub use store::{MigrationStore, StoreError};
pub use template::{SQL_KIND, TemplateError, TemplateFiles, generate_template, timestamped_name};

pub mod prelude {
    //! The prelude module for the `migra_core` crate.
    pub use super::{
        ApplyError, CancelHandle, CancelToken, Coordinator, CoordinatorConfig, CoordinatorError,
        Message, MessageKind, MessageStream, Migration, MigrationStatus, MigrationStore,
        PollingTurn, RollbackPolicy, SchemaState, SequenceId, StatusEntry, StoreError,
        TurnStrategy, cancellation,
    };
}
