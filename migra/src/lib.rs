//! # Migra
//!
//! Coordinated schema migrations for databases shared by several deployment instances.
//!
//! The storage backends are behind features: `in-memory` (default) and `postgres`.

#![deny(missing_docs)]

pub use migra_core::*;

#[cfg(feature = "in-memory")]
/// In-memory storage backend.
pub mod mem {
    //! Contains the in-memory [`MigrationStore`](migra_core::MigrationStore).
    pub use migra_mem::*;
}

#[cfg(feature = "postgres")]
/// PostgreSQL storage backend.
pub mod pg {
    //! Contains the PostgreSQL [`MigrationStore`](migra_core::MigrationStore).
    pub use migra_pg::*;
}

pub mod prelude {
    //! The prelude module for the `migra` crate.
    pub use migra_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use migra_mem::InMemoryMigrationStore;
    #[cfg(feature = "postgres")]
    pub use migra_pg::PgMigrationStore;
}
