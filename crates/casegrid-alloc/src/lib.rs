//! casegrid-alloc: server allocation for concurrent case evaluation.
//!
//! A [`ResourceAllocator`] reports how many servers it can supply for a
//! set of [`ResourceRequirements`], hands out [`Server`] handles, and
//! takes them back. The scheduler only relies on that contract; how an
//! allocator places servers is its own concern.
//!
//! # Architecture
//!
//! ```text
//! ResourceAllocator
//!   ├── max_servers(requirements) → capacity
//!   ├── allocate(requirements)    → (Box<dyn Server>, ServerInfo)
//!   └── release(server)
//!
//! Server
//!   ├── receive_bundle(id, payload)
//!   └── load_model(id) → Box<dyn Model>
//! ```

pub mod local;
pub mod server;

use casegrid_core::{ResourceRequirements, ServerInfo};

pub use local::{AllocationStats, LocalAllocator, LocalServer};
pub use server::{Server, ServerError};

/// Supplies servers subject to a capacity limit.
pub trait ResourceAllocator: Send + Sync {
    /// Maximum number of servers that can satisfy `requirements` at once.
    /// Zero or negative means none.
    fn max_servers(&self, requirements: &ResourceRequirements) -> i64;

    /// Allocate one server, or `None` when none can be obtained.
    fn allocate(&self, requirements: &ResourceRequirements)
    -> Option<(Box<dyn Server>, ServerInfo)>;

    /// Return a server previously obtained from `allocate`.
    fn release(&self, server: Box<dyn Server>);
}
