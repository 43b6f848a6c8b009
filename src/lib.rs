//! Storage Converge - Desired-State Convergence for Storage Appliances
//!
//! Brings one object on a scale-out NAS appliance to a declared state:
//! fetch it over the management API, compute the minimal difference to the
//! desired state, then create, update or delete it. Running a task a second
//! time against an already converged appliance changes nothing.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                 Task (YAML) / command line                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │  Resources   │  │   Identity   │  │   Field Diff        │  │
//! │  │  (zone, smb, │  │   Resolver   │  │   (rule tables,     │  │
//! │  │  nfs, ...)   │  │              │  │   quota, criteria)  │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬──────────┘  │
//! │         └─────────────────┼─────────────────────┘             │
//! │                ┌──────────┴──────────┐                        │
//! │                │  Converge + Session │                        │
//! │                └──────────┬──────────┘                        │
//! ├───────────────────────────┼───────────────────────────────────┤
//! │               ManagementApi port (async)                      │
//! │  ┌─────────────────────────┐  ┌─────────────────────────────┐ │
//! │  │   REST (reqwest)        │  │   In-memory appliance       │ │
//! │  └─────────────────────────┘  └─────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`client`]: Management API adapters
//! - [`config`]: Connection settings and task files
//! - [`domain`]: Endpoints, principals and the management API port
//! - [`error`]: Error types and exit codes
//! - [`reconcile`]: Normalization, diffing and the converge cycle
//! - [`resources`]: One module per managed object type

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod reconcile;
pub mod resources;

// Re-export commonly used types
pub use client::{ApiFactory, InMemoryAppliance, RestClient};

pub use config::{ConnectionConfig, ConnectionOverrides, TaskFile};

pub use domain::ports::{
    Endpoint, Lookup, ManagementApi, ManagementApiRef, Principal, PrincipalType, ResourceType,
    Snapshot, StableId, State,
};

pub use error::{Error, ErrorClass, Result};

pub use reconcile::{check, converge, ConvergeReport, Operation, Resource, Session};

pub use resources::{ResourceKind, Task};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
