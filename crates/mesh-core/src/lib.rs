//! # mesh-core
//!
//! Core crate for the agent-mesh trading pipeline, providing:
//!
//! - **Configuration** (`config`): JSON topology loading and validation
//! - **Error types** (`error`): the fabric's `MeshError` taxonomy via thiserror
//! - **Envelope** (`envelope`): the JSON message unit exchanged between agents
//! - **Types** (`types`): endpoint roles
//! - **Time utilities** (`time_util`): wall-clock timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;

// Re-export the common names at crate root for convenience.
pub use config::{FabricSettings, MeshConfig, RoleConfig, Topology};
pub use envelope::Envelope;
pub use error::{MeshError, MeshResult};
pub use types::Role;
