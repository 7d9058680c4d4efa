//! # mesh-bus
//!
//! The messaging fabric underneath the agents.
//!
//! ## Architecture
//!
//! Agents never touch sockets. They address the [`EndpointRegistry`] by
//! agent name; the registry owns one endpoint per declared (agent, role)
//! and routes `send` / `receive` to it.
//!
//! ```text
//! publish  ──TCP──► subscribe   fan-out, prefix filter on the receiving side
//! request  ──TCP──► reply       strict request/reply alternation
//! ```
//!
//! - [`registry`]: endpoint lifecycle and message routing
//! - [`endpoint`]: endpoint descriptors
//! - [`transport`]: framing and the four socket kinds
//! - [`ports`]: freeing ports left bound by a previous run

pub mod endpoint;
pub mod ports;
pub mod registry;
pub mod transport;

pub use endpoint::EndpointInfo;
pub use ports::ReleaseReport;
pub use registry::{EndpointRegistry, Inbound, ProvisionReport};
