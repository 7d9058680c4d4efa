//! Typed error definitions for the messaging fabric.
//!
//! [`MeshError`] covers every failure the fabric can report. Variants map to
//! the propagation policy: configuration and bind failures are fatal and
//! surface to the supervisor, everything else is local to one call and gets
//! logged at the agent loop boundary. All variants implement
//! `std::error::Error` via `thiserror`, so they compose with `anyhow::Result`.

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::Role;

/// Shorthand for results produced by the fabric.
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors reported by the fabric.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Configuration file missing, unparsable, or failing validation.
    #[error("config error: {0}")]
    Config(String),

    /// A publish or reply endpoint could not bind its port.
    #[error("bind error: agent '{agent}' could not bind {addr}: {source}")]
    Bind {
        agent: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A subscribe or request endpoint could not reach its target yet.
    ///
    /// Non-fatal: the transport keeps retrying in the background.
    #[error("connect error: agent '{agent}' could not reach {addr}: {reason}")]
    Connect {
        agent: String,
        addr: SocketAddr,
        reason: String,
    },

    /// A payload or envelope could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A send or receive attempt failed on the wire.
    #[error("transport error: agent '{agent}': {reason}")]
    Transport { agent: String, reason: String },

    /// The agent never created an endpoint for the role it tried to use.
    #[error("no endpoint: agent '{agent}' has no {role} endpoint")]
    NoEndpoint { agent: String, role: String },

    /// The registry has been closed; no further endpoint operations.
    #[error("fabric closed")]
    Closed,
}

impl MeshError {
    /// Build a [`MeshError::Transport`] for `agent`.
    pub fn transport(agent: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            agent: agent.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a [`MeshError::NoEndpoint`] listing the acceptable roles.
    pub fn no_endpoint(agent: &str, roles: &[Role]) -> Self {
        let role = roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join("/");
        Self::NoEndpoint {
            agent: agent.to_string(),
            role,
        }
    }

    /// Whether this error must stop startup (config) or the affected agent
    /// (bind) rather than being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Bind { .. })
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
