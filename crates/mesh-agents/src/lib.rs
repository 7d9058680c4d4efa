//! # mesh-agents
//!
//! The agent runtime contract and the built-in trading pipeline agents.
//!
//! Each agent implements the [`Agent`] trait. The supervisor builds agents
//! through [`registry::create_agent`] and drives each one with
//! [`runtime::run_agent`], which owns the Initializing → Running → Stopping
//! lifecycle, the bounded receive poll, and failure isolation.
//!
//! ## Built-in agents
//!
//! | Kind              | Consumes                   | Produces           |
//! |-------------------|----------------------------|--------------------|
//! | `MarketDataAgent` | -                          | `TICK`, `NEWS`     |
//! | `SentimentAgent`  | `NEWS`                     | `SENTIMENT`        |
//! | `StrategyAgent`   | `TICK`, `SENTIMENT`, `FEEDBACK` | `TRADE`       |
//! | `RiskAgent`       | `TRADE`, `FEEDBACK`        | `APPROVED`         |
//! | `ExecutionAgent`  | `APPROVED`                 | `FEEDBACK`         |
//! | `LoggingAgent`    | everything, `STATUS` requests | audit log, `STATUS` |

pub mod agents;
pub mod context;
pub mod messages;
pub mod registry;
pub mod runtime;

use anyhow::Result;
use async_trait::async_trait;
use mesh_core::Envelope;

pub use context::AgentContext;
pub use registry::create_agent;
pub use runtime::{AgentExit, AgentHandle, AgentState, run_agent};

/// Trait implemented by every agent.
///
/// Only `Send` is required (not `Sync`): an agent is owned by exactly one
/// worker task and never shared.
///
/// # Lifecycle
///
/// 1. The runtime opens the agent's declared endpoints.
/// 2. [`initialize`](Agent::initialize) runs once; an error stops the agent.
/// 3. Envelopes from the subscriber go to [`handle`](Agent::handle), requests
///    from the reply endpoint to [`handle_request`](Agent::handle_request).
///    Both are bounded by the poll timeout; errors and panics are logged and
///    the loop continues.
/// 4. [`tick`](Agent::tick) runs after every poll under the same bound.
///    Producers with no inbound endpoint do their work here.
#[async_trait]
pub trait Agent: Send {
    /// Agent name as declared in the topology.
    fn name(&self) -> &str;

    async fn initialize(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Process one inbound envelope.
    async fn handle(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()>;

    /// Process one request from the reply endpoint. Implementations answer
    /// it with [`AgentContext::reply`].
    async fn handle_request(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        self.handle(ctx, envelope).await
    }

    async fn tick(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }
}
