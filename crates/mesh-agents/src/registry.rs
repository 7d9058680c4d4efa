//! Agent registry: factory for creating agents from the topology.

use mesh_core::{MeshError, MeshResult, RoleConfig};

use crate::Agent;
use crate::agents::{
    execution::ExecutionAgent, market_data::MarketDataAgent, monitor::LoggingAgent, risk::RiskAgent,
    sentiment::SentimentAgent, strategy::StrategyAgent,
};

/// Create an agent based on the `kind` field of its topology entry.
///
/// `kind` defaults to the agent name, so an entry named `RiskAgent` needs no
/// `kind`. Both the type name and its snake_case alias are accepted.
pub fn create_agent(name: &str, cfg: &RoleConfig) -> MeshResult<Box<dyn Agent>> {
    let params = &cfg.params;
    let agent: Box<dyn Agent> = match cfg.kind_or(name) {
        "MarketDataAgent" | "market_data" => Box::new(MarketDataAgent::from_params(name, params)?),
        "SentimentAgent" | "sentiment" => Box::new(SentimentAgent::from_params(name, params)?),
        "StrategyAgent" | "strategy" => Box::new(StrategyAgent::from_params(name, params)?),
        "RiskAgent" | "risk" => Box::new(RiskAgent::from_params(name, params)?),
        "ExecutionAgent" | "execution" => Box::new(ExecutionAgent::from_params(name, params)?),
        "LoggingAgent" | "logging" | "monitor" => Box::new(LoggingAgent::from_params(name, params)?),
        other => {
            return Err(MeshError::Config(format!("agent '{name}' has unknown kind '{other}'")));
        }
    };
    Ok(agent)
}
