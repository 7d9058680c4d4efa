//! Pre-trade risk checks.
//!
//! Every `TRADE` is answered with an `APPROVED` decision carrying the
//! position size. Open exposure is tracked from `FEEDBACK` fills.

use ahash::AHashMap;
use anyhow::Result;
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::parse_params;
use crate::messages::{
    Feedback, FillStatus, RiskDecision, Signal, TOPIC_APPROVED, TOPIC_FEEDBACK, TOPIC_TRADE, TradeSignal,
};
use crate::{Agent, AgentContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskParams {
    pub portfolio_value: f64,
    pub risk_per_trade: f64,
    pub max_positions: usize,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            portfolio_value: 100_000.0,
            risk_per_trade: 0.01,
            max_positions: 5,
        }
    }
}

pub struct RiskAgent {
    name: String,
    params: RiskParams,
    /// Shares held per ticker.
    positions: AHashMap<String, u64>,
}

impl RiskAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        Ok(Self::new(name, parse_params(name, params)?))
    }

    pub fn new(name: &str, params: RiskParams) -> Self {
        Self {
            name: name.to_string(),
            params,
            positions: AHashMap::new(),
        }
    }

    pub fn position_size(&self) -> f64 {
        self.params.portfolio_value * self.params.risk_per_trade
    }

    pub fn assess(&self, trade: TradeSignal) -> RiskDecision {
        let held = self.positions.get(&trade.ticker).copied().unwrap_or(0);
        let rejection = match trade.signal {
            Signal::Sell if held == 0 => Some("no open position to sell".to_string()),
            Signal::Buy if held == 0 && self.positions.len() >= self.params.max_positions => Some(format!(
                "max positions reached ({})",
                self.params.max_positions
            )),
            Signal::Hold => Some("hold is not a trade".to_string()),
            _ => None,
        };
        RiskDecision {
            trade,
            approved: rejection.is_none(),
            position_size: self.position_size(),
            reason: rejection.unwrap_or_else(|| "within limits".to_string()),
        }
    }

    fn apply_fill(&mut self, fb: &Feedback) {
        if fb.status != FillStatus::Filled || fb.quantity == 0 {
            return;
        }
        match fb.signal {
            Signal::Buy => *self.positions.entry(fb.ticker.clone()).or_default() += fb.quantity,
            Signal::Sell => {
                let left = self
                    .positions
                    .get(&fb.ticker)
                    .map_or(0, |held| held.saturating_sub(fb.quantity));
                if left == 0 {
                    self.positions.remove(&fb.ticker);
                } else {
                    self.positions.insert(fb.ticker.clone(), left);
                }
            }
            Signal::Hold => {}
        }
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        match envelope.topic.as_str() {
            TOPIC_TRADE => {
                let decision = self.assess(envelope.payload_as()?);
                ctx.publish(TOPIC_APPROVED, &decision)?;
                info!(
                    agent = %self.name,
                    ticker = %decision.trade.ticker,
                    approved = decision.approved,
                    position_size = decision.position_size,
                    "{}",
                    decision.reason
                );
            }
            TOPIC_FEEDBACK => {
                let fb: Feedback = envelope.payload_as()?;
                self.apply_fill(&fb);
                debug!(agent = %self.name, open = self.positions.len(), "positions updated");
            }
            other => debug!(agent = %self.name, topic = other, "ignored"),
        }
        Ok(())
    }
}
