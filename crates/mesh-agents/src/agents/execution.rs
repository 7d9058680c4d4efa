//! Order execution.
//!
//! Approved decisions go to a [`Broker`]; every decision, filled or not,
//! is answered with a `FEEDBACK` message.

use ahash::AHashMap;
use anyhow::{Result, bail};
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::parse_params;
use crate::messages::{Feedback, FillStatus, RiskDecision, Signal, TOPIC_APPROVED, TOPIC_FEEDBACK};
use crate::{Agent, AgentContext};

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub ticker: String,
    pub side: Signal,
    pub quantity: u64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub quantity: u64,
    pub price: f64,
}

#[async_trait]
pub trait Broker: Send {
    async fn place(&mut self, order: &Order) -> Result<Fill>;
}

/// Fills every order in full at its limit price and keeps a position book.
#[derive(Debug, Default)]
pub struct PaperBroker {
    book: AHashMap<String, i64>,
}

impl PaperBroker {
    pub fn position(&self, ticker: &str) -> i64 {
        self.book.get(ticker).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place(&mut self, order: &Order) -> Result<Fill> {
        let qty = i64::try_from(order.quantity)?;
        let delta = match order.side {
            Signal::Buy => qty,
            Signal::Sell => -qty,
            Signal::Hold => bail!("cannot place a HOLD order"),
        };
        *self.book.entry(order.ticker.clone()).or_default() += delta;
        Ok(Fill {
            quantity: order.quantity,
            price: order.limit,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionParams {}

pub struct ExecutionAgent {
    name: String,
    broker: Box<dyn Broker>,
}

impl ExecutionAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        let _: ExecutionParams = parse_params(name, params)?;
        Ok(Self::with_broker(name, Box::new(PaperBroker::default())))
    }

    pub fn with_broker(name: &str, broker: Box<dyn Broker>) -> Self {
        Self {
            name: name.to_string(),
            broker,
        }
    }

    async fn execute(&mut self, decision: RiskDecision) -> Feedback {
        let trade = decision.trade;
        let mut feedback = Feedback {
            ticker: trade.ticker.clone(),
            signal: trade.signal,
            status: FillStatus::Rejected,
            quantity: 0,
            price: trade.price,
        };

        if !decision.approved {
            info!(agent = %self.name, ticker = %trade.ticker, "not executed: {}", decision.reason);
            return feedback;
        }
        let quantity = if trade.price > 0.0 {
            (decision.position_size / trade.price).floor() as u64
        } else {
            0
        };
        if quantity == 0 || trade.signal == Signal::Hold {
            warn!(agent = %self.name, ticker = %trade.ticker, "order size is zero, skipping");
            feedback.status = FillStatus::Skipped;
            return feedback;
        }

        let order = Order {
            ticker: trade.ticker,
            side: trade.signal,
            quantity,
            limit: trade.price,
        };
        match self.broker.place(&order).await {
            Ok(fill) => {
                info!(
                    agent = %self.name,
                    ticker = %order.ticker,
                    side = ?order.side,
                    quantity = fill.quantity,
                    price = fill.price,
                    "trade executed"
                );
                feedback.status = FillStatus::Filled;
                feedback.quantity = fill.quantity;
                feedback.price = fill.price;
            }
            Err(e) => {
                warn!(agent = %self.name, ticker = %order.ticker, "broker rejected order: {e:#}");
                feedback.status = FillStatus::Failed;
            }
        }
        feedback
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        if envelope.topic != TOPIC_APPROVED {
            debug!(agent = %self.name, topic = %envelope.topic, "ignored");
            return Ok(());
        }
        let feedback = self.execute(envelope.payload_as()?).await;
        ctx.publish(TOPIC_FEEDBACK, &feedback)?;
        Ok(())
    }
}
