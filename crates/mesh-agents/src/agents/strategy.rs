//! Signal generation.
//!
//! Keeps a rolling window of closes per ticker plus the latest sentiment,
//! asks a [`SignalPolicy`] for an action, and publishes `TRADE` for anything
//! other than HOLD.

use std::collections::VecDeque;

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::parse_params;
use crate::messages::{
    Bar, Feedback, SentimentReading, Signal, TOPIC_FEEDBACK, TOPIC_SENTIMENT, TOPIC_TICK, TOPIC_TRADE,
    TradeSignal,
};
use crate::{Agent, AgentContext};

/// What a policy sees for one ticker.
#[derive(Debug, Clone)]
pub struct Features<'a> {
    pub ticker: &'a str,
    /// Oldest first; the last entry is the current close.
    pub closes: &'a VecDeque<f64>,
    /// Latest sentiment score for the ticker, or the market-wide one.
    pub sentiment: f64,
}

/// Turns features into an action index: 0 = BUY, 1 = SELL, 2 = HOLD.
pub trait SignalPolicy: Send {
    fn decide(&mut self, features: &Features<'_>) -> usize;

    /// Outcome of a previously published signal.
    fn feedback(&mut self, _feedback: &Feedback) {}
}

/// Relative move over the window, tilted by sentiment.
pub struct MomentumPolicy {
    window: usize,
    threshold: f64,
    sentiment_weight: f64,
}

impl MomentumPolicy {
    pub fn new(window: usize, threshold: f64, sentiment_weight: f64) -> Self {
        Self {
            window: window.max(2),
            threshold,
            sentiment_weight,
        }
    }
}

impl SignalPolicy for MomentumPolicy {
    fn decide(&mut self, f: &Features<'_>) -> usize {
        const BUY: usize = 0;
        const SELL: usize = 1;
        const HOLD: usize = 2;

        if f.closes.len() < self.window {
            return HOLD;
        }
        let (Some(&first), Some(&last)) = (f.closes.front(), f.closes.back()) else {
            return HOLD;
        };
        if first <= 0.0 {
            return HOLD;
        }
        let momentum = (last - first) / first + self.sentiment_weight * f.sentiment;
        if momentum > self.threshold {
            BUY
        } else if momentum < -self.threshold {
            SELL
        } else {
            HOLD
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyParams {
    pub window: usize,
    pub threshold: f64,
    pub sentiment_weight: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            window: 5,
            threshold: 0.002,
            sentiment_weight: 0.002,
        }
    }
}

pub struct StrategyAgent {
    name: String,
    window: usize,
    policy: Box<dyn SignalPolicy>,
    closes: AHashMap<String, VecDeque<f64>>,
    sentiment: AHashMap<String, f64>,
    market_sentiment: f64,
}

impl StrategyAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        let p: StrategyParams = parse_params(name, params)?;
        let policy = MomentumPolicy::new(p.window, p.threshold, p.sentiment_weight);
        Ok(Self::with_policy(name, p.window, Box::new(policy)))
    }

    pub fn with_policy(name: &str, window: usize, policy: Box<dyn SignalPolicy>) -> Self {
        Self {
            name: name.to_string(),
            window: window.max(2),
            policy,
            closes: AHashMap::new(),
            sentiment: AHashMap::new(),
            market_sentiment: 0.0,
        }
    }

    fn on_bar(&mut self, ctx: &AgentContext, bar: Bar) -> Result<()> {
        let closes = self.closes.entry(bar.ticker.clone()).or_default();
        closes.push_back(bar.close);
        while closes.len() > self.window {
            closes.pop_front();
        }

        let features = Features {
            ticker: &bar.ticker,
            closes,
            sentiment: self.sentiment.get(&bar.ticker).copied().unwrap_or(self.market_sentiment),
        };
        let action = self.policy.decide(&features);
        let signal = Signal::from_action(action).ok_or_else(|| anyhow!("policy returned action {action}"))?;
        debug!(agent = %self.name, ticker = %bar.ticker, ?signal, "signal");
        if signal == Signal::Hold {
            return Ok(());
        }

        let trade = TradeSignal {
            ticker: bar.ticker,
            signal,
            price: bar.close,
        };
        ctx.publish(TOPIC_TRADE, &trade)?;
        info!(agent = %self.name, ticker = %trade.ticker, ?signal, price = trade.price, "trade signal sent");
        Ok(())
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        match envelope.topic.as_str() {
            TOPIC_TICK => self.on_bar(ctx, envelope.payload_as()?),
            TOPIC_SENTIMENT => {
                let reading: SentimentReading = envelope.payload_as()?;
                match reading.ticker {
                    Some(t) => {
                        self.sentiment.insert(t, reading.score);
                    }
                    None => self.market_sentiment = reading.score,
                }
                Ok(())
            }
            TOPIC_FEEDBACK => {
                let fb: Feedback = envelope.payload_as()?;
                debug!(agent = %self.name, ticker = %fb.ticker, status = ?fb.status, "feedback");
                self.policy.feedback(&fb);
                Ok(())
            }
            other => {
                debug!(agent = %self.name, topic = other, "ignored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agents::testing::harness;

    fn closes(v: &[f64]) -> VecDeque<f64> {
        v.iter().copied().collect()
    }

    fn bar(ticker: &str, close: f64) -> Envelope {
        Envelope::new(
            TOPIC_TICK,
            "md",
            json!({"ticker": ticker, "open": close, "high": close, "low": close,
                   "close": close, "volume": 1000, "timestamp": 0}),
        )
    }

    #[test]
    fn momentum_policy() {
        let mut p = MomentumPolicy::new(3, 0.01, 0.0);
        fn f(c: &VecDeque<f64>) -> Features<'_> {
            Features { ticker: "SPY", closes: c, sentiment: 0.0 }
        }
        assert_eq!(p.decide(&f(&closes(&[100.0, 101.0]))), 2);
        assert_eq!(p.decide(&f(&closes(&[100.0, 101.0, 102.0]))), 0);
        assert_eq!(p.decide(&f(&closes(&[100.0, 99.0, 98.0]))), 1);
        assert_eq!(p.decide(&f(&closes(&[100.0, 100.2, 100.5]))), 2);
    }

    #[test]
    fn sentiment_tilts_the_decision() {
        let mut p = MomentumPolicy::new(2, 0.01, 0.02);
        let c = closes(&[100.0, 100.0]);
        assert_eq!(p.decide(&Features { ticker: "SPY", closes: &c, sentiment: 1.0 }), 0);
        assert_eq!(p.decide(&Features { ticker: "SPY", closes: &c, sentiment: -1.0 }), 1);
    }

    #[tokio::test]
    async fn publishes_trade_when_momentum_builds() {
        let h = harness().await;
        let params = json!({"window": 3, "threshold": 0.01});
        let mut agent = StrategyAgent::from_params("Subject", &params).unwrap();

        for close in [100.0, 101.0] {
            agent.handle(&h.ctx, bar("QQQ", close)).await.unwrap();
        }
        assert!(h.published().await.is_none());

        agent.handle(&h.ctx, bar("QQQ", 103.0)).await.unwrap();
        let trade: TradeSignal = h.published().await.unwrap().payload_as().unwrap();
        assert_eq!(trade, TradeSignal { ticker: "QQQ".into(), signal: Signal::Buy, price: 103.0 });
        h.close().await;
    }

    #[tokio::test]
    async fn ticker_sentiment_overrides_market() {
        let h = harness().await;
        let params = json!({"window": 2, "threshold": 0.01, "sentiment_weight": 0.05});
        let mut agent = StrategyAgent::from_params("Subject", &params).unwrap();

        let market = Envelope::new(TOPIC_SENTIMENT, "s", json!({"label": "positive", "score": 1.0}));
        let spy = Envelope::new(TOPIC_SENTIMENT, "s", json!({"ticker": "SPY", "label": "negative", "score": -1.0}));
        agent.handle(&h.ctx, market).await.unwrap();
        agent.handle(&h.ctx, spy).await.unwrap();

        for t in ["SPY", "VGT"] {
            agent.handle(&h.ctx, bar(t, 50.0)).await.unwrap();
            agent.handle(&h.ctx, bar(t, 50.0)).await.unwrap();
        }
        let a: TradeSignal = h.published().await.unwrap().payload_as().unwrap();
        let b: TradeSignal = h.published().await.unwrap().payload_as().unwrap();
        assert_eq!((a.ticker.as_str(), a.signal), ("SPY", Signal::Sell));
        assert_eq!((b.ticker.as_str(), b.signal), ("VGT", Signal::Buy));
        h.close().await;
    }

    struct Broken;

    impl SignalPolicy for Broken {
        fn decide(&mut self, _f: &Features<'_>) -> usize {
            9
        }
    }

    #[tokio::test]
    async fn out_of_range_action_is_an_error() {
        let h = harness().await;
        let mut agent = StrategyAgent::with_policy("Subject", 2, Box::new(Broken));
        assert!(agent.handle(&h.ctx, bar("SPY", 1.0)).await.is_err());
        h.close().await;
    }
}
