//! Market data producer.
//!
//! Cycles through its tickers, one bar per `interval_ms`, and publishes each
//! as `TICK`. Configured headlines are published as `NEWS`, one per interval,
//! each once.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Result, bail};
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult, time_util};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use super::parse_params;
use crate::messages::{Bar, News, TOPIC_NEWS, TOPIC_TICK};
use crate::{Agent, AgentContext};

/// Where bars come from.
#[async_trait]
pub trait QuoteSource: Send {
    async fn latest(&mut self, ticker: &str) -> Result<Bar>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketDataParams {
    pub tickers: Vec<String>,
    pub interval_ms: u64,
    pub headlines: Vec<News>,
    /// Seed for the synthetic source.
    pub seed: u64,
}

impl Default for MarketDataParams {
    fn default() -> Self {
        Self {
            tickers: ["SPY", "QQQ", "VGT", "SOXX", "ARKK"].map(String::from).to_vec(),
            interval_ms: 5000,
            headlines: Vec::new(),
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic source
// ---------------------------------------------------------------------------

/// Random-walk bars, deterministic for a given seed.
pub struct SyntheticQuotes {
    state: u64,
    last: AHashMap<String, f64>,
}

impl SyntheticQuotes {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
            last: AHashMap::new(),
        }
    }

    /// xorshift64*, mapped to [0, 1).
    fn next_unit(&mut self) -> f64 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        let x = self.state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn base_price(ticker: &str) -> f64 {
        let h = ticker.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        50.0 + (h % 450) as f64
    }
}

#[async_trait]
impl QuoteSource for SyntheticQuotes {
    async fn latest(&mut self, ticker: &str) -> Result<Bar> {
        if ticker.is_empty() {
            bail!("empty ticker");
        }
        let open = self
            .last
            .get(ticker)
            .copied()
            .unwrap_or_else(|| Self::base_price(ticker));
        // ±0.5% per bar
        let close = open * (1.0 + (self.next_unit() - 0.5) * 0.01);
        let high = open.max(close) * (1.0 + self.next_unit() * 0.002);
        let low = open.min(close) * (1.0 - self.next_unit() * 0.002);
        let volume = 10_000 + (self.next_unit() * 90_000.0) as u64;
        self.last.insert(ticker.to_string(), close);
        Ok(Bar {
            ticker: ticker.to_string(),
            open,
            high,
            low,
            close,
            volume,
            timestamp: time_util::now_ms(),
        })
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct MarketDataAgent {
    name: String,
    tickers: Vec<String>,
    interval: Duration,
    headlines: VecDeque<News>,
    source: Box<dyn QuoteSource>,
    next: usize,
    last_emit: Option<Instant>,
}

impl MarketDataAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        let p: MarketDataParams = parse_params(name, params)?;
        let source = Box::new(SyntheticQuotes::new(p.seed));
        Ok(Self::with_source(name, p, source))
    }

    pub fn with_source(name: &str, params: MarketDataParams, source: Box<dyn QuoteSource>) -> Self {
        Self {
            name: name.to_string(),
            tickers: params.tickers,
            interval: Duration::from_millis(params.interval_ms),
            headlines: params.headlines.into(),
            source,
            next: 0,
            last_emit: None,
        }
    }

    /// Publish the next bar (and headline, if any are left).
    async fn emit(&mut self, ctx: &AgentContext) -> Result<()> {
        if let Some(ticker) = self.tickers.get(self.next).cloned() {
            self.next = (self.next + 1) % self.tickers.len();
            match self.source.latest(&ticker).await {
                Ok(bar) => {
                    ctx.publish(TOPIC_TICK, &bar)?;
                    info!(agent = %self.name, ticker = %bar.ticker, close = bar.close, "market data sent");
                }
                Err(e) => warn!(agent = %self.name, %ticker, "failed to fetch market data: {e:#}"),
            }
        }
        if let Some(news) = self.headlines.pop_front() {
            ctx.publish(TOPIC_NEWS, &news)?;
            info!(agent = %self.name, "headline sent: {}", news.text);
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for MarketDataAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _ctx: &AgentContext) -> Result<()> {
        if self.tickers.is_empty() && self.headlines.is_empty() {
            bail!("nothing to publish: no tickers and no headlines");
        }
        info!(agent = %self.name, tickers = ?self.tickers, "every {:?}", self.interval);
        Ok(())
    }

    async fn handle(&mut self, _ctx: &AgentContext, _envelope: Envelope) -> Result<()> {
        Ok(())
    }

    async fn tick(&mut self, ctx: &AgentContext) -> Result<()> {
        let due = self.last_emit.is_none_or(|t| t.elapsed() >= self.interval);
        if !due {
            return Ok(());
        }
        self.last_emit = Some(Instant::now());
        self.emit(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agents::testing::harness;

    #[tokio::test]
    async fn synthetic_bars_are_consistent() {
        let mut src = SyntheticQuotes::new(7);
        let a = src.latest("SPY").await.unwrap();
        let b = src.latest("SPY").await.unwrap();
        assert!(a.low <= a.open.min(a.close) && a.high >= a.open.max(a.close));
        assert_eq!(b.open, a.close);
        assert!(src.latest("").await.is_err());
    }

    #[test]
    fn params_default_and_reject_unknown() {
        let p: MarketDataParams = parse_params("md", &Value::Null).unwrap();
        assert_eq!(p.tickers, ["SPY", "QQQ", "VGT", "SOXX", "ARKK"]);
        assert_eq!(p.interval_ms, 5000);
        assert!(parse_params::<MarketDataParams>("md", &json!({"tickerz": []})).is_err());
    }

    #[tokio::test]
    async fn publishes_ticks_round_robin_and_headlines_once() {
        let h = harness().await;
        let params = MarketDataParams {
            tickers: vec!["SPY".into(), "QQQ".into()],
            interval_ms: 0,
            headlines: vec![News { ticker: Some("SPY".into()), text: "record inflows".into() }],
            seed: 1,
        };
        let mut agent = MarketDataAgent::with_source("Subject", params, Box::new(SyntheticQuotes::new(1)));
        agent.initialize(&h.ctx).await.unwrap();

        for _ in 0..3 {
            agent.tick(&h.ctx).await.unwrap();
        }

        let mut topics = Vec::new();
        while let Some(env) = h.published().await {
            let label = match env.topic.as_str() {
                TOPIC_TICK => env.payload_as::<Bar>().unwrap().ticker,
                _ => format!("{}:{}", env.topic, env.payload_as::<News>().unwrap().text),
            };
            topics.push(label);
        }
        assert_eq!(topics, ["SPY", "NEWS:record inflows", "QQQ", "SPY"]);
        h.close().await;
    }

    #[tokio::test]
    async fn interval_gates_emission() {
        let h = harness().await;
        let params = MarketDataParams { interval_ms: 60_000, ..Default::default() };
        let mut agent = MarketDataAgent::with_source("Subject", params, Box::new(SyntheticQuotes::new(3)));
        agent.tick(&h.ctx).await.unwrap();
        agent.tick(&h.ctx).await.unwrap();
        assert!(h.published().await.is_some());
        assert!(h.published().await.is_none());
        h.close().await;
    }

    #[tokio::test]
    async fn empty_config_fails_initialization() {
        let h = harness().await;
        let params = MarketDataParams { tickers: vec![], ..Default::default() };
        let mut agent = MarketDataAgent::with_source("Subject", params, Box::new(SyntheticQuotes::new(3)));
        assert!(agent.initialize(&h.ctx).await.is_err());
        h.close().await;
    }
}
