//! Payload types carried between the built-in agents.
//!
//! ```text
//! MarketData ─TICK/NEWS─► Sentiment ─SENTIMENT─► Strategy ─TRADE─► Risk
//!                                                   ▲                │
//!                                                   │            APPROVED
//!                                                   │                ▼
//!                                                   └───FEEDBACK── Execution
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const TOPIC_TICK: &str = "TICK";
pub const TOPIC_NEWS: &str = "NEWS";
pub const TOPIC_SENTIMENT: &str = "SENTIMENT";
pub const TOPIC_TRADE: &str = "TRADE";
pub const TOPIC_APPROVED: &str = "APPROVED";
pub const TOPIC_FEEDBACK: &str = "FEEDBACK";
pub const TOPIC_STATUS: &str = "STATUS";

/// One OHLCV bar for a ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct News {
    #[serde(default)]
    pub ticker: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    #[serde(default)]
    pub ticker: Option<String>,
    pub label: SentimentLabel,
    /// In `[-1, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Map a policy action index (0 = buy, 1 = sell, 2 = hold).
    pub fn from_action(action: usize) -> Option<Self> {
        match action {
            0 => Some(Self::Buy),
            1 => Some(Self::Sell),
            2 => Some(Self::Hold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub ticker: String,
    pub signal: Signal,
    #[serde(default)]
    pub price: f64,
}

/// A [`TradeSignal`] after risk review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    #[serde(flatten)]
    pub trade: TradeSignal,
    pub approved: bool,
    pub position_size: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStatus {
    Filled,
    Rejected,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub ticker: String,
    pub signal: Signal,
    pub status: FillStatus,
    pub quantity: u64,
    pub price: f64,
}

/// Answer to a `STATUS` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub received: u64,
    pub by_topic: BTreeMap<String, u64>,
}
