//! News sentiment scorer.
//!
//! Consumes `NEWS`, publishes one `SENTIMENT` reading per headline.

use ahash::AHashSet;
use anyhow::{Result, bail};
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::parse_params;
use crate::messages::{News, SentimentLabel, SentimentReading, TOPIC_NEWS, TOPIC_SENTIMENT};
use crate::{Agent, AgentContext};

pub trait SentimentModel: Send {
    /// Score `text` in `[-1, 1]`.
    fn score(&self, text: &str) -> Result<f64>;
}

const POSITIVE: &[&str] = &[
    "beat", "beats", "bullish", "gain", "gains", "growth", "inflows", "jump", "jumps", "profit",
    "rally", "record", "rise", "rises", "strong", "surge", "surges", "upgrade", "upgraded",
];

const NEGATIVE: &[&str] = &[
    "bearish", "crash", "cut", "cuts", "decline", "downgrade", "downgraded", "drop", "drops",
    "fall", "falls", "fraud", "loss", "losses", "miss", "misses", "outflows", "plunge", "weak",
];

/// Counts lexicon hits: `(pos - neg) / (pos + neg)`.
pub struct LexiconModel {
    positive: AHashSet<String>,
    negative: AHashSet<String>,
}

impl LexiconModel {
    pub fn new(extra_positive: &[String], extra_negative: &[String]) -> Self {
        let build = |base: &[&str], extra: &[String]| {
            base.iter()
                .map(|w| w.to_string())
                .chain(extra.iter().map(|w| w.to_lowercase()))
                .collect::<AHashSet<_>>()
        };
        Self {
            positive: build(POSITIVE, extra_positive),
            negative: build(NEGATIVE, extra_negative),
        }
    }
}

impl SentimentModel for LexiconModel {
    fn score(&self, text: &str) -> Result<f64> {
        let (mut pos, mut neg) = (0u32, 0u32);
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            if self.positive.contains(&word) {
                pos += 1;
            } else if self.negative.contains(&word) {
                neg += 1;
            }
        }
        if pos + neg == 0 {
            return Ok(0.0);
        }
        Ok((pos as f64 - neg as f64) / (pos + neg) as f64)
    }
}

pub fn label_for(score: f64) -> SentimentLabel {
    if score > 0.0 {
        SentimentLabel::Positive
    } else if score < 0.0 {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SentimentParams {
    pub positive_words: Vec<String>,
    pub negative_words: Vec<String>,
}

/// `NEWS` payloads come either structured or as bare text.
#[derive(Deserialize)]
#[serde(untagged)]
enum NewsPayload {
    Structured(News),
    Text(String),
}

pub struct SentimentAgent {
    name: String,
    model: Box<dyn SentimentModel>,
}

impl SentimentAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        let p: SentimentParams = parse_params(name, params)?;
        Ok(Self::with_model(name, Box::new(LexiconModel::new(&p.positive_words, &p.negative_words))))
    }

    pub fn with_model(name: &str, model: Box<dyn SentimentModel>) -> Self {
        Self {
            name: name.to_string(),
            model,
        }
    }
}

#[async_trait]
impl Agent for SentimentAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        if !envelope.matches(TOPIC_NEWS) {
            debug!(agent = %self.name, topic = %envelope.topic, "ignored");
            return Ok(());
        }
        let news = match envelope.payload_as::<NewsPayload>()? {
            NewsPayload::Structured(n) => n,
            NewsPayload::Text(text) => News { ticker: None, text },
        };
        if news.text.trim().is_empty() {
            bail!("empty headline");
        }

        let score = self.model.score(&news.text)?.clamp(-1.0, 1.0);
        let reading = SentimentReading {
            ticker: news.ticker,
            label: label_for(score),
            score,
        };
        ctx.publish(TOPIC_SENTIMENT, &reading)?;
        let preview: String = news.text.chars().take(50).collect();
        info!(agent = %self.name, label = ?reading.label, score, "sentiment for {preview:?}");
        Ok(())
    }
}
