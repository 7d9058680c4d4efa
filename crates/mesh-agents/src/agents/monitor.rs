//! Audit trail and status endpoint.
//!
//! Every envelope seen on the subscriber becomes one structured event on
//! the `mesh::audit` target, whatever its topic. Requests on the reply
//! endpoint are answered with per-topic counts.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use mesh_core::{Envelope, MeshResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::parse_params;
use crate::messages::{StatusReport, TOPIC_STATUS};
use crate::{Agent, AgentContext};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorParams {
    /// Leave payloads out of audit events.
    pub omit_payloads: bool,
}

pub struct LoggingAgent {
    name: String,
    params: MonitorParams,
    received: u64,
    by_topic: BTreeMap<String, u64>,
}

impl LoggingAgent {
    pub fn from_params(name: &str, params: &Value) -> MeshResult<Self> {
        Ok(Self {
            name: name.to_string(),
            params: parse_params(name, params)?,
            received: 0,
            by_topic: BTreeMap::new(),
        })
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            received: self.received,
            by_topic: self.by_topic.clone(),
        }
    }

    fn record(&mut self, env: &Envelope) {
        self.received += 1;
        *self.by_topic.entry(env.topic.clone()).or_default() += 1;
        if self.params.omit_payloads {
            info!(target: "mesh::audit", topic = %env.topic, producer = %env.producer, emitted_at = env.emitted_at);
        } else {
            info!(
                target: "mesh::audit",
                topic = %env.topic,
                producer = %env.producer,
                emitted_at = env.emitted_at,
                payload = %env.payload
            );
        }
    }
}

#[async_trait]
impl Agent for LoggingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, _ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        self.record(&envelope);
        Ok(())
    }

    async fn handle_request(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        if envelope.topic == TOPIC_STATUS {
            debug!(agent = %self.name, from = %envelope.producer, "status requested");
        } else {
            warn!(agent = %self.name, topic = %envelope.topic, "unexpected request, answering with status");
        }
        ctx.reply(TOPIC_STATUS, &self.report())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mesh_bus::EndpointRegistry;
    use mesh_core::{MeshConfig, Role};
    use serde_json::json;

    use super::*;
    use crate::agents::testing::WAIT;

    #[test]
    fn counts_by_topic() {
        let mut agent = LoggingAgent::from_params("log", &Value::Null).unwrap();
        for topic in ["TICK", "TICK", "TRADE"] {
            agent.record(&Envelope::new(topic, "x", json!({})));
        }
        let report = agent.report();
        assert_eq!(report.received, 3);
        assert_eq!(report.by_topic["TICK"], 2);
        assert_eq!(report.by_topic["TRADE"], 1);
    }

    async fn status_fabric() -> Arc<EndpointRegistry> {
        let listeners: Vec<_> = (0..2)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let (feed, status) = (
            listeners[0].local_addr().unwrap().port(),
            listeners[1].local_addr().unwrap().port(),
        );
        drop(listeners);
        let cfg = MeshConfig::from_json_str(&format!(
            r#"{{ "agents": {{
                "Feed":     {{ "publisher": {feed} }},
                "Logger":   {{ "subscriber": {feed}, "reply": {status} }},
                "Operator": {{ "request": {status} }}
            }} }}"#
        ))
        .unwrap();
        let reg = Arc::new(EndpointRegistry::new(cfg.topology, cfg.fabric));
        assert!(reg.provision().await.is_complete());
        assert!(reg.wait_ready("Logger", WAIT).await);
        assert!(reg.wait_ready("Operator", WAIT).await);
        reg
    }

    #[tokio::test]
    async fn answers_status_requests() {
        let reg = status_fabric().await;
        let ctx = AgentContext::new("Logger", reg.clone());
        let mut agent = LoggingAgent::from_params("Logger", &Value::Null).unwrap();

        reg.send("Feed", Envelope::new("TICK", "", json!({"close": 1.0}))).unwrap();
        let tick = reg.receive("Logger", WAIT).await.unwrap().unwrap();
        assert_eq!(tick.role, Role::Subscribe);
        agent.handle(&ctx, tick.envelope).await.unwrap();

        let operator = async {
            reg.request("Operator", Envelope::new(TOPIC_STATUS, "", json!({})), WAIT)
                .await
                .unwrap()
                .unwrap()
        };
        let logger = async {
            let req = reg.receive("Logger", WAIT).await.unwrap().unwrap();
            assert_eq!(req.role, Role::Reply);
            agent.handle_request(&ctx, req.envelope).await.unwrap();
        };
        let (answer, ()) = tokio::join!(operator, logger);

        let report: StatusReport = answer.payload_as().unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.by_topic["TICK"], 1);
        reg.close_all().await;
    }

    #[tokio::test]
    async fn published_status_is_recorded_not_answered() {
        let reg = status_fabric().await;
        let ctx = AgentContext::new("Logger", reg.clone());
        let mut agent = LoggingAgent::from_params("Logger", &Value::Null).unwrap();

        reg.send("Feed", Envelope::new(TOPIC_STATUS, "", json!({"health": "ok"}))).unwrap();
        let got = reg.receive("Logger", WAIT).await.unwrap().unwrap();
        assert_eq!(got.role, Role::Subscribe);
        agent.handle(&ctx, got.envelope).await.unwrap();
        assert_eq!(agent.report().by_topic[TOPIC_STATUS], 1);

        // The reply endpoint is still free for a real request.
        let operator = async {
            reg.request("Operator", Envelope::new(TOPIC_STATUS, "", json!({})), WAIT)
                .await
                .unwrap()
                .unwrap()
        };
        let logger = async {
            let req = reg.receive("Logger", WAIT).await.unwrap().unwrap();
            assert_eq!(req.role, Role::Reply);
            agent.handle_request(&ctx, req.envelope).await.unwrap();
        };
        let (answer, ()) = tokio::join!(operator, logger);
        let report: StatusReport = answer.payload_as().unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.by_topic[TOPIC_STATUS], 1);
        reg.close_all().await;
    }
}
