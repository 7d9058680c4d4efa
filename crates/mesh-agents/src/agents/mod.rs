//! Built-in pipeline agents.
//!
//! Every external collaborator (quote feed, sentiment model, trading policy,
//! broker) sits behind a trait with a self-contained default, so the whole
//! pipeline runs offline.

pub mod execution;
pub mod market_data;
pub mod monitor;
pub mod risk;
pub mod sentiment;
pub mod strategy;

use mesh_core::{MeshError, MeshResult};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Decode an agent's `params` block; an absent block means defaults.
pub(crate) fn parse_params<P: DeserializeOwned + Default>(agent: &str, params: &Value) -> MeshResult<P> {
    if params.is_null() {
        return Ok(P::default());
    }
    P::deserialize(params).map_err(|e| MeshError::Config(format!("agent '{agent}' params: {e}")))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A fabric with one driver agent wired to the agent under test.

    use std::sync::Arc;
    use std::time::Duration;

    use mesh_bus::EndpointRegistry;
    use mesh_core::{Envelope, MeshConfig};

    use crate::AgentContext;

    pub(crate) const WAIT: Duration = Duration::from_secs(3);

    pub(crate) struct Harness {
        pub reg: Arc<EndpointRegistry>,
        /// Context of the agent under test ("Subject").
        pub ctx: AgentContext,
    }

    /// "Driver" publishes into the subject and subscribes to everything the
    /// subject publishes.
    pub(crate) async fn harness() -> Harness {
        let listeners: Vec<_> = (0..2)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let driver = listeners[0].local_addr().unwrap().port();
        let subject = listeners[1].local_addr().unwrap().port();
        drop(listeners);

        let cfg = MeshConfig::from_json_str(&format!(
            r#"{{
                "fabric": {{ "poll_timeout_ms": 50 }},
                "agents": {{
                    "Driver":   {{ "publisher": {driver}, "subscriber": {subject} }},
                    "Subject": {{ "publisher": {subject}, "subscriber": {driver} }}
                }}
            }}"#
        ))
        .unwrap();
        let reg = Arc::new(EndpointRegistry::new(cfg.topology, cfg.fabric));
        assert!(reg.provision().await.is_complete());
        assert!(reg.wait_ready("Driver", WAIT).await);
        assert!(reg.wait_ready("Subject", WAIT).await);
        let ctx = AgentContext::new("Subject", reg.clone());
        Harness { reg, ctx }
    }

    impl Harness {
        /// Next envelope the subject published, if any within a short wait.
        pub(crate) async fn published(&self) -> Option<Envelope> {
            self.reg
                .receive("Driver", Duration::from_millis(300))
                .await
                .unwrap()
                .map(|got| got.envelope)
        }

        pub(crate) async fn close(self) {
            self.reg.close_all().await;
        }
    }
}
