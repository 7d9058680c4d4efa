//! What an agent sees of the fabric.

use std::sync::Arc;
use std::time::Duration;

use mesh_bus::{EndpointInfo, EndpointRegistry, Inbound};
use mesh_core::{Envelope, MeshError, MeshResult, Role};
use serde::Serialize;

/// Agent name plus a handle to the shared registry.
///
/// Cheap to clone. Every operation is addressed by the agent's own name, so
/// an agent can only use endpoints its topology entry declares.
#[derive(Clone)]
pub struct AgentContext {
    name: Arc<str>,
    registry: Arc<EndpointRegistry>,
}

impl AgentContext {
    pub fn new(name: &str, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn poll_timeout(&self) -> Duration {
        self.registry.settings().poll_timeout()
    }

    /// Create (or look up) every endpoint the topology declares for this
    /// agent.
    pub async fn open_endpoints(&self) -> MeshResult<Vec<EndpointInfo>> {
        let cfg = self
            .registry
            .topology()
            .get(&self.name)
            .ok_or_else(|| MeshError::Config(format!("agent '{}' is not in the topology", self.name)))?;
        let mut out = Vec::new();
        for role in cfg.roles() {
            let info = match role {
                Role::Publish => self.registry.create_publisher(&self.name).await?,
                Role::Subscribe => self.registry.create_subscriber(&self.name, None).await?,
                Role::Reply => self.registry.create_reply(&self.name).await?,
                Role::Request => self.registry.create_request(&self.name, None).await?,
            };
            out.push(info);
        }
        Ok(out)
    }

    pub fn has_inbound(&self) -> bool {
        self.registry.has_inbound(&self.name)
    }

    /// Publish `payload` under `topic`.
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> MeshResult<()> {
        let env = Envelope::from_serializable(topic, &*self.name, payload)?;
        self.registry.send_via(&self.name, Role::Publish, env)
    }

    /// Answer the request most recently received on the reply endpoint.
    pub fn reply<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> MeshResult<()> {
        let env = Envelope::from_serializable(topic, &*self.name, payload)?;
        self.registry.send_via(&self.name, Role::Reply, env)
    }

    /// Send a prepared envelope on the default outbound endpoint.
    pub fn send(&self, envelope: Envelope) -> MeshResult<()> {
        self.registry.send(&self.name, envelope)
    }

    /// Ask the reply endpoint this agent's request role points at.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        timeout: Duration,
    ) -> MeshResult<Option<Envelope>> {
        let env = Envelope::from_serializable(topic, &*self.name, payload)?;
        self.registry.request(&self.name, env, timeout).await
    }

    pub async fn receive(&self, timeout: Duration) -> MeshResult<Option<Inbound>> {
        self.registry.receive(&self.name, timeout).await
    }
}
