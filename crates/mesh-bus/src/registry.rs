//! Endpoint registry: the single owner of every socket in the fabric.
//!
//! ```text
//! Topology ──► provision()      ──► one endpoint per declared (agent, role)
//!          ──► send / receive   ──► routed by agent name
//!          ──► close_all()      ──► every socket closed, registry sealed
//! ```
//!
//! The registry is created once by the supervisor and shared with agents as
//! an `Arc`. Endpoint creation is serialized; sends and receives only take a
//! short read lock to look the endpoint up.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use ahash::AHashMap;
use mesh_core::config::RoleConfig;
use mesh_core::{Envelope, FabricSettings, MeshError, MeshResult, Role, Topology};
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Endpoint, EndpointInfo};
use crate::transport::MAX_FRAME_BODY;
use crate::transport::publisher::PubSocket;
use crate::transport::reply::RepSocket;
use crate::transport::request::ReqSocket;
use crate::transport::subscriber::SubSocket;

/// Roles `send` tries, in order.
const SEND_ORDER: [Role; 3] = [Role::Publish, Role::Reply, Role::Request];

/// Roles `receive` polls.
const RECEIVE_ROLES: [Role; 3] = [Role::Subscribe, Role::Reply, Role::Request];

type EndpointMap = AHashMap<String, BTreeMap<Role, Arc<Endpoint>>>;

/// Outcome of [`EndpointRegistry::provision`].
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Endpoints that exist after provisioning.
    pub created: usize,
    /// Agents that could not get all their endpoints, with the cause.
    pub failed: Vec<(String, MeshError)>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One envelope returned by [`EndpointRegistry::receive`], tagged with the
/// endpoint it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub role: Role,
    pub envelope: Envelope,
}

pub struct EndpointRegistry {
    topology: Topology,
    settings: FabricSettings,
    endpoints: RwLock<EndpointMap>,
    create_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl EndpointRegistry {
    pub fn new(topology: Topology, settings: FabricSettings) -> Self {
        Self {
            topology,
            settings,
            endpoints: RwLock::new(AHashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &FabricSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Bind the agent's publish port. Idempotent.
    pub async fn create_publisher(&self, agent: &str) -> MeshResult<EndpointInfo> {
        let settings = &self.settings;
        self.create_with(agent, Role::Publish, |cfg| async move {
            let addr = settings.addr(cfg.publisher.unwrap_or_default());
            let sock = PubSocket::bind(agent, addr).await.map_err(|source| MeshError::Bind {
                agent: agent.to_string(),
                addr,
                source,
            })?;
            Ok(Endpoint::publisher(agent, sock))
        })
        .await
    }

    /// Connect the agent's subscriber to its publishers.
    ///
    /// `topic` overrides the configured filter; `None` keeps it. An endpoint
    /// has exactly one filter, fixed when it is first created.
    pub async fn create_subscriber(&self, agent: &str, topic: Option<&str>) -> MeshResult<EndpointInfo> {
        let settings = &self.settings;
        let info = self
            .create_with(agent, Role::Subscribe, |cfg| async move {
                let Some(sub) = cfg.subscriber else {
                    return Err(MeshError::no_endpoint(agent, &[Role::Subscribe]));
                };
                let filter = topic.unwrap_or(sub.topic.as_str());
                let targets: Vec<_> = sub.connect.iter().map(|p| settings.addr(*p)).collect();
                let (sock, failed) = SubSocket::connect(agent, &targets, filter).await;
                for (addr, e) in failed {
                    let err = MeshError::Connect {
                        agent: agent.to_string(),
                        addr,
                        reason: e.to_string(),
                    };
                    warn!(agent, %addr, "{err}; retrying in background");
                }
                Ok(Endpoint::subscriber(agent, sock))
            })
            .await?;
        if let Some(wanted) = topic {
            if wanted != info.topic {
                warn!(agent, topic = %info.topic, "subscriber already filters on {:?}, ignoring {wanted:?}", info.topic);
            }
        }
        Ok(info)
    }

    /// Bind the agent's reply port. Idempotent.
    pub async fn create_reply(&self, agent: &str) -> MeshResult<EndpointInfo> {
        let settings = &self.settings;
        self.create_with(agent, Role::Reply, |cfg| async move {
            let addr = settings.addr(cfg.reply.unwrap_or_default());
            let sock = RepSocket::bind(agent, addr).await.map_err(|source| MeshError::Bind {
                agent: agent.to_string(),
                addr,
                source,
            })?;
            Ok(Endpoint::reply(agent, sock))
        })
        .await
    }

    /// Connect the agent's request endpoint to a reply port.
    ///
    /// `target` overrides the configured reply port.
    pub async fn create_request(&self, agent: &str, target: Option<u16>) -> MeshResult<EndpointInfo> {
        let settings = &self.settings;
        self.create_with(agent, Role::Request, |cfg| async move {
            let port = target.or(cfg.request).unwrap_or_default();
            let addr = settings.addr(port);
            let (sock, err) = ReqSocket::connect(agent, addr).await;
            if let Some(e) = err {
                let err = MeshError::Connect {
                    agent: agent.to_string(),
                    addr,
                    reason: e.to_string(),
                };
                warn!(agent, %addr, "{err}; retrying in background");
            }
            Ok(Endpoint::request(agent, sock))
        })
        .await
    }

    /// Create every endpoint the topology declares.
    ///
    /// Listening roles are bound first so connecting roles find their
    /// targets on the first attempt. An agent whose endpoint fails is
    /// reported and its remaining roles are skipped; other agents are still
    /// provisioned.
    pub async fn provision(&self) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        for binding in [true, false] {
            for (agent, cfg) in self.topology.agents() {
                if report.failed.iter().any(|(a, _)| a == agent) {
                    continue;
                }
                for role in cfg.roles().into_iter().filter(|r| r.binds() == binding) {
                    let created = match role {
                        Role::Publish => self.create_publisher(agent).await,
                        Role::Subscribe => self.create_subscriber(agent, None).await,
                        Role::Reply => self.create_reply(agent).await,
                        Role::Request => self.create_request(agent, None).await,
                    };
                    if let Err(e) = created {
                        warn!(agent, role = %role, "provisioning failed: {e}");
                        report.failed.push((agent.to_string(), e));
                        break;
                    }
                }
            }
        }
        report.created = self.endpoint_count();
        info!(
            "provisioned {} endpoint(s) for {} agent(s), {} failure(s)",
            report.created,
            self.topology.len(),
            report.failed.len()
        );
        report
    }

    async fn create_with<F, Fut>(&self, agent: &str, role: Role, open: F) -> MeshResult<EndpointInfo>
    where
        F: FnOnce(RoleConfig) -> Fut,
        Fut: Future<Output = MeshResult<Endpoint>>,
    {
        self.ensure_open()?;
        let _guard = self.create_lock.lock().await;
        self.ensure_open()?;

        if let Some(ep) = self.lookup(agent, role) {
            trace!(agent, role = %role, "endpoint already exists");
            return Ok(ep.info().clone());
        }

        let cfg = self
            .topology
            .get(agent)
            .ok_or_else(|| MeshError::Config(format!("agent '{agent}' is not in the topology")))?;
        if !cfg.declares(role) {
            return Err(MeshError::no_endpoint(agent, &[role]));
        }

        let ep = open(cfg.clone()).await?;
        let info = ep.info().clone();
        info!(agent, role = %role, "endpoint ready: {info}");
        self.write()
            .entry(agent.to_string())
            .or_default()
            .insert(role, Arc::new(ep));
        Ok(info)
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send on the agent's publish endpoint, or its reply endpoint, or its
    /// request endpoint, whichever exists first.
    ///
    /// An empty `producer` is filled with the agent name.
    pub fn send(&self, agent: &str, envelope: Envelope) -> MeshResult<()> {
        self.ensure_open()?;
        let ep = SEND_ORDER
            .iter()
            .find_map(|r| self.lookup(agent, *r))
            .ok_or_else(|| MeshError::no_endpoint(agent, &SEND_ORDER))?;
        transmit(agent, &ep, envelope)
    }

    /// Send on one specific role.
    pub fn send_via(&self, agent: &str, role: Role, envelope: Envelope) -> MeshResult<()> {
        self.ensure_open()?;
        let ep = self
            .lookup(agent, role)
            .ok_or_else(|| MeshError::no_endpoint(agent, &[role]))?;
        transmit(agent, &ep, envelope)
    }

    /// Wait up to `timeout` for the next envelope on any inbound endpoint.
    ///
    /// `Ok(None)` means nothing arrived in time. Only envelopes tagged
    /// [`Role::Reply`] are requests that must be answered.
    pub async fn receive(&self, agent: &str, timeout: Duration) -> MeshResult<Option<Inbound>> {
        self.ensure_open()?;
        let [sub, rep, req] = RECEIVE_ROLES.map(|r| self.lookup(agent, r));
        if sub.is_none() && rep.is_none() && req.is_none() {
            return Err(MeshError::no_endpoint(agent, &RECEIVE_ROLES));
        }

        let polled = tokio::time::timeout(timeout, async {
            tokio::select! {
                env = recv_from(sub.as_deref()) => (Role::Subscribe, env),
                env = recv_from(rep.as_deref()) => (Role::Reply, env),
                env = recv_from(req.as_deref()) => (Role::Request, env),
            }
        })
        .await;

        match polled {
            Err(_) => Ok(None),
            Ok((role, Some(envelope))) => {
                trace!(agent, role = %role, topic = %envelope.topic, "received");
                Ok(Some(Inbound { role, envelope }))
            }
            Ok((role, None)) => {
                if self.is_closed() {
                    Err(MeshError::Closed)
                } else {
                    Err(MeshError::transport(agent, format!("{role} endpoint stopped")))
                }
            }
        }
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn request(&self, agent: &str, envelope: Envelope, timeout: Duration) -> MeshResult<Option<Envelope>> {
        self.ensure_open()?;
        let ep = self
            .lookup(agent, Role::Request)
            .ok_or_else(|| MeshError::no_endpoint(agent, &[Role::Request]))?;
        transmit(agent, &ep, envelope)?;
        match tokio::time::timeout(timeout, ep.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(env)) => Ok(Some(env)),
            Ok(None) => Err(MeshError::transport(agent, "request endpoint stopped")),
        }
    }

    /// Wait until every connecting endpoint of `agent` is established.
    pub async fn wait_ready(&self, agent: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let eps: Vec<_> = self
            .read()
            .get(agent)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        for ep in eps {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !ep.wait_ready(left).await {
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn endpoint(&self, agent: &str, role: Role) -> Option<EndpointInfo> {
        self.lookup(agent, role).map(|ep| ep.info().clone())
    }

    /// Every endpoint of `agent`, in role order.
    pub fn endpoints_of(&self, agent: &str) -> Vec<EndpointInfo> {
        self.read()
            .get(agent)
            .map(|m| m.values().map(|ep| ep.info().clone()).collect())
            .unwrap_or_default()
    }

    pub fn endpoint_count(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    /// Whether `agent` has anything to receive on.
    pub fn has_inbound(&self, agent: &str) -> bool {
        RECEIVE_ROLES.iter().any(|r| self.lookup(agent, *r).is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Close every endpoint of one agent. Returns how many were closed.
    pub async fn close_agent(&self, agent: &str) -> usize {
        let _guard = self.create_lock.lock().await;
        let removed = self.write().remove(agent).unwrap_or_default();
        let n = removed.len();
        futures_util::future::join_all(removed.values().map(|ep| ep.close())).await;
        if n > 0 {
            info!(agent, "closed {n} endpoint(s)");
        }
        n
    }

    /// Close every endpoint and refuse further use. Safe to call repeatedly.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("registry already closed");
            return;
        }
        let _guard = self.create_lock.lock().await;
        let drained: Vec<Arc<Endpoint>> = self
            .write()
            .drain()
            .flat_map(|(_, eps)| eps.into_values())
            .collect();
        futures_util::future::join_all(drained.iter().map(|ep| ep.close())).await;
        info!("registry closed, {} endpoint(s) released", drained.len());
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_open(&self) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        Ok(())
    }

    fn lookup(&self, agent: &str, role: Role) -> Option<Arc<Endpoint>> {
        self.read().get(agent).and_then(|m| m.get(&role)).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, EndpointMap> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EndpointMap> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transmit(agent: &str, ep: &Endpoint, mut envelope: Envelope) -> MeshResult<()> {
    if envelope.producer.is_empty() {
        envelope.producer = agent.to_string();
    }
    let body = envelope.encode()?;
    if body.len() > MAX_FRAME_BODY {
        return Err(MeshError::Serialization(format!(
            "envelope of {} bytes exceeds the {MAX_FRAME_BODY} byte frame limit",
            body.len()
        )));
    }
    ep.send(&body)?;
    trace!(agent, role = %ep.info().role, topic = %envelope.topic, "sent");
    Ok(())
}

async fn recv_from(ep: Option<&Endpoint>) -> Option<Envelope> {
    match ep {
        Some(ep) => ep.recv().await,
        None => std::future::pending().await,
    }
}
