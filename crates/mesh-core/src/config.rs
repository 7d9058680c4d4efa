//! Topology configuration for the messaging fabric.
//!
//! The whole fabric is described by a single JSON file: optional `fabric`
//! and `logging` blocks plus an `agents` map from agent name to the roles it
//! needs. Loading validates the topology as a whole; any failure is a
//! [`MeshError::Config`] and no partial topology is ever returned.
//!
//! # Example config
//!
//! ```json
//! {
//!   "fabric":  { "host": "127.0.0.1", "poll_timeout_ms": 500, "grace_period_ms": 2000 },
//!   "logging": { "level": "info", "dir": "logs" },
//!   "agents": {
//!     "StrategyAgent":  { "publisher": 5557, "subscriber": [5555, 5559] },
//!     "ExecutionAgent": { "publisher": 5559,
//!                         "subscriber": { "connect": 5557, "topic": "TRADE" } }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ahash::AHashMap;
use serde::Deserialize;

use crate::error::{MeshError, MeshResult};
use crate::types::Role;

/// Lowest port an endpoint may use. Privileged ports are rejected.
pub const MIN_PORT: u16 = 1024;

// ---------------------------------------------------------------------------
// Top-level document
// ---------------------------------------------------------------------------

/// A fully loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub fabric: FabricSettings,
    pub logging: LoggingConfig,
    pub topology: Topology,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    fabric: FabricSettings,
    #[serde(default)]
    logging: LoggingConfig,
    agents: BTreeMap<String, RoleConfig>,
}

impl MeshConfig {
    /// Parse and validate a config document held in memory.
    pub fn from_json_str(content: &str) -> MeshResult<Self> {
        let raw: RawConfig = serde_json::from_str(content)
            .map_err(|e| MeshError::Config(format!("cannot parse config: {e}")))?;
        raw.fabric.validate()?;
        let topology = Topology::new(raw.agents)?;
        Ok(Self {
            fabric: raw.fabric,
            logging: raw.logging,
            topology,
        })
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &Path) -> MeshResult<MeshConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MeshError::Config(format!("cannot read {}: {e}", path.display())))?;
    MeshConfig::from_json_str(&content).map_err(|e| match e {
        MeshError::Config(msg) => MeshError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

// ---------------------------------------------------------------------------
// Fabric + logging settings
// ---------------------------------------------------------------------------

/// What the supervisor does when an agent's endpoint cannot bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindFailurePolicy {
    /// Tear the fabric down and exit.
    #[default]
    Abort,
    /// Leave the affected agent out and run the rest.
    Exclude,
}

/// Runtime knobs for the fabric and supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FabricSettings {
    /// Interface used for binding and connecting.
    pub host: IpAddr,
    /// Bounded poll timeout for every agent loop iteration.
    pub poll_timeout_ms: u64,
    /// How long shutdown waits for agents to observe their flag.
    pub grace_period_ms: u64,
    /// How long the port reservation manager waits for a killed owner.
    pub release_wait_ms: u64,
    /// Whether to terminate processes holding our ports before startup.
    pub free_ports: bool,
    pub on_bind_failure: BindFailurePolicy,
}

impl Default for FabricSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            poll_timeout_ms: 500,
            grace_period_ms: 2000,
            release_wait_ms: 1000,
            free_ports: true,
            on_bind_failure: BindFailurePolicy::Abort,
        }
    }
}

impl FabricSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn release_wait(&self) -> Duration {
        Duration::from_millis(self.release_wait_ms)
    }

    /// Transport address for `port` on the configured host.
    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    fn validate(&self) -> MeshResult<()> {
        if self.poll_timeout_ms == 0 {
            return Err(MeshError::Config("fabric.poll_timeout_ms must be non-zero".into()));
        }
        if self.grace_period_ms == 0 {
            return Err(MeshError::Config("fabric.grace_period_ms must be non-zero".into()));
        }
        Ok(())
    }
}

/// Logging block; the CLI may override any of these.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<String>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-agent roles
// ---------------------------------------------------------------------------

/// The roles one agent declares. An absent role is never created.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    /// Implementation selector; defaults to the agent name.
    #[serde(default)]
    pub kind: Option<String>,
    /// Port the agent publishes on.
    pub publisher: Option<u16>,
    /// Publisher port(s) the agent subscribes to, plus its topic filter.
    pub subscriber: Option<SubscriberConfig>,
    /// Reply port the agent sends requests to.
    pub request: Option<u16>,
    /// Port the agent answers requests on.
    pub reply: Option<u16>,
    /// Opaque implementation parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RoleConfig {
    /// Roles declared by this entry, in [`Role::ALL`] order.
    pub fn roles(&self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|r| self.declares(*r)).collect()
    }

    pub fn declares(&self, role: Role) -> bool {
        match role {
            Role::Publish => self.publisher.is_some(),
            Role::Subscribe => self.subscriber.is_some(),
            Role::Request => self.request.is_some(),
            Role::Reply => self.reply.is_some(),
        }
    }

    /// The implementation kind, falling back to the agent's own name.
    pub fn kind_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(name)
    }
}

/// Subscriber declaration: one filter over one or more publishers.
///
/// Accepts `5555`, `[5555, 5559]` or `{"connect": 5555, "topic": "NEWS"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawSubscriber")]
pub struct SubscriberConfig {
    pub connect: Vec<u16>,
    /// Prefix filter; empty means every topic.
    pub topic: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortList {
    One(u16),
    Many(Vec<u16>),
}

impl From<PortList> for Vec<u16> {
    fn from(p: PortList) -> Self {
        match p {
            PortList::One(port) => vec![port],
            PortList::Many(ports) => ports,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSubscriber {
    Ports(PortList),
    Detailed {
        connect: PortList,
        #[serde(default)]
        topic: String,
    },
}

impl From<RawSubscriber> for SubscriberConfig {
    fn from(raw: RawSubscriber) -> Self {
        match raw {
            RawSubscriber::Ports(ports) => Self {
                connect: ports.into(),
                topic: String::new(),
            },
            RawSubscriber::Detailed { connect, topic } => Self {
                connect: connect.into(),
                topic,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Validated, immutable agent → roles mapping.
#[derive(Debug, Clone)]
pub struct Topology {
    agents: BTreeMap<String, RoleConfig>,
}

impl Topology {
    /// Validate `agents` as a whole.
    ///
    /// Rules: at least one agent; every agent declares a role; ports are in
    /// the user range; no port is bound twice; every subscriber port belongs
    /// to a publisher and every request port to a reply endpoint.
    pub fn new(agents: BTreeMap<String, RoleConfig>) -> MeshResult<Self> {
        if agents.is_empty() {
            return Err(MeshError::Config("topology declares no agents".into()));
        }

        let mut bound: AHashMap<u16, (&str, Role)> = AHashMap::new();
        for (name, cfg) in &agents {
            if name.trim().is_empty() {
                return Err(MeshError::Config("agent name must not be empty".into()));
            }
            if cfg.roles().is_empty() {
                return Err(MeshError::Config(format!("agent '{name}' declares no roles")));
            }
            for (role, port) in [(Role::Publish, cfg.publisher), (Role::Reply, cfg.reply)] {
                let Some(port) = port else { continue };
                check_range(name, role, port)?;
                if let Some((other, other_role)) = bound.insert(port, (name.as_str(), role)) {
                    return Err(MeshError::Config(format!(
                        "port {port} declared by both '{other}' ({other_role}) and '{name}' ({role})"
                    )));
                }
            }
        }

        for (name, cfg) in &agents {
            if let Some(sub) = &cfg.subscriber {
                if sub.connect.is_empty() {
                    return Err(MeshError::Config(format!(
                        "agent '{name}' declares a subscriber with no ports"
                    )));
                }
                for &port in &sub.connect {
                    check_range(name, Role::Subscribe, port)?;
                    match bound.get(&port) {
                        Some((_, Role::Publish)) => {}
                        _ => {
                            return Err(MeshError::Config(format!(
                                "agent '{name}' subscribes to port {port}, which no agent publishes on"
                            )));
                        }
                    }
                }
            }
            if let Some(port) = cfg.request {
                check_range(name, Role::Request, port)?;
                match bound.get(&port) {
                    Some((_, Role::Reply)) => {}
                    _ => {
                        return Err(MeshError::Config(format!(
                            "agent '{name}' requests port {port}, which no agent replies on"
                        )));
                    }
                }
            }
        }

        Ok(Self { agents })
    }

    pub fn get(&self, agent: &str) -> Option<&RoleConfig> {
        self.agents.get(agent)
    }

    /// Agents in name order.
    pub fn agents(&self) -> impl Iterator<Item = (&str, &RoleConfig)> {
        self.agents.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Every port some endpoint binds (publisher and reply), sorted.
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .agents
            .values()
            .flat_map(|c| [c.publisher, c.reply])
            .flatten()
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Total number of (agent, role) endpoints the topology declares.
    pub fn declared_endpoints(&self) -> usize {
        self.agents.values().map(|c| c.roles().len()).sum()
    }
}

fn check_range(agent: &str, role: Role, port: u16) -> MeshResult<()> {
    if port < MIN_PORT {
        return Err(MeshError::Config(format!(
            "agent '{agent}' {role} port {port} is outside {MIN_PORT}..=65535"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const PIPELINE: &str = r#"{
        "fabric": { "poll_timeout_ms": 100 },
        "agents": {
            "MarketDataAgent": { "publisher": 5555 },
            "StrategyAgent":   { "publisher": 5557, "subscriber": [5555, 5559] },
            "ExecutionAgent":  { "publisher": 5559, "subscriber": { "connect": 5557, "topic": "TRADE" } },
            "LoggingAgent":    { "subscriber": 5555, "reply": 5560 },
            "Auditor":         { "request": 5560 }
        }
    }"#;

    fn config_err(json: &str) -> String {
        match MeshConfig::from_json_str(json) {
            Err(MeshError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn parses_pipeline() {
        let cfg = MeshConfig::from_json_str(PIPELINE).unwrap();
        assert_eq!(cfg.topology.len(), 5);
        assert_eq!(cfg.fabric.poll_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.fabric.grace_period_ms, 2000);
        assert_eq!(cfg.logging.level, "info");

        let strategy = cfg.topology.get("StrategyAgent").unwrap();
        assert_eq!(strategy.roles(), vec![Role::Publish, Role::Subscribe]);
        let sub = strategy.subscriber.as_ref().unwrap();
        assert_eq!(sub.connect, vec![5555, 5559]);
        assert_eq!(sub.topic, "");

        let exec = cfg.topology.get("ExecutionAgent").unwrap();
        assert_eq!(exec.subscriber.as_ref().unwrap().topic, "TRADE");

        let logging = cfg.topology.get("LoggingAgent").unwrap();
        assert_eq!(logging.subscriber.as_ref().unwrap().connect, vec![5555]);

        assert_eq!(cfg.topology.bound_ports(), vec![5555, 5557, 5559, 5560]);
        assert_eq!(cfg.topology.declared_endpoints(), 8);
    }

    #[test]
    fn kind_defaults_to_name() {
        let cfg = MeshConfig::from_json_str(
            r#"{"agents": {"A": {"publisher": 6000, "kind": "market_data"}, "B": {"publisher": 6001}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.topology.get("A").unwrap().kind_or("A"), "market_data");
        assert_eq!(cfg.topology.get("B").unwrap().kind_or("B"), "B");
    }

    #[test]
    fn rejects_duplicate_publisher_port() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000}, "B": {"publisher": 6000}}}"#);
        assert!(msg.contains("port 6000 declared by both 'A'"), "{msg}");
    }

    #[test]
    fn rejects_reply_colliding_with_publisher() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000}, "B": {"reply": 6000}}}"#);
        assert!(msg.contains("port 6000"), "{msg}");
    }

    #[test]
    fn rejects_privileged_port() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 80}}}"#);
        assert!(msg.contains("outside 1024..=65535"), "{msg}");
    }

    #[test]
    fn rejects_out_of_range_port_at_parse() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 70000}}}"#);
        assert!(msg.contains("cannot parse"), "{msg}");
    }

    #[test]
    fn rejects_agent_without_roles() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000}, "Idle": {}}}"#);
        assert!(msg.contains("'Idle' declares no roles"), "{msg}");
    }

    #[test]
    fn rejects_dangling_subscriber() {
        let msg = config_err(r#"{"agents": {"A": {"subscriber": 6001}}}"#);
        assert!(msg.contains("no agent publishes"), "{msg}");
    }

    #[test]
    fn rejects_subscriber_to_reply_port() {
        let msg = config_err(r#"{"agents": {"A": {"reply": 6001}, "B": {"subscriber": 6001}}}"#);
        assert!(msg.contains("no agent publishes"), "{msg}");
    }

    #[test]
    fn rejects_dangling_request() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000}, "B": {"request": 6000}}}"#);
        assert!(msg.contains("no agent replies"), "{msg}");
    }

    #[test]
    fn rejects_empty_subscriber_list() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000}, "B": {"subscriber": []}}}"#);
        assert!(msg.contains("no ports"), "{msg}");
    }

    #[test]
    fn rejects_empty_topology() {
        assert!(config_err(r#"{"agents": {}}"#).contains("no agents"));
    }

    #[test]
    fn rejects_zero_poll_timeout() {
        let msg = config_err(r#"{"fabric": {"poll_timeout_ms": 0}, "agents": {"A": {"publisher": 6000}}}"#);
        assert!(msg.contains("poll_timeout_ms"), "{msg}");
    }

    #[test]
    fn rejects_unknown_role_field() {
        let msg = config_err(r#"{"agents": {"A": {"publisher": 6000, "pusher": 6001}}}"#);
        assert!(msg.contains("cannot parse"), "{msg}");
    }

    #[test]
    fn load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PIPELINE.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.topology.names().count(), 5);
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, MeshError::Config(ref m) if m.contains("cannot read")), "{err}");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.is_fatal());
    }
}
