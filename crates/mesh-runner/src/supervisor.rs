//! Agent supervision: startup, crash isolation and coordinated shutdown.
//!
//! The supervisor owns the [`EndpointRegistry`] and one worker task per
//! agent. Shutdown clears every agent's `running` flag, waits up to the
//! grace period for the loops to notice, aborts whatever is left and closes
//! the fabric exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use mesh_agents::{Agent, AgentContext, AgentExit, AgentHandle, create_agent, run_agent};
use mesh_bus::{EndpointRegistry, ports};
use mesh_core::config::BindFailurePolicy;
use mesh_core::{MeshConfig, MeshResult, RoleConfig};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::signals;

/// Upper bound on waiting for connecting endpoints before agents start.
const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of [`Supervisor::shutdown`], by agent name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Loops that observed the stop flag within the grace period.
    pub stopped: Vec<String>,
    /// Agents that failed to initialize or whose task crashed.
    pub failed: Vec<String>,
    /// Loops still running after the grace period.
    pub aborted: Vec<String>,
}

struct Worker {
    handle: AgentHandle,
    abort: AbortHandle,
    /// Awaits the agent task and logs how it ended.
    monitor: JoinHandle<Option<AgentExit>>,
}

pub struct Supervisor {
    registry: Arc<EndpointRegistry>,
    handles: Vec<AgentHandle>,
    workers: Mutex<Vec<Worker>>,
    /// Number of agent tasks still alive.
    live: watch::Receiver<usize>,
    stopping: AtomicBool,
    done: watch::Sender<Option<ShutdownSummary>>,
}

impl Supervisor {
    /// Start every agent in `config` with the built-in agent kinds.
    pub async fn start(config: MeshConfig) -> Result<Self> {
        Self::start_with(config, create_agent).await
    }

    /// Start every agent in `config`, building each one with `factory`.
    ///
    /// Agents are built before any endpoint is bound, so a bad `kind` or
    /// bad params never leaves ports open. Bind failures follow
    /// `fabric.on_bind_failure`.
    pub async fn start_with<F>(config: MeshConfig, factory: F) -> Result<Self>
    where
        F: Fn(&str, &RoleConfig) -> MeshResult<Box<dyn Agent>>,
    {
        let MeshConfig { fabric, topology, .. } = config;

        // 1. Build agents
        let mut agents: BTreeMap<String, Box<dyn Agent>> = BTreeMap::new();
        for (name, cfg) in topology.agents() {
            let agent = factory(name, cfg)?;
            debug!(agent = name, kind = cfg.kind_or(name), "agent created");
            agents.insert(name.to_string(), agent);
        }

        // 2. Reclaim ports left behind by earlier runs
        if fabric.free_ports {
            let report = ports::free(&topology, fabric.release_wait()).await;
            if !report.freed.is_empty() {
                info!(ports = ?report.freed, "released ports held by other processes");
            }
            if !report.still_held.is_empty() {
                warn!(ports = ?report.still_held, "ports still held, binding may fail");
            }
        }

        // 3. Provision every declared endpoint
        let registry = Arc::new(EndpointRegistry::new(topology, fabric.clone()));
        let report = registry.provision().await;
        if !report.is_complete() {
            match fabric.on_bind_failure {
                BindFailurePolicy::Abort => {
                    let reasons: Vec<String> = report.failed.iter().map(|(a, e)| format!("{a}: {e}")).collect();
                    registry.close_all().await;
                    bail!("endpoint provisioning failed: {}", reasons.join("; "));
                }
                BindFailurePolicy::Exclude => {
                    for (agent, e) in &report.failed {
                        warn!(agent = %agent, "excluding agent: {e}");
                        registry.close_agent(agent).await;
                        agents.remove(agent);
                    }
                    if agents.is_empty() {
                        registry.close_all().await;
                        bail!("every agent was excluded");
                    }
                }
            }
        }
        info!("{} endpoint(s) provisioned for {} agent(s)", registry.endpoint_count(), agents.len());

        // 4. Give subscribers and requesters a chance to connect
        let ready = futures_util::future::join_all(
            agents.keys().map(|name| registry.wait_ready(name, READY_TIMEOUT)),
        )
        .await;
        for (name, ok) in agents.keys().zip(ready) {
            if !ok {
                warn!(agent = %name, "not every peer is reachable yet, starting anyway");
            }
        }

        // 5. One worker task per agent
        let (live_tx, live) = watch::channel(agents.len());
        let live_tx = Arc::new(live_tx);
        let mut workers = Vec::with_capacity(agents.len());
        for (name, agent) in agents {
            let handle = AgentHandle::new(&name);
            let ctx = AgentContext::new(&name, registry.clone());
            let task = tokio::spawn(run_agent(agent, ctx, handle.clone()));
            let abort = task.abort_handle();
            let live_tx = live_tx.clone();
            let monitor = tokio::spawn(async move {
                let exit = match task.await {
                    Ok(exit) => {
                        debug!(agent = %name, ?exit, "agent loop ended");
                        Some(exit)
                    }
                    Err(e) if e.is_panic() => {
                        error!(agent = %name, "agent task crashed");
                        None
                    }
                    Err(_) => {
                        warn!(agent = %name, "agent task aborted");
                        None
                    }
                };
                live_tx.send_modify(|n| *n = n.saturating_sub(1));
                exit
            });
            workers.push(Worker { handle, abort, monitor });
        }
        info!("{} agent(s) started", workers.len());

        Ok(Self {
            registry,
            handles: workers.iter().map(|w| w.handle.clone()).collect(),
            workers: Mutex::new(workers),
            live,
            stopping: AtomicBool::new(false),
            done: watch::Sender::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Handles of the agents that were started.
    pub fn agents(&self) -> &[AgentHandle] {
        &self.handles
    }

    /// Wait for a termination signal (or for every agent to exit on its
    /// own), then shut down. Further signals during shutdown are logged
    /// and ignored.
    pub async fn run_until_signal(&self) -> ShutdownSummary {
        let mut live = self.live.clone();
        tokio::select! {
            signal = signals::shutdown_signal() => info!("{signal} received, shutting down"),
            _ = live.wait_for(|n| *n == 0) => warn!("every agent has exited, shutting down"),
        }

        let shutdown = self.shutdown();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                summary = &mut shutdown => return summary,
                signal = signals::shutdown_signal() => {
                    warn!("{signal} received again, shutdown already in progress");
                }
            }
        }
    }

    /// Stop every agent and close the fabric.
    ///
    /// Safe to call repeatedly and concurrently: later calls wait for the
    /// first one to finish and return the same summary.
    pub async fn shutdown(&self) -> ShutdownSummary {
        if self.stopping.swap(true, Ordering::AcqRel) {
            info!("shutdown already requested, ignoring duplicate");
            let mut done = self.done.subscribe();
            return match done.wait_for(Option::is_some).await {
                Ok(summary) => (*summary).clone().unwrap_or_default(),
                Err(_) => ShutdownSummary::default(),
            };
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        info!("stopping {} agent(s)", workers.len());
        for w in &workers {
            w.handle.stop();
        }

        let deadline = tokio::time::Instant::now() + self.registry.settings().grace_period();
        let mut summary = ShutdownSummary::default();
        for mut w in workers {
            let name = w.handle.name().to_string();
            match tokio::time::timeout_at(deadline, &mut w.monitor).await {
                Ok(Ok(Some(AgentExit::Stopped { handled, failed }))) => {
                    debug!(agent = %name, handled, failed, "stopped");
                    summary.stopped.push(name);
                }
                Ok(_) => summary.failed.push(name),
                Err(_) => {
                    warn!(
                        agent = %name,
                        state = ?w.handle.state(),
                        "did not stop within the grace period, aborting"
                    );
                    w.abort.abort();
                    summary.aborted.push(name);
                }
            }
        }

        self.registry.close_all().await;
        info!(
            stopped = summary.stopped.len(),
            failed = summary.failed.len(),
            aborted = summary.aborted.len(),
            "shutdown complete"
        );
        self.done.send_replace(Some(summary.clone()));
        summary
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use async_trait::async_trait;
    use mesh_agents::messages::{StatusReport, TOPIC_STATUS};
    use mesh_agents::AgentState;
    use mesh_core::{Envelope, Role};
    use serde_json::{Value, json};

    use super::*;

    const POLL_MS: u64 = 50;

    fn free_ports<const N: usize>() -> [u16; N] {
        let listeners: Vec<TcpListener> = (0..N).map(|_| TcpListener::bind("127.0.0.1:0").unwrap()).collect();
        std::array::from_fn(|i| listeners[i].local_addr().unwrap().port())
    }

    fn config(agents: Value, grace_ms: u64, on_bind_failure: &str) -> MeshConfig {
        let doc = json!({
            "fabric": {
                "poll_timeout_ms": POLL_MS,
                "grace_period_ms": grace_ms,
                "free_ports": false,
                "on_bind_failure": on_bind_failure,
            },
            "agents": agents,
        });
        MeshConfig::from_json_str(&doc.to_string()).unwrap()
    }

    fn feed_and_logger(feed: u16) -> Value {
        json!({
            "MarketDataAgent": {
                "publisher": feed,
                "params": {"tickers": ["SPY"], "interval_ms": 20}
            },
            "LoggingAgent": {"subscriber": feed},
        })
    }

    /// Never finishes `initialize`, so it never sees its stop flag.
    struct Stuck;

    #[async_trait]
    impl Agent for Stuck {
        fn name(&self) -> &str {
            "Stuck"
        }

        async fn initialize(&mut self, _ctx: &AgentContext) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn handle(&mut self, _ctx: &AgentContext, _envelope: Envelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Asks the status endpoint for counts on every tick.
    struct StatusPoller {
        latest: Arc<StdMutex<Option<StatusReport>>>,
    }

    #[async_trait]
    impl Agent for StatusPoller {
        fn name(&self) -> &str {
            "Operator"
        }

        async fn handle(&mut self, _ctx: &AgentContext, _envelope: Envelope) -> anyhow::Result<()> {
            Ok(())
        }

        async fn tick(&mut self, ctx: &AgentContext) -> anyhow::Result<()> {
            let timeout = ctx.poll_timeout() / 2;
            if let Some(answer) = ctx.request(TOPIC_STATUS, &json!({}), timeout).await? {
                *self.latest.lock().unwrap() = Some(answer.payload_as()?);
            }
            Ok(())
        }
    }

    #[test]
    fn sample_config_builds_every_agent() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/pipeline.json");
        let cfg = mesh_core::config::load_config(&path).unwrap();
        assert_eq!(cfg.topology.len(), 6);
        for (name, entry) in cfg.topology.agents() {
            assert_eq!(create_agent(name, entry).unwrap().name(), name);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_every_agent_within_grace() {
        let [feed] = free_ports();
        let grace_ms = 1000;
        let sup = Supervisor::start(config(feed_and_logger(feed), grace_ms, "abort")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.agents().iter().all(|h| h.state() == AgentState::Running));

        let started = Instant::now();
        let summary = sup.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(grace_ms + POLL_MS));
        assert_eq!(summary.stopped, vec!["LoggingAgent", "MarketDataAgent"]);
        assert!(summary.aborted.is_empty());
        assert!(sup.agents().iter().all(|h| !h.is_running() && h.state() == AgentState::Stopped));
        assert!(sup.registry().is_closed());
    }

    #[cfg(unix)]
    fn raise_sigterm() {
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_stops_every_agent_within_grace() {
        let [feed] = free_ports();
        let grace_ms = 1000;
        let sup = Supervisor::start(config(feed_and_logger(feed), grace_ms, "abort")).await.unwrap();

        // run_until_signal installs its handlers on first poll, before the sleep.
        let signaller = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            raise_sigterm();
            Instant::now()
        };
        let (summary, raised) = tokio::join!(sup.run_until_signal(), signaller);

        assert!(raised.elapsed() < Duration::from_millis(grace_ms + POLL_MS));
        assert_eq!(summary.stopped, vec!["LoggingAgent", "MarketDataAgent"]);
        assert!(summary.aborted.is_empty());
        assert!(sup.agents().iter().all(|h| !h.is_running() && h.state() == AgentState::Stopped));
        assert!(sup.registry().is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repeated_sigterm_during_shutdown_is_ignored() {
        let [feed] = free_ports();
        let agents = json!({"Stuck": {"publisher": feed}});
        let sup = Supervisor::start_with(config(agents, 400, "abort"), |_: &str, _: &RoleConfig| {
            Ok(Box::new(Stuck) as Box<dyn Agent>)
        })
        .await
        .unwrap();

        let signaller = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            raise_sigterm();
            tokio::time::sleep(Duration::from_millis(150)).await;
            raise_sigterm();
        };
        let (summary, ()) = tokio::join!(sup.run_until_signal(), signaller);

        assert_eq!(summary.aborted, vec!["Stuck"]);
        assert!(sup.registry().is_closed());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let [feed] = free_ports();
        let sup = Supervisor::start(config(feed_and_logger(feed), 1000, "abort")).await.unwrap();
        let (first, second) = tokio::join!(sup.shutdown(), sup.shutdown());
        assert_eq!(first, second);
        assert_eq!(sup.shutdown().await, first);
        assert_eq!(first.stopped.len(), 2);
    }

    #[tokio::test]
    async fn stuck_agent_is_aborted_after_grace() {
        let [feed] = free_ports();
        let agents = json!({"Stuck": {"publisher": feed}});
        let sup = Supervisor::start_with(config(agents, 200, "abort"), |_: &str, _: &RoleConfig| {
            Ok(Box::new(Stuck) as Box<dyn Agent>)
        })
        .await
        .unwrap();

        let started = Instant::now();
        let summary = sup.shutdown().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(summary.aborted, vec!["Stuck"]);
        // the port is released even though the agent never stopped
        TcpListener::bind(("127.0.0.1", feed)).unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_fails_before_binding() {
        let [port] = free_ports();
        let agents = json!({"Oracle": {"publisher": port}});
        let err = Supervisor::start(config(agents, 1000, "abort")).await.err().unwrap();
        assert!(err.to_string().contains("unknown kind 'Oracle'"));
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_aborts_by_default() {
        let squatter = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = squatter.local_addr().unwrap().port();
        let [other] = free_ports();
        let agents = json!({
            "MarketDataAgent": {"publisher": taken, "params": {"tickers": ["SPY"]}},
            "LoggingAgent": {"reply": other},
        });
        let err = Supervisor::start(config(agents, 1000, "abort")).await.err().unwrap();
        assert!(err.to_string().contains("endpoint provisioning failed"));
        // the agent that did bind was torn down again
        TcpListener::bind(("127.0.0.1", other)).unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_can_exclude_the_agent() {
        let squatter = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = squatter.local_addr().unwrap().port();
        let [status] = free_ports();
        let agents = json!({
            "MarketDataAgent": {"publisher": taken, "params": {"tickers": ["SPY"]}},
            "LoggingAgent": {"reply": status},
        });
        let sup = Supervisor::start(config(agents, 1000, "exclude")).await.unwrap();
        let names: Vec<&str> = sup.agents().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["LoggingAgent"]);
        assert!(sup.registry().endpoint("MarketDataAgent", Role::Publish).is_none());
        assert!(sup.registry().endpoint("LoggingAgent", Role::Reply).is_some());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn successive_starts_reuse_ports() {
        let [feed] = free_ports();
        for _ in 0..2 {
            let sup = Supervisor::start(config(feed_and_logger(feed), 1000, "abort")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let summary = sup.shutdown().await;
            assert_eq!(summary.stopped.len(), 2);
        }
    }

    #[tokio::test]
    async fn pipeline_runs_end_to_end() {
        let [md, sentiment, strategy, risk, exec, status] = free_ports();
        let agents = json!({
            "MarketDataAgent": {
                "publisher": md,
                "params": {
                    "tickers": ["SPY"],
                    "interval_ms": 20,
                    "headlines": [
                        {"ticker": "SPY", "text": "SPY rallies on strong earnings"},
                        {"text": "markets slump on weak outlook"},
                    ],
                },
            },
            "SentimentAgent": {"subscriber": {"connect": md, "topic": "NEWS"}, "publisher": sentiment},
            "StrategyAgent": {
                "subscriber": [md, sentiment, exec],
                "publisher": strategy,
                "params": {"window": 2, "threshold": 0.0},
            },
            "RiskAgent": {"subscriber": [strategy, exec], "publisher": risk},
            "ExecutionAgent": {"subscriber": risk, "publisher": exec},
            "LoggingAgent": {"subscriber": [md, sentiment, strategy, risk, exec], "reply": status},
            "Operator": {"kind": "poller", "request": status},
        });

        let latest = Arc::new(StdMutex::new(None));
        let poller_state = latest.clone();
        let factory = move |name: &str, cfg: &RoleConfig| {
            if cfg.kind_or(name) == "poller" {
                Ok(Box::new(StatusPoller { latest: poller_state.clone() }) as Box<dyn Agent>)
            } else {
                create_agent(name, cfg)
            }
        };
        let sup = Supervisor::start_with(config(agents, 1000, "abort"), factory).await.unwrap();

        let expected = ["TICK", "NEWS", "SENTIMENT", "TRADE", "APPROVED", "FEEDBACK"];
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen_all = false;
        while Instant::now() < deadline {
            if let Some(report) = latest.lock().unwrap().clone() {
                if expected.iter().all(|t| report.by_topic.contains_key(*t)) {
                    seen_all = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let summary = sup.shutdown().await;
        assert!(seen_all, "last status: {:?}", latest.lock().unwrap());
        assert_eq!(summary.stopped.len(), 7);
    }
}
