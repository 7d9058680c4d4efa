//! The agent loop.
//!
//! ```text
//! Initializing ──► open endpoints, Agent::initialize
//!      │ ok
//!      ▼
//!   Running ────► receive(poll timeout) ─► handle ─► tick ─┐
//!      │  ▲                                                │
//!      │  └────────────────────────────────────────────────┘
//!      │ running == false / fabric closed
//!      ▼
//!   Stopping ──► Stopped
//! ```
//!
//! `handle` and `tick` each get at most one poll timeout, so a stop request
//! is observed within two polls. Failures (errors, panics and overruns
//! alike) are logged and the loop continues with the next envelope.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use futures_util::FutureExt;
use mesh_bus::Inbound;
use mesh_core::{MeshError, Role};
use tracing::{debug, error, info, warn};

use crate::{Agent, AgentContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Initializing = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Shared view of one agent's `running` flag and lifecycle state.
///
/// The supervisor keeps one per agent and clears the flag on shutdown; the
/// agent loop observes it within one poll timeout.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    name: Arc<str>,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl AgentHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(true)),
            state: Arc::new(AtomicU8::new(AgentState::Initializing as u8)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the agent loop to stop after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// How an agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The loop observed `running == false` or the fabric closed.
    Stopped { handled: u64, failed: u64 },
    /// Endpoint creation or `Agent::initialize` failed.
    InitFailed,
}

/// Drive `agent` until its handle is stopped.
pub async fn run_agent(mut agent: Box<dyn Agent>, ctx: AgentContext, handle: AgentHandle) -> AgentExit {
    let name = ctx.name().to_string();
    handle.set_state(AgentState::Initializing);

    let init = async {
        let endpoints = ctx.open_endpoints().await?;
        debug!(agent = %name, "{} endpoint(s) open", endpoints.len());
        agent.initialize(&ctx).await
    };
    if !guarded(&name, "initialize", init).await {
        handle.set_state(AgentState::Stopped);
        return AgentExit::InitFailed;
    }

    handle.set_state(AgentState::Running);
    info!(agent = %name, "running");

    let poll = ctx.poll_timeout();
    let inbound = ctx.has_inbound();
    let mut handled = 0u64;
    let mut failed = 0u64;

    while handle.is_running() {
        if inbound {
            match ctx.receive(poll).await {
                Ok(Some(Inbound { role, envelope })) => {
                    handled += 1;
                    let work = async {
                        if role == Role::Reply {
                            guarded(&name, "handle_request", agent.handle_request(&ctx, envelope)).await
                        } else {
                            guarded(&name, "handle", agent.handle(&ctx, envelope)).await
                        }
                    };
                    match tokio::time::timeout(poll, work).await {
                        Ok(true) => {}
                        Ok(false) => failed += 1,
                        Err(_) => {
                            warn!(agent = %name, role = %role, "handle exceeded {poll:?}, abandoned");
                            failed += 1;
                        }
                    }
                }
                Ok(None) => {}
                Err(MeshError::Closed) => break,
                Err(e) => {
                    warn!(agent = %name, "receive failed: {e}");
                    tokio::time::sleep(poll).await;
                }
            }
        } else {
            tokio::time::sleep(poll).await;
        }

        if !handle.is_running() {
            break;
        }
        if tokio::time::timeout(poll, guarded(&name, "tick", agent.tick(&ctx)))
            .await
            .is_err()
        {
            warn!(agent = %name, "tick exceeded {poll:?}, abandoned");
        }
    }

    handle.set_state(AgentState::Stopping);
    info!(agent = %name, handled, failed, "stopping");
    handle.set_state(AgentState::Stopped);
    AgentExit::Stopped { handled, failed }
}

/// Await `fut`, turning errors and panics into a log line.
async fn guarded<F>(agent: &str, what: &str, fut: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(agent, "{what} failed: {e:#}");
            false
        }
        Err(panic) => {
            error!(agent, "{what} panicked: {}", panic_message(&*panic));
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    use anyhow::bail;
    use async_trait::async_trait;
    use mesh_bus::EndpointRegistry;
    use mesh_core::{Envelope, MeshConfig};
    use serde_json::json;

    use super::*;

    fn free_ports<const N: usize>() -> [u16; N] {
        let listeners: Vec<_> = (0..N)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        std::array::from_fn(|i| listeners[i].local_addr().unwrap().port())
    }

    /// Fails on `"bad"`, panics on `"boom"`, records everything else.
    struct Picky {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Agent for Picky {
        fn name(&self) -> &str {
            "Sink"
        }

        async fn handle(&mut self, _ctx: &AgentContext, env: Envelope) -> anyhow::Result<()> {
            let kind = env.payload["kind"].as_str().unwrap_or_default().to_string();
            match kind.as_str() {
                "bad" => bail!("cannot handle {kind}"),
                "boom" => panic!("handler blew up"),
                _ => {
                    self.seen.lock().unwrap().push(kind);
                    Ok(())
                }
            }
        }
    }

    struct Ticker {
        ticks: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Agent for Ticker {
        fn name(&self) -> &str {
            "Source"
        }

        async fn handle(&mut self, _ctx: &AgentContext, _env: Envelope) -> anyhow::Result<()> {
            Ok(())
        }

        async fn tick(&mut self, _ctx: &AgentContext) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Never finishes handling anything.
    struct Wedged;

    #[async_trait]
    impl Agent for Wedged {
        fn name(&self) -> &str {
            "Sink"
        }

        async fn handle(&mut self, _ctx: &AgentContext, _env: Envelope) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    fn fabric() -> Arc<EndpointRegistry> {
        let [src, sink] = free_ports();
        let cfg = MeshConfig::from_json_str(&format!(
            r#"{{
                "fabric": {{ "poll_timeout_ms": 50 }},
                "agents": {{
                    "Source": {{ "publisher": {src} }},
                    "Sink":   {{ "publisher": {sink}, "subscriber": {src} }}
                }}
            }}"#
        ))
        .unwrap();
        Arc::new(EndpointRegistry::new(cfg.topology, cfg.fabric))
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let reg = fabric();
        reg.provision().await;
        assert!(reg.wait_ready("Sink", Duration::from_secs(3)).await);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handle = AgentHandle::new("Sink");
        let worker = tokio::spawn(run_agent(
            Box::new(Picky { seen: seen.clone() }),
            AgentContext::new("Sink", reg.clone()),
            handle.clone(),
        ));

        for kind in ["first", "bad", "boom", "last"] {
            reg.send("Source", Envelope::new("X", "", json!({ "kind": kind }))).unwrap();
        }

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*seen.lock().unwrap(), ["first", "last"]);
        assert_eq!(handle.state(), AgentState::Running);

        handle.stop();
        let exit = worker.await.unwrap();
        assert_eq!(exit, AgentExit::Stopped { handled: 4, failed: 2 });
        assert_eq!(handle.state(), AgentState::Stopped);
        reg.close_all().await;
    }

    #[tokio::test]
    async fn stop_is_observed_within_one_poll() {
        let reg = fabric();
        reg.provision().await;
        let ticks = Arc::new(AtomicU64::new(0));
        let handle = AgentHandle::new("Source");
        let worker = tokio::spawn(run_agent(
            Box::new(Ticker { ticks: ticks.clone() }),
            AgentContext::new("Source", reg.clone()),
            handle.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ticks.load(Ordering::Relaxed) > 0);

        let started = Instant::now();
        handle.stop();
        let exit = worker.await.unwrap();
        assert!(matches!(exit, AgentExit::Stopped { .. }));
        assert!(started.elapsed() < Duration::from_millis(50 + 200));
        reg.close_all().await;
    }

    #[tokio::test]
    async fn slow_handler_is_abandoned_after_one_poll() {
        let reg = fabric();
        reg.provision().await;
        assert!(reg.wait_ready("Sink", Duration::from_secs(3)).await);

        let handle = AgentHandle::new("Sink");
        let worker = tokio::spawn(run_agent(
            Box::new(Wedged),
            AgentContext::new("Sink", reg.clone()),
            handle.clone(),
        ));
        reg.send("Source", Envelope::new("X", "", json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.stop();
        let exit = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert_eq!(exit, AgentExit::Stopped { handled: 1, failed: 1 });
        assert!(started.elapsed() < Duration::from_millis(2 * 50 + 200), "took {:?}", started.elapsed());
        reg.close_all().await;
    }

    #[tokio::test]
    async fn closed_fabric_ends_the_loop() {
        let reg = fabric();
        reg.provision().await;
        let handle = AgentHandle::new("Sink");
        let worker = tokio::spawn(run_agent(
            Box::new(Picky { seen: Default::default() }),
            AgentContext::new("Sink", reg.clone()),
            handle.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        reg.close_all().await;
        let exit = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert!(matches!(exit, AgentExit::Stopped { .. }));
    }

    #[tokio::test]
    async fn unknown_agent_fails_initialization() {
        let reg = fabric();
        let handle = AgentHandle::new("Ghost");
        let exit = run_agent(
            Box::new(Picky { seen: Default::default() }),
            AgentContext::new("Ghost", reg.clone()),
            handle.clone(),
        )
        .await;
        assert_eq!(exit, AgentExit::InitFailed);
        assert_eq!(handle.state(), AgentState::Stopped);
        reg.close_all().await;
    }
}
