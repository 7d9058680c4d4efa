//! Subscriber socket: connects to one or more publishers.
//!
//! Each target gets a connection task that reconnects with exponential
//! backoff. Envelopes whose topic does not start with the filter are
//! discarded before they reach the inbox.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_core::Envelope;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CONNECT_TIMEOUT, FrameKind, INBOX_CAPACITY, INITIAL_BACKOFF, MAX_BACKOFF, backoff_sleep,
    read_frame, shutdown_requested, stop_task,
};

pub struct SubSocket {
    label: String,
    targets: Vec<SocketAddr>,
    topic: String,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    ready: watch::Receiver<usize>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubSocket {
    /// Start connecting to every target.
    ///
    /// One connect attempt per target is made up front; targets that refuse
    /// it are returned so the caller can report them. Their tasks keep
    /// retrying in the background either way.
    pub async fn connect(label: &str, targets: &[SocketAddr], topic: &str) -> (Self, Vec<(SocketAddr, std::io::Error)>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(0usize);
        let ready_tx = Arc::new(ready_tx);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut failed = Vec::new();
        let mut tasks = Vec::with_capacity(targets.len());
        for &addr in targets {
            let first = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    failed.push((addr, e));
                    None
                }
                Err(_) => {
                    failed.push((addr, std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")));
                    None
                }
            };
            tasks.push(tokio::spawn(subscribe_loop(
                label.to_string(),
                addr,
                topic.to_string(),
                first,
                tx.clone(),
                ready_tx.clone(),
                shutdown_rx.clone(),
            )));
        }

        let sock = Self {
            label: label.to_string(),
            targets: targets.to_vec(),
            topic: topic.to_string(),
            inbox: tokio::sync::Mutex::new(rx),
            ready: ready_rx,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        (sock, failed)
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next envelope that passed the filter. `None` once every connection
    /// task has stopped.
    pub async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    /// Wait until every target has greeted us.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let want = self.targets.len();
        let mut ready = self.ready.clone();
        matches!(tokio::time::timeout(timeout, ready.wait_for(|n| *n >= want)).await, Ok(Ok(_)))
    }

    pub async fn close(&self) {
        let tasks: Vec<_> = self.tasks.lock().map(|mut t| t.drain(..).collect()).unwrap_or_default();
        let _ = self.shutdown.send(true);
        for task in tasks {
            stop_task(&self.label, &self.shutdown, Some(task)).await;
        }
    }
}

async fn subscribe_loop(
    label: String,
    addr: SocketAddr,
    topic: String,
    mut first: Option<TcpStream>,
    inbox: mpsc::Sender<Envelope>,
    ready: Arc<watch::Sender<usize>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut stream = match first.take() {
            Some(s) => s,
            None => {
                let attempt = tokio::select! {
                    r = TcpStream::connect(addr) => r,
                    _ = shutdown_requested(&mut shutdown_rx) => return,
                };
                match attempt {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("[{label}] connect to {addr} failed: {e}, retry in {backoff:?}");
                        if !backoff_sleep(backoff, &mut shutdown_rx).await {
                            return;
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let mut greeted = false;
        let stop = loop {
            let frame = tokio::select! {
                f = read_frame(&mut stream) => f,
                _ = shutdown_requested(&mut shutdown_rx) => break true,
            };
            match frame {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Hello if !greeted => {
                        greeted = true;
                        backoff = INITIAL_BACKOFF;
                        ready.send_modify(|n| *n += 1);
                        info!("[{label}] subscribed to {addr} (filter {topic:?})");
                    }
                    FrameKind::Publish => match Envelope::decode(&frame.body) {
                        Ok(env) if env.matches(&topic) => match inbox.try_send(env) {
                            Ok(()) => {}
                            Err(TrySendError::Full(env)) => {
                                warn!("[{label}] inbox full, dropping {} from {addr}", env.topic);
                            }
                            Err(TrySendError::Closed(_)) => break true,
                        },
                        Ok(_) => {}
                        Err(e) => warn!("[{label}] undecodable frame from {addr}: {e}"),
                    },
                    other => debug!("[{label}] ignoring {other:?} frame from {addr}"),
                },
                Ok(None) => {
                    info!("[{label}] publisher {addr} closed the connection");
                    break false;
                }
                Err(e) => {
                    warn!("[{label}] read from {addr} failed: {e}");
                    break false;
                }
            }
        };

        if greeted {
            ready.send_modify(|n| *n = n.saturating_sub(1));
        }
        if stop || !backoff_sleep(backoff, &mut shutdown_rx).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
