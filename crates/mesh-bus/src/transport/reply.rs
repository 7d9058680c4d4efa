//! Reply socket: binds, receives requests, answers each one on the
//! connection it arrived on.
//!
//! Strict alternation: `recv` remembers where the last request came from and
//! `send` consumes that route. Sending with no pending request fails.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use mesh_core::Envelope;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{FrameKind, INBOX_CAPACITY, encode_frame, read_frame, shutdown_requested, stop_task};

/// Frames queued per requester connection.
const ROUTE_CAPACITY: usize = 64;

/// Where a reply goes: the requester's connection plus its correlation id.
#[derive(Debug, Clone)]
struct Route {
    peer: SocketAddr,
    corr: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

struct Incoming {
    envelope: Envelope,
    route: Route,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplyError {
    NoPendingRequest,
    RequesterGone(SocketAddr),
}

pub struct RepSocket {
    label: String,
    addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
    pending: Mutex<Option<Route>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RepSocket {
    pub async fn bind(label: &str, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(label.to_string(), listener, tx, shutdown_rx));

        Ok(Self {
            label: label.to_string(),
            addr,
            inbox: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(None),
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next request. Its route replaces any request left unanswered.
    pub async fn recv(&self) -> Option<Envelope> {
        let Incoming { envelope, route } = self.inbox.lock().await.recv().await?;
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(stale) = pending.replace(route) {
                debug!("[{}] request from {} left unanswered", self.label, stale.peer);
            }
        }
        Some(envelope)
    }

    /// Answer the most recent request.
    pub fn send(&self, body: &[u8]) -> Result<(), ReplyError> {
        let route = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.take())
            .ok_or(ReplyError::NoPendingRequest)?;
        let frame = encode_frame(FrameKind::Reply, route.corr, body);
        match route.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(ReplyError::RequesterGone(route.peer)),
            Err(TrySendError::Full(_)) => {
                warn!("[{}] reply queue to {} full, reply dropped", self.label, route.peer);
                Err(ReplyError::RequesterGone(route.peer))
            }
        }
    }

    pub async fn close(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        stop_task(&self.label, &self.shutdown, task).await;
    }
}

async fn accept_loop(
    label: String,
    listener: TcpListener,
    inbox: mpsc::Sender<Incoming>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    conns.spawn(serve_requester(
                        label.clone(),
                        stream,
                        peer,
                        inbox.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    warn!("[{label}] accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }

    drop(listener);
    conns.shutdown().await;
    debug!("[{label}] reply socket stopped");
}

async fn serve_requester(
    label: String,
    stream: TcpStream,
    peer: SocketAddr,
    inbox: mpsc::Sender<Incoming>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(ROUTE_CAPACITY);

    if wr.write_all(&encode_frame(FrameKind::Hello, 0, &[])).await.is_err() {
        return;
    }
    info!("[{label}] requester connected: {peer}");

    let reader = async {
        loop {
            let frame = match read_frame(&mut rd).await {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    warn!("[{label}] read from {peer} failed: {e}");
                    break;
                }
            };
            if frame.kind != FrameKind::Request {
                debug!("[{label}] ignoring {:?} frame from {peer}", frame.kind);
                continue;
            }
            let envelope = match Envelope::decode(&frame.body) {
                Ok(env) => env,
                Err(e) => {
                    warn!("[{label}] undecodable request from {peer}: {e}");
                    continue;
                }
            };
            let route = Route { peer, corr: frame.corr, tx: out_tx.clone() };
            match inbox.try_send(Incoming { envelope, route }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("[{label}] inbox full, request from {peer} dropped"),
                Err(TrySendError::Closed(_)) => break,
            }
        }
    };

    let writer = async {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = wr.write_all(&frame).await {
                debug!("[{label}] write to {peer} failed: {e}");
                break;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
        _ = shutdown_requested(&mut shutdown_rx) => {}
    }
    info!("[{label}] requester disconnected: {peer}");
}
