//! Request socket: connects to one reply endpoint.
//!
//! Requests are queued while disconnected and written once the connection
//! is up. Every request carries a fresh correlation id; replies to anything
//! but the latest request are discarded.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mesh_core::Envelope;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CONNECT_TIMEOUT, FrameKind, INBOX_CAPACITY, INITIAL_BACKOFF, MAX_BACKOFF, backoff_sleep,
    encode_frame, read_frame, shutdown_requested, stop_task,
};

/// Requests queued while the reply side is unreachable.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    QueueFull,
    Closed,
}

pub struct ReqSocket {
    label: String,
    target: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<(u64, Envelope)>>,
    next_corr: AtomicU64,
    awaiting: AtomicU64,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReqSocket {
    /// Start the connection task. The error, if any, is from the first
    /// attempt; the task keeps retrying.
    pub async fn connect(label: &str, target: SocketAddr) -> (Self, Option<std::io::Error>) {
        let (outbound, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOX_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (first, err) = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(s)) => (Some(s), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(_) => (None, Some(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))),
        };

        let task = tokio::spawn(request_loop(
            label.to_string(),
            target,
            first,
            out_rx,
            in_tx,
            ready_tx,
            shutdown_rx,
        ));

        let sock = Self {
            label: label.to_string(),
            target,
            outbound,
            inbox: tokio::sync::Mutex::new(in_rx),
            next_corr: AtomicU64::new(0),
            awaiting: AtomicU64::new(0),
            ready: ready_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        };
        (sock, err)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Queue a request. Returns its correlation id.
    pub fn send(&self, body: &[u8]) -> Result<u64, RequestError> {
        let corr = self.next_corr.fetch_add(1, Ordering::Relaxed) + 1;
        self.awaiting.store(corr, Ordering::Release);
        match self.outbound.try_send(encode_frame(FrameKind::Request, corr, body)) {
            Ok(()) => Ok(corr),
            Err(TrySendError::Full(_)) => Err(RequestError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(RequestError::Closed),
        }
    }

    /// Next reply to the latest request.
    pub async fn recv(&self) -> Option<Envelope> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let (corr, env) = inbox.recv().await?;
            if corr == self.awaiting.load(Ordering::Acquire) {
                return Some(env);
            }
            debug!("[{}] discarding stale reply #{corr}", self.label);
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.clone();
        matches!(tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await, Ok(Ok(_)))
    }

    pub async fn close(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        stop_task(&self.label, &self.shutdown, task).await;
    }
}

async fn request_loop(
    label: String,
    target: SocketAddr,
    mut first: Option<TcpStream>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbox: mpsc::Sender<(u64, Envelope)>,
    ready: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let stream = match first.take() {
            Some(s) => s,
            None => {
                let attempt = tokio::select! {
                    r = TcpStream::connect(target) => r,
                    _ = shutdown_requested(&mut shutdown_rx) => return,
                };
                match attempt {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("[{label}] connect to {target} failed: {e}, retry in {backoff:?}");
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
        let (mut rd, mut wr) = stream.into_split();

        // Nothing is written until the reply side has greeted us.
        let greeting = tokio::select! {
            f = read_frame(&mut rd) => f,
            _ = shutdown_requested(&mut shutdown_rx) => return,
        };
        match greeting {
            Ok(Some(f)) if f.kind == FrameKind::Hello => {}
            other => {
                debug!("[{label}] no greeting from {target}: {other:?}");
                if !backoff_sleep(backoff, &mut shutdown_rx).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        }
        backoff = INITIAL_BACKOFF;
        let _ = ready.send(true);
        info!("[{label}] connected to {target}");

        let reader = async {
            loop {
                match read_frame(&mut rd).await {
                    Ok(Some(f)) if f.kind == FrameKind::Reply => match Envelope::decode(&f.body) {
                        Ok(env) => {
                            if let Err(TrySendError::Closed(_)) = inbox.try_send((f.corr, env)) {
                                return true;
                            }
                        }
                        Err(e) => warn!("[{label}] undecodable reply from {target}: {e}"),
                    },
                    Ok(Some(f)) => debug!("[{label}] ignoring {:?} frame from {target}", f.kind),
                    Ok(None) => return false,
                    Err(e) => {
                        warn!("[{label}] read from {target} failed: {e}");
                        return false;
                    }
                }
            }
        };

        let writer = async {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = wr.write_all(&frame).await {
                    warn!("[{label}] request to {target} lost: {e}");
                    return false;
                }
            }
            true
        };

        let stop = tokio::select! {
            s = reader => s,
            s = writer => s,
            _ = shutdown_requested(&mut shutdown_rx) => true,
        };

        let _ = ready.send(false);
        if stop {
            return;
        }
        info!("[{label}] connection to {target} lost, reconnecting");
        if !backoff_sleep(backoff, &mut shutdown_rx).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
