//! Fan-out publisher socket.
//!
//! Binds a listener; every accepted connection gets its own writer task fed
//! from a shared broadcast channel. A frame published while no subscriber
//! is connected is dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{FrameKind, INBOX_CAPACITY, encode_frame, shutdown_requested, stop_task};

pub struct PubSocket {
    label: String,
    addr: SocketAddr,
    tx: broadcast::Sender<Arc<[u8]>>,
    subscribers: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSocket {
    /// Bind `addr` and start accepting subscribers.
    pub async fn bind(label: &str, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(INBOX_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscribers = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(accept_loop(
            label.to_string(),
            listener,
            tx.clone(),
            subscribers.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            label: label.to_string(),
            addr,
            tx,
            subscribers,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connected subscribers that completed the greeting.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Queue one envelope body for every connected subscriber.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, body: &[u8]) -> usize {
        let frame: Arc<[u8]> = encode_frame(FrameKind::Publish, 0, body).into();
        match self.tx.send(frame) {
            Ok(n) => n,
            Err(_) => {
                debug!("[{}] no subscribers on {}, message dropped", self.label, self.addr);
                0
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
    tx: broadcast::Sender<Arc<[u8]>>,
    subscribers: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    // Subscribe before greeting so nothing published after
                    // the peer sees Hello can be missed.
                    let rx = tx.subscribe();
                    conns.spawn(serve_subscriber(
                        label.clone(),
                        stream,
                        peer,
                        rx,
                        subscribers.clone(),
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
    debug!("[{label}] publisher stopped");
}

struct Connected(Arc<AtomicUsize>);

impl Drop for Connected {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn serve_subscriber(
    label: String,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<[u8]>>,
    subscribers: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = stream.write_all(&encode_frame(FrameKind::Hello, 0, &[])).await {
        debug!("[{label}] greeting {peer} failed: {e}");
        return;
    }
    subscribers.fetch_add(1, Ordering::Relaxed);
    let _connected = Connected(subscribers);
    info!("[{label}] subscriber connected: {peer}");

    let (mut rd, mut wr) = stream.split();
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => break,
            msg = rx.recv() => match msg {
                Ok(frame) => {
                    if let Err(e) = wr.write_all(&frame).await {
                        debug!("[{label}] write to {peer} failed: {e}");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("[{label}] subscriber {peer} lagging, {n} message(s) dropped");
                }
                Err(RecvError::Closed) => break,
            },
            // Subscribers never send; a read only tells us the peer went away.
            read = rd.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    info!("[{label}] subscriber disconnected: {peer}");
}
