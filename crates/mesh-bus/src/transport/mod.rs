//! TCP transport underneath the endpoint registry.
//!
//! Every socket speaks the same framing:
//!
//! ```text
//! ┌──────────────┬────────────┬────────────────┬──────────────────────┐
//! │ len          │ kind       │ corr           │ body                 │
//! │ u32 LE       │ u8         │ u64 LE         │ UTF-8 JSON envelope  │
//! └──────────────┴────────────┴────────────────┴──────────────────────┘
//! ```
//!
//! `len` counts everything after itself. `corr` pairs requests with replies
//! and is zero elsewhere. A listening side greets each accepted connection
//! with a `Hello` frame once it is ready to deliver, so a connecting side can
//! tell "connected" from "TCP handshake done".

pub mod publisher;
pub mod reply;
pub mod request;
pub mod subscriber;

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Maximum envelope body size (1 MiB).
pub const MAX_FRAME_BODY: usize = 1024 * 1024;

/// kind + corr.
const HEADER_LEN: usize = 1 + 8;

/// First reconnect delay; doubles up to [`MAX_BACKOFF`].
pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Initial connect attempt made while the endpoint is being created.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// How long `close` waits for a socket task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded inbox per inbound endpoint.
pub(crate) const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0,
    Publish = 1,
    Request = 2,
    Reply = 3,
}

impl FrameKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Hello),
            1 => Some(Self::Publish),
            2 => Some(Self::Request),
            3 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub corr: u64,
    pub body: Vec<u8>,
}

/// Encode a frame ready for `write_all`.
///
/// Callers check the body size against [`MAX_FRAME_BODY`] before encoding.
pub fn encode_frame(kind: FrameKind, corr: u64, body: &[u8]) -> Vec<u8> {
    let len = (HEADER_LEN + body.len()) as u32;
    let mut buf = Vec::with_capacity(4 + HEADER_LEN + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&corr.to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let len = match reader.read_u32_le().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if !(HEADER_LEN..=HEADER_LEN + MAX_FRAME_BODY).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let kind = FrameKind::from_u8(buf[0]).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown frame kind {}", buf[0]))
    })?;
    let mut corr = [0u8; 8];
    corr.copy_from_slice(&buf[1..HEADER_LEN]);
    let body = buf.split_off(HEADER_LEN);

    Ok(Some(Frame {
        kind,
        corr: u64::from_le_bytes(corr),
        body,
    }))
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns `false` on shutdown.
pub(crate) async fn backoff_sleep(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_requested(rx) => false,
    }
}

/// Signal a socket task to stop and wait for it, aborting after a bound.
pub(crate) async fn stop_task(label: &str, shutdown: &watch::Sender<bool>, task: Option<JoinHandle<()>>) {
    let _ = shutdown.send(true);
    let Some(mut task) = task else { return };
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
        debug!("[{label}] socket task did not stop in time, aborting");
        task.abort();
        let _ = task.await;
    }
}
