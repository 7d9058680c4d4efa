//! A bound or connected socket owned by one agent in one role.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use mesh_core::{Envelope, MeshError, MeshResult, Role};

use crate::transport::publisher::PubSocket;
use crate::transport::reply::{RepSocket, ReplyError};
use crate::transport::request::{ReqSocket, RequestError};
use crate::transport::subscriber::SubSocket;

/// Descriptive view of an endpoint, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub agent: String,
    pub role: Role,
    /// Bound address for publish/reply, connect targets otherwise.
    pub addrs: Vec<SocketAddr>,
    /// Subscriber prefix filter; empty for every other role.
    pub topic: String,
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent, self.role)?;
        for addr in &self.addrs {
            write!(f, " {addr}")?;
        }
        if self.role == Role::Subscribe {
            write!(f, " filter={:?}", self.topic)?;
        }
        Ok(())
    }
}

pub(crate) enum Socket {
    Publish(PubSocket),
    Subscribe(SubSocket),
    Reply(RepSocket),
    Request(ReqSocket),
}

pub(crate) struct Endpoint {
    info: EndpointInfo,
    socket: Socket,
}

impl Endpoint {
    pub(crate) fn publisher(agent: &str, sock: PubSocket) -> Self {
        let info = EndpointInfo {
            agent: agent.to_string(),
            role: Role::Publish,
            addrs: vec![sock.local_addr()],
            topic: String::new(),
        };
        Self { info, socket: Socket::Publish(sock) }
    }

    pub(crate) fn subscriber(agent: &str, sock: SubSocket) -> Self {
        let info = EndpointInfo {
            agent: agent.to_string(),
            role: Role::Subscribe,
            addrs: sock.targets().to_vec(),
            topic: sock.topic().to_string(),
        };
        Self { info, socket: Socket::Subscribe(sock) }
    }

    pub(crate) fn reply(agent: &str, sock: RepSocket) -> Self {
        let info = EndpointInfo {
            agent: agent.to_string(),
            role: Role::Reply,
            addrs: vec![sock.local_addr()],
            topic: String::new(),
        };
        Self { info, socket: Socket::Reply(sock) }
    }

    pub(crate) fn request(agent: &str, sock: ReqSocket) -> Self {
        let info = EndpointInfo {
            agent: agent.to_string(),
            role: Role::Request,
            addrs: vec![sock.target()],
            topic: String::new(),
        };
        Self { info, socket: Socket::Request(sock) }
    }

    pub(crate) fn info(&self) -> &EndpointInfo {
        &self.info
    }

    /// Transmit one encoded envelope.
    pub(crate) fn send(&self, body: &[u8]) -> MeshResult<()> {
        let agent = &self.info.agent;
        match &self.socket {
            Socket::Publish(s) => {
                s.publish(body);
                Ok(())
            }
            Socket::Reply(s) => s.send(body).map_err(|e| match e {
                ReplyError::NoPendingRequest => {
                    MeshError::transport(agent, "reply endpoint has no pending request")
                }
                ReplyError::RequesterGone(peer) => {
                    MeshError::transport(agent, format!("requester {peer} disconnected before the reply"))
                }
            }),
            Socket::Request(s) => s.send(body).map(|_| ()).map_err(|e| match e {
                RequestError::QueueFull => MeshError::transport(agent, "request queue full"),
                RequestError::Closed => MeshError::transport(agent, "request connection closed"),
            }),
            Socket::Subscribe(_) => Err(MeshError::transport(agent, "cannot send on a subscribe endpoint")),
        }
    }

    /// Next inbound envelope. Never resolves on a publish endpoint.
    pub(crate) async fn recv(&self) -> Option<Envelope> {
        match &self.socket {
            Socket::Subscribe(s) => s.recv().await,
            Socket::Reply(s) => s.recv().await,
            Socket::Request(s) => s.recv().await,
            Socket::Publish(_) => std::future::pending().await,
        }
    }

    /// Whether the connecting side of this endpoint is established.
    /// Listening endpoints are always ready.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> bool {
        match &self.socket {
            Socket::Subscribe(s) => s.wait_ready(timeout).await,
            Socket::Request(s) => s.wait_ready(timeout).await,
            Socket::Publish(_) | Socket::Reply(_) => true,
        }
    }

    pub(crate) async fn close(&self) {
        match &self.socket {
            Socket::Publish(s) => s.close().await,
            Socket::Subscribe(s) => s.close().await,
            Socket::Reply(s) => s.close().await,
            Socket::Request(s) => s.close().await,
        }
    }
}
