//! Endpoint roles.

use serde::{Deserialize, Serialize};

/// The role an endpoint plays for its owning agent.
///
/// `Publish` and `Reply` bind a local port; `Subscribe` and `Request`
/// connect to someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publish,
    Subscribe,
    Request,
    Reply,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Publish, Role::Subscribe, Role::Request, Role::Reply];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Request => "request",
            Self::Reply => "reply",
        }
    }

    /// True for roles that own a listening socket.
    pub fn binds(self) -> bool {
        matches!(self, Self::Publish | Self::Reply)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
