use std::net::SocketAddr;
use std::sync::Arc;

/// Unique identifier for a server session.
pub type SessionId = u64;

/// The server session a shell channel belongs to.
///
/// Implemented by the transport layer; shells only read from it.
pub trait ServerSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Authenticated user name.
    fn username(&self) -> &str;

    /// Address of the connected client, if the transport has one.
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Capability for shells that want the owning session before they start.
pub trait SessionAware {
    fn set_session(&mut self, session: Arc<dyn ServerSession>);
}

/// Plain session description for hosts that have nothing richer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: String,
    pub remote_address: Option<SocketAddr>,
}

impl ServerSession for SessionInfo {
    fn id(&self) -> SessionId {
        self.id
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }
}
