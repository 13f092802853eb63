use std::fmt;

/// Opaque handle for one connected client session within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Write access decided by the (external) authorization layer before the
/// session reaches the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn can_write(self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

impl std::str::FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Permission::ReadOnly),
            "readwrite" => Ok(Permission::ReadWrite),
            other => Err(UnknownPermission(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown permission `{0}`, expected `readonly` or `readwrite`")]
pub struct UnknownPermission(pub String);

/// Returned by [`SessionSocket::send`] when the frame could not be written.
/// The room logs and ignores it; the close handler arrives separately.
#[derive(Debug, Clone, Copy)]
pub struct SendError;

/// The duplex connection handle the room holds per session.
///
/// This is the entire surface the core needs from the WebSocket (or other
/// transport) wrapping, which stays external.
pub trait SessionSocket {
    fn send(&mut self, frame: &str) -> Result<(), SendError>;
    fn close(&mut self);
}

pub(crate) struct Session {
    pub client_id: String,
    pub permission: Permission,
    pub socket: Box<dyn SessionSocket>,
}
