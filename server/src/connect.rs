//! Connection URL parameters for the reference server.
//!
//! The HTTP/WebSocket wrapping stays external; this parses the query string
//! it hands over. Authorization happens elsewhere, the token is carried but
//! never inspected.

/// WebSocket close code to use when a connection request is rejected for a
/// missing client id.
pub const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;

pub const DEFAULT_ROOM_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub client_id: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection request is missing the clientId parameter")]
    MissingClientId,
}

impl ConnectParams {
    /// Parses `roomId`, `clientId` and `token` out of a raw query string.
    /// Unknown parameters are ignored.
    pub fn from_query(query: &str) -> Result<Self, ConnectError> {
        let mut room_id = None;
        let mut client_id = None;
        let mut token = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "roomId" => room_id = Some(value.into_owned()),
                "clientId" => client_id = Some(value.into_owned()),
                "token" => token = Some(value.into_owned()),
                _ => {}
            }
        }
        let client_id = match client_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(ConnectError::MissingClientId),
        };
        Ok(Self {
            room_id: room_id.unwrap_or_else(|| DEFAULT_ROOM_ID.to_string()),
            client_id,
            token,
        })
    }
}
