//! Connection identity carried in authentication tokens

use crate::{Result, TetherError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment variable holding the agent's own token
pub const JWT_TOKEN_VAR: &str = "TETHER_JWT";

/// Client type of a connection server
pub const CLIENT_TYPE_CONN_SERVER: &str = "connserver";

/// Client type of a block controller
pub const CLIENT_TYPE_BLOCK_CONTROLLER: &str = "blockcontroller";

/// Identity claims read from a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    /// Kind of client the token was issued to
    #[serde(rename = "ctype", default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    /// Block the client belongs to
    #[serde(rename = "blockid", default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Tab the client belongs to
    #[serde(rename = "tabid", default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    /// Remote connection name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
    /// Whether the holder acts as a router
    #[serde(rename = "router", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_router: bool,
}

impl RpcContext {
    /// Read the claims of `token` without verifying its signature
    pub fn from_token(token: &str) -> Result<Self> {
        extract_unverified_rpc_context(token)
    }

    /// Derive the route id this identity is registered under.
    ///
    /// Connection servers route as `conn:<conn>`, block controllers as
    /// `controller:<blockid>`, and untyped clients get a fresh `proc:` id.
    pub fn route_id(&self) -> Result<String> {
        match self.client_type.as_deref() {
            Some(CLIENT_TYPE_CONN_SERVER) => {
                let conn = non_empty(self.conn.as_deref())
                    .ok_or_else(|| TetherError::Auth("connserver token has no conn claim".to_string()))?;
                Ok(make_connection_route_id(conn))
            }
            Some(CLIENT_TYPE_BLOCK_CONTROLLER) => {
                let block_id = non_empty(self.block_id.as_deref())
                    .ok_or_else(|| TetherError::Auth("blockcontroller token has no blockid claim".to_string()))?;
                Ok(make_controller_route_id(block_id))
            }
            None | Some("") => Ok(make_proc_route_id()),
            Some(other) => Err(TetherError::Auth(format!("unsupported client type: {}", other))),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Decode the claims segment of a JWT.
///
/// Only the structure is checked; the controller that minted the token is
/// trusted to have signed it.
pub fn extract_unverified_rpc_context(token: &str) -> Result<RpcContext> {
    if token.is_empty() {
        return Err(TetherError::Auth("empty token".to_string()));
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TetherError::Auth(format!(
            "malformed token: expected 3 segments, got {}",
            parts.len()
        )));
    }

    let claims = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| TetherError::Auth(format!("malformed token claims: {}", e)))?;

    serde_json::from_slice(&claims)
        .map_err(|e| TetherError::Auth(format!("malformed token claims: {}", e)))
}

/// Route id for a connection server
pub fn make_connection_route_id(conn: &str) -> String {
    format!("conn:{}", conn)
}

/// Route id for a block controller
pub fn make_controller_route_id(block_id: &str) -> String {
    format!("controller:{}", block_id)
}

/// Fresh route id for an anonymous client process
pub fn make_proc_route_id() -> String {
    format!("proc:{}", Uuid::new_v4())
}
