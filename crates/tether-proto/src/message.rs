//! Envelope and command types

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Command name of the authentication handshake
pub const COMMAND_AUTHENTICATE: &str = "authenticate";
/// Command name a new endpoint uses to announce its route
pub const COMMAND_ROUTE_ANNOUNCE: &str = "routeannounce";
/// Command name withdrawing a previously announced route
pub const COMMAND_ROUTE_UNANNOUNCE: &str = "routeunannounce";
/// Command name delivered when a remote route is torn down
pub const COMMAND_DISPOSE: &str = "dispose";

fn is_false(value: &bool) -> bool {
    !*value
}

/// Unit of transport between routes.
///
/// The router only inspects the routing fields (`command`, `route`, `source`);
/// `data` is carried as an opaque JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name; absent on responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Request id, set when the sender expects a response
    #[serde(rename = "reqid", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// Id of the request this envelope responds to
    #[serde(rename = "resid", default, skip_serializing_if = "Option::is_none")]
    pub res_id: Option<String>,
    /// Request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Destination route id; absent means the local default route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Authentication token of the sending connection
    #[serde(rename = "authtoken", default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Source route id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// More responses follow for the same request
    #[serde(default, skip_serializing_if = "is_false")]
    pub cont: bool,
    /// Cancels an in-flight request
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
    /// Error message for failed requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque command payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Create an envelope carrying a command
    pub fn command(command: Command) -> Self {
        let name = command.name().to_string();
        Self {
            command: Some(name),
            data: command.into_data(),
            ..Default::default()
        }
    }

    /// Create a response to `request`, addressed back to its source
    pub fn response(request: &Envelope, data: Option<Value>) -> Self {
        Self {
            res_id: request.req_id.clone(),
            route: request.source.clone(),
            data,
            ..Default::default()
        }
    }

    /// Create an error response to `request`
    pub fn error_response(request: &Envelope, message: impl Into<String>) -> Self {
        Self {
            res_id: request.req_id.clone(),
            route: request.source.clone(),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach a fresh request id
    pub fn with_new_req_id(mut self) -> Self {
        self.req_id = Some(Uuid::new_v4().to_string());
        self
    }

    /// Set the destination route
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Set the source route
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Whether this envelope starts a new command
    pub fn is_command(&self) -> bool {
        self.command.as_deref().map_or(false, |c| !c.is_empty())
    }

    /// Whether this envelope answers an earlier request
    pub fn is_response(&self) -> bool {
        !self.is_command() && self.res_id.is_some()
    }

    /// View the command and payload as a [`Command`]
    pub fn command_data(&self) -> Result<Option<Command>, ProtocolError> {
        match self.command.as_deref() {
            Some(name) if !name.is_empty() => {
                Command::from_parts(name, self.data.as_ref()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to MessagePack with named fields
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Payload of the dispose command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisposeData {
    /// Route that was torn down
    #[serde(rename = "routeid")]
    pub route_id: String,
}

/// Payload of a successful authenticate response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResult {
    /// Route id assigned to the connection
    #[serde(rename = "routeid")]
    pub route_id: String,
    /// Token the connection presents from now on
    #[serde(rename = "authtoken")]
    pub auth_token: String,
}

/// Commands known at the routing boundary.
///
/// Anything else is kept opaque in [`Command::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Present a token for admission
    Authenticate(String),
    /// Announce the source route to the far side of the upstream link
    RouteAnnounce,
    /// Withdraw an announced route
    RouteUnannounce,
    /// A remote route was torn down
    Dispose(DisposeData),
    /// Any other command with its opaque payload
    Other {
        /// Command name
        command: String,
        /// Opaque payload
        data: Option<Value>,
    },
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &str {
        match self {
            Self::Authenticate(_) => COMMAND_AUTHENTICATE,
            Self::RouteAnnounce => COMMAND_ROUTE_ANNOUNCE,
            Self::RouteUnannounce => COMMAND_ROUTE_UNANNOUNCE,
            Self::Dispose(_) => COMMAND_DISPOSE,
            Self::Other { command, .. } => command,
        }
    }

    /// Build a command from its wire name and payload
    pub fn from_parts(command: &str, data: Option<&Value>) -> Result<Self, ProtocolError> {
        let invalid = |message: String| ProtocolError::InvalidCommandData {
            command: command.to_string(),
            message,
        };

        match command {
            COMMAND_AUTHENTICATE => match data {
                Some(Value::String(token)) => Ok(Self::Authenticate(token.clone())),
                Some(_) => Err(invalid("token is not a string".to_string())),
                None => Err(invalid("missing token".to_string())),
            },
            COMMAND_ROUTE_ANNOUNCE => Ok(Self::RouteAnnounce),
            COMMAND_ROUTE_UNANNOUNCE => Ok(Self::RouteUnannounce),
            COMMAND_DISPOSE => {
                let data = data.cloned().ok_or_else(|| invalid("missing payload".to_string()))?;
                let dispose = serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?;
                Ok(Self::Dispose(dispose))
            }
            other => Ok(Self::Other {
                command: other.to_string(),
                data: data.cloned(),
            }),
        }
    }

    /// Convert into the wire payload
    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Authenticate(token) => Some(Value::String(token)),
            Self::RouteAnnounce | Self::RouteUnannounce => None,
            Self::Dispose(data) => serde_json::to_value(data).ok(),
            Self::Other { data, .. } => data,
        }
    }
}
