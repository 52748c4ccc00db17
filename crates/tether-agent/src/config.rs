//! Command line and validated server configuration

use crate::logging::{LogFormat, LogLevel};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether::context::{RpcContext, JWT_TOKEN_VAR};
use tether::{ConnectionConfig, TetherError};

/// Environment variable overriding the socket path
pub const SOCKET_PATH_VAR: &str = "TETHER_SOCKET";

/// Socket file name under the agent's home directory
pub const DEFAULT_SOCKET_NAME: &str = "tether-remote.sock";

/// Agent directory under `$HOME`
pub const AGENT_HOME_DIR: &str = ".tether";

/// Command line of the `tether-agent` binary
#[derive(Parser, Debug)]
#[command(name = "tether-agent", version, about = "Remote connection server")]
pub struct Args {
    /// Relay local socket clients over stdio instead of serving stdio alone.
    #[arg(long)]
    pub router: bool,

    /// Unix socket for local clients (router mode).
    #[arg(long, value_name = "PATH", env = SOCKET_PATH_VAR)]
    pub socket: Option<PathBuf>,

    /// Time a new client has to authenticate.
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub auth_timeout_ms: u64,

    /// Seconds between status reports sent upstream; 0 disables them.
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub status_interval_secs: u64,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Agent token; normally supplied through the environment.
    #[arg(long, env = JWT_TOKEN_VAR, hide = true, hide_env_values = true)]
    pub jwt: Option<String>,
}

/// How the agent serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Serve stdio only
    Normal,
    /// Also accept local clients on a Unix socket
    Router {
        /// Socket path
        socket_path: PathBuf,
    },
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Serving mode
    pub mode: RunMode,
    /// Agent token
    pub jwt_token: String,
    /// Identity read from the token
    pub context: RpcContext,
    /// Settings applied to every accepted connection
    pub connection: ConnectionConfig,
    /// Status report period, if enabled
    pub status_interval: Option<Duration>,
}

impl ServerConfig {
    /// Validate parsed arguments
    pub fn from_args(args: &Args) -> Result<Self, TetherError> {
        let jwt_token = args
            .jwt
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| TetherError::Config(format!("no token in {}", JWT_TOKEN_VAR)))?;

        let context = RpcContext::from_token(&jwt_token)
            .map_err(|e| TetherError::Config(format!("invalid token in {}: {}", JWT_TOKEN_VAR, e)))?;

        if args.auth_timeout_ms == 0 {
            return Err(TetherError::Config("auth timeout must be positive".to_string()));
        }

        let mode = if args.router {
            let socket_path = match &args.socket {
                Some(path) => path.clone(),
                None => default_socket_path()?,
            };
            RunMode::Router { socket_path }
        } else {
            RunMode::Normal
        };

        Ok(Self {
            mode,
            jwt_token,
            context,
            connection: ConnectionConfig {
                auth_timeout: Duration::from_millis(args.auth_timeout_ms),
                ..Default::default()
            },
            status_interval: (args.status_interval_secs > 0)
                .then(|| Duration::from_secs(args.status_interval_secs)),
        })
    }
}

/// Socket path under the user's home directory
pub fn default_socket_path() -> Result<PathBuf, TetherError> {
    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .ok_or_else(|| TetherError::Config("HOME is not set and no socket path was given".to_string()))?;
    Ok(socket_path_in(Path::new(&home)))
}

/// Socket path for the given home directory
pub fn socket_path_in(home: &Path) -> PathBuf {
    home.join(AGENT_HOME_DIR).join(DEFAULT_SOCKET_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn token() -> String {
        let claims = URL_SAFE_NO_PAD.encode(br#"{"ctype":"connserver","conn":"devbox"}"#);
        format!("h.{}.s", claims)
    }

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["tether-agent"];
        argv.extend_from_slice(extra);
        let mut args = Args::try_parse_from(argv).expect("args should parse");
        args.jwt = Some(token());
        args
    }

    #[test]
    fn test_router_mode_with_socket() {
        let args = parse(&["--router", "--socket", "/tmp/t.sock", "--auth-timeout-ms", "250"]);
        let config = ServerConfig::from_args(&args).unwrap();

        assert_eq!(
            config.mode,
            RunMode::Router {
                socket_path: PathBuf::from("/tmp/t.sock")
            }
        );
        assert_eq!(config.connection.auth_timeout, Duration::from_millis(250));
        assert_eq!(config.context.conn.as_deref(), Some("devbox"));
        assert!(config.status_interval.is_none());
    }

    #[test]
    fn test_normal_mode_and_status_interval() {
        let args = parse(&["--status-interval-secs", "30", "--log-format", "json", "--log-level", "debug"]);
        let config = ServerConfig::from_args(&args).unwrap();

        assert_eq!(config.mode, RunMode::Normal);
        assert_eq!(config.status_interval, Some(Duration::from_secs(30)));
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let mut args = parse(&[]);
        args.jwt = None;
        assert!(matches!(ServerConfig::from_args(&args), Err(TetherError::Config(_))));

        args.jwt = Some("  ".to_string());
        assert!(matches!(ServerConfig::from_args(&args), Err(TetherError::Config(_))));
    }

    #[test]
    fn test_malformed_token_is_config_error() {
        let mut args = parse(&[]);
        args.jwt = Some("not-a-jwt".to_string());

        let err = ServerConfig::from_args(&args).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zero_auth_timeout_rejected() {
        let args = parse(&["--auth-timeout-ms", "0"]);
        assert!(matches!(ServerConfig::from_args(&args), Err(TetherError::Config(_))));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let err = Args::try_parse_from(["tether-agent", "--log-format", "xml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_socket_path_layout() {
        let path = socket_path_in(Path::new("/home/dev"));
        assert_eq!(path, PathBuf::from("/home/dev/.tether/tether-remote.sock"));
    }
}
