//! Process-wide shutdown coordination

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Exit code after the upstream stream closed
pub const EXIT_UPSTREAM_CLOSED: i32 = 0;

/// Exit code after the listener or upstream link failed
pub const EXIT_FAILURE: i32 = 1;

/// Exit code for invalid startup configuration
pub const EXIT_CONFIG: i32 = 2;

#[derive(Debug)]
struct Trigger {
    code: i32,
    reason: String,
}

/// Cloneable handle that ends the process's serving phase.
///
/// The first trigger fixes the exit code; later triggers only log.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    trigger: Arc<OnceLock<Trigger>>,
}

impl Shutdown {
    /// Create an untriggered handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown with `code`. Returns whether this call won.
    pub fn trigger(&self, code: i32, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let won = self
            .trigger
            .set(Trigger {
                code,
                reason: reason.clone(),
            })
            .is_ok();

        if won {
            info!("Shutting down ({}), exit code {}", reason, code);
        } else {
            info!("Shutdown already in progress, ignoring: {}", reason);
        }

        self.token.cancel();
        won
    }

    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Exit code of the winning trigger
    pub fn exit_code(&self) -> Option<i32> {
        self.trigger.get().map(|t| t.code)
    }

    /// Reason given by the winning trigger
    pub fn reason(&self) -> Option<&str> {
        self.trigger.get().map(|t| t.reason.as_str())
    }

    /// Token cancelled once shutdown is requested
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Wait until shutdown is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Wait for shutdown and return the exit code
    pub async fn wait(&self) -> i32 {
        self.cancelled().await;
        self.exit_code().unwrap_or(EXIT_UPSTREAM_CLOSED)
    }
}
