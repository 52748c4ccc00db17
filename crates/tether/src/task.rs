//! Supervised task helpers

use crate::{Result, TetherError};
use std::future::Future;
use tracing::error;

/// Run `fut` on its own task, turning a panic into a [`TetherError::Transport`].
///
/// A panic inside one connection's work is logged and contained here so the
/// caller can tear that connection down and keep serving the rest.
pub async fn supervise<F, T>(name: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!("Task {} panicked", name);
            Err(TetherError::Transport(format!("{} panicked", name)))
        }
        Err(e) => Err(TetherError::Transport(format!("{} was cancelled: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_passes_through() {
        let ok = supervise("ok", async { Ok::<_, TetherError>(7) }).await.unwrap();
        assert_eq!(ok, 7);

        let err = supervise("err", async { Err::<(), _>(TetherError::Routing("x".to_string())) }).await;
        assert!(matches!(err, Err(TetherError::Routing(_))));
    }

    #[tokio::test]
    async fn test_panic_becomes_transport_error() {
        let result = supervise("boom", async {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), TetherError>(())
        })
        .await;

        assert!(matches!(result, Err(TetherError::Transport(_))));
    }
}
