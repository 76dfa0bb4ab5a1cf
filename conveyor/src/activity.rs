//! The supervised-activity template every long-running loop follows:
//! `init` once, `process` until told to stop, `close` on every exit path.
//! Errors from `init` or `process` become the pool's shutdown cause.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::FatalError;
use crate::supervisor::ShutdownHandle;

#[async_trait]
pub trait Activity: Send {
    fn name(&self) -> &str;

    async fn init(&mut self) -> Result<(), FatalError> {
        Ok(())
    }

    /// One unit of work. Must return promptly once `stop` fires; blocking
    /// waits inside implementations are bounded and observe the token.
    async fn process(&mut self) -> Result<(), FatalError>;

    async fn close(&mut self);
}

/// Drive an activity until its stop token fires or it errors. `close` runs
/// unconditionally; any error is funneled into the shutdown handle, where
/// the first cause wins.
pub(crate) async fn run_supervised<A: Activity>(
    mut activity: A,
    handle: ShutdownHandle,
    stop: CancellationToken,
) {
    let name = activity.name().to_string();
    match activity.init().await {
        Ok(()) => {
            debug!(activity = %name, "activity started");
            while !stop.is_cancelled() {
                if let Err(err) = activity.process().await {
                    error!(activity = %name, error = %err, "activity failed");
                    handle.fail(err);
                    break;
                }
            }
        }
        Err(err) => {
            error!(activity = %name, error = %err, "activity init failed");
            handle.fail(err);
        }
    }
    activity.close().await;
    debug!(activity = %name, "activity closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Script {
        name: &'static str,
        fail_init: bool,
        fail_after: Option<usize>,
        processed: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Activity for Script {
        fn name(&self) -> &str {
            self.name
        }

        async fn init(&mut self) -> Result<(), FatalError> {
            if self.fail_init {
                return Err(FatalError::InvariantViolation("bad init".to_string()));
            }
            Ok(())
        }

        async fn process(&mut self) -> Result<(), FatalError> {
            let done = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after == Some(done) {
                return Err(FatalError::InvariantViolation("bad process".to_string()));
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_runs_after_external_stop() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = ShutdownHandle::new();
        let stop = CancellationToken::new();
        let script = Script {
            name: "test",
            fail_init: false,
            fail_after: None,
            processed: Arc::new(AtomicUsize::new(0)),
            closed: closed.clone(),
        };

        let runner = tokio::spawn(run_supervised(script, handle.clone(), stop.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        stop.cancel();
        runner.await.unwrap();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!handle.is_shutting_down());
    }

    #[tokio::test]
    async fn process_error_becomes_the_cause_and_close_still_runs() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = ShutdownHandle::new();
        let stop = CancellationToken::new();
        let script = Script {
            name: "test",
            fail_init: false,
            fail_after: Some(3),
            processed: Arc::new(AtomicUsize::new(0)),
            closed: closed.clone(),
        };

        run_supervised(script, handle.clone(), stop).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(handle.is_shutting_down());
        assert!(handle.cause().is_some());
    }

    #[tokio::test]
    async fn init_error_skips_the_loop_but_not_close() {
        let closed = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));
        let handle = ShutdownHandle::new();
        let script = Script {
            name: "test",
            fail_init: true,
            fail_after: None,
            processed: processed.clone(),
            closed: closed.clone(),
        };

        run_supervised(script, handle.clone(), CancellationToken::new()).await;
        assert_eq!(processed.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(handle.is_shutting_down());
    }
}
