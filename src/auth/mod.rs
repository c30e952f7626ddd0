pub mod error_handler;
pub mod oauth;
pub mod refresh;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ErrorCategory, ErrorCode, PolychatError, PolychatResult};

/// Authentication phases. REFRESHING blocks dependent operations until the
/// refresh settles; ERROR fails them until an operator intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthPhase {
    Ready,
    Refreshing,
    Error,
}

struct Inner {
    phase: AuthPhase,
    queue: VecDeque<oneshot::Sender<PolychatResult<()>>>,
}

/// Serializes token-dependent operations around refreshes.
///
/// At most one refresh is in flight at a time; operations arriving during a
/// refresh are queued and released FIFO once it settles.
pub struct AuthStateMachine {
    inner: Mutex<Inner>,
}

impl AuthStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: AuthPhase::Ready,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn phase(&self) -> AuthPhase {
        match self.inner.lock() {
            Ok(inner) => inner.phase,
            Err(poisoned) => poisoned.into_inner().phase,
        }
    }

    /// Run `operation` once authentication is not mid-refresh. In READY it
    /// runs immediately; in REFRESHING it waits its turn; in ERROR it fails.
    pub async fn execute_when_ready<T, F, Fut>(&self, operation: F) -> PolychatResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PolychatResult<T>>,
    {
        let waiter = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(poisoned) => poisoned.into_inner(),
            };
            match inner.phase {
                AuthPhase::Ready => None,
                AuthPhase::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    inner.queue.push_back(tx);
                    debug!(queued = inner.queue.len(), "Operation queued behind refresh");
                    Some(rx)
                }
                AuthPhase::Error => {
                    return Err(PolychatError::new(ErrorCode::AuthStateError)
                        .message("Authentication is in error state")
                        .category(ErrorCategory::Authentication)
                        .build());
                }
            }
        };

        if let Some(rx) = waiter {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(PolychatError::new(ErrorCode::AuthStateError)
                        .message("Refresh coordinator dropped before release")
                        .category(ErrorCategory::Internal)
                        .build());
                }
            }
        }
        operation().await
    }

    /// Claim the refresh slot. Returns false if a refresh is already in
    /// flight or the machine is in ERROR.
    pub fn start_refresh(&self) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.phase == AuthPhase::Ready {
            inner.phase = AuthPhase::Refreshing;
            info!("Token refresh started");
            true
        } else {
            debug!(phase = ?inner.phase, "Refresh slot unavailable");
            false
        }
    }

    /// Settle the in-flight refresh. On success queued operations are
    /// released in order; on failure they are all rejected and the machine
    /// enters ERROR.
    pub fn finish_refresh(&self, ok: bool) {
        let (queue, released) = {
            let mut inner = match self.inner.lock() {
                Ok(i) => i,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.phase = if ok { AuthPhase::Ready } else { AuthPhase::Error };
            let queue = std::mem::take(&mut inner.queue);
            (queue, ok)
        };

        let count = queue.len();
        for tx in queue {
            let result = if released {
                Ok(())
            } else {
                Err(PolychatError::new(ErrorCode::AuthRefreshFailed)
                    .message("Authentication refresh failed")
                    .category(ErrorCategory::Authentication)
                    .build())
            };
            // Receiver may have given up waiting; that's fine
            let _ = tx.send(result);
        }
        if released {
            info!(released = count, "Token refresh finished, queue drained");
        } else {
            warn!(rejected = count, "Token refresh failed, entering error state");
        }
    }

    /// Operator reset out of ERROR back to READY
    pub fn reset(&self) {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.phase = AuthPhase::Ready;
        info!("Auth state machine reset");
    }
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ready_runs_immediately() {
        let machine = AuthStateMachine::new();
        let result = machine.execute_when_ready(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(machine.phase(), AuthPhase::Ready);
    }

    #[tokio::test]
    async fn refreshing_queues_until_release() {
        let machine = Arc::new(AuthStateMachine::new());
        assert!(machine.start_refresh());
        assert_eq!(machine.phase(), AuthPhase::Refreshing);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let machine = Arc::clone(&machine);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                machine
                    .execute_when_ready(|| async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    })
                    .await
            }));
            // Give each task time to enqueue so FIFO order is deterministic
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        machine.finish_refresh(true);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(machine.phase(), AuthPhase::Ready);
    }

    #[tokio::test]
    async fn failed_refresh_rejects_queue_and_enters_error() {
        let machine = Arc::new(AuthStateMachine::new());
        assert!(machine.start_refresh());

        let machine_clone = Arc::clone(&machine);
        let handle = tokio::spawn(async move {
            machine_clone
                .execute_when_ready(|| async { Ok(()) })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        machine.finish_refresh(false);
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.message, "Authentication refresh failed");
        assert_eq!(machine.phase(), AuthPhase::Error);

        // Further operations fail fast until reset
        let err = machine
            .execute_when_ready(|| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.message, "Authentication is in error state");

        machine.reset();
        assert!(machine.execute_when_ready(|| async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn only_one_refresh_in_flight() {
        let machine = AuthStateMachine::new();
        assert!(machine.start_refresh());
        assert!(!machine.start_refresh());
        machine.finish_refresh(true);
        assert!(machine.start_refresh());
        machine.finish_refresh(true);
    }

    #[tokio::test]
    async fn operations_do_not_run_before_release() {
        let machine = Arc::new(AuthStateMachine::new());
        assert!(machine.start_refresh());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let machine_clone = Arc::clone(&machine);
        let handle = tokio::spawn(async move {
            machine_clone
                .execute_when_ready(|| async move {
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        machine.finish_refresh(true);
        handle.await.unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
