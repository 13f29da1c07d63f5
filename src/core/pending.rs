use log::{debug, info};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, timeout};
use uuid::Uuid;

use crate::network::dht::NodeId;
use crate::utils::{P2PError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Join,
    Lookup,
    Command,
    FileTransfer,
}

/// An outbound operation in flight.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    pub target: Option<NodeId>,
    pub started: Instant,
    pub deadline: Option<Instant>,
}

/// Registry of outbound operations plus the node-wide shutdown signal.
pub struct PendingRequests {
    requests: Mutex<HashMap<Uuid, PendingRequest>>,
    shutdown: watch::Sender<bool>,
}

/// Resolves once the shutdown flag is set.
pub(crate) async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel also counts as stopping
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

struct PendingGuard<'a> {
    owner: &'a PendingRequests,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.id);
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            requests: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingRequest>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flip the shutdown signal. Every running request fails with
    /// `ShuttingDown`; returns how many were in flight.
    pub fn begin_shutdown(&self) -> usize {
        self.shutdown.send_replace(true);
        let in_flight = self.lock().len();
        info!("Shutdown signalled, {} requests in flight", in_flight);
        in_flight
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.lock().values().cloned().collect()
    }

    /// Run `work` as a tracked request. It is registered for its whole life,
    /// bounded by `deadline` when given, and cut short by shutdown. Nothing is
    /// polled once shutdown has begun.
    pub async fn run<F, T>(
        &self,
        kind: RequestKind,
        target: Option<NodeId>,
        deadline: Option<Duration>,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(P2PError::ShuttingDown);
        }

        let started = Instant::now();
        let request = PendingRequest {
            id: Uuid::new_v4(),
            kind,
            target,
            started,
            deadline: deadline.map(|d| started + d),
        };
        let id = request.id;
        self.lock().insert(id, request);
        let _guard = PendingGuard { owner: self, id };
        debug!("Pending {:?} request {} registered", kind, id);

        let bounded = async {
            match deadline {
                Some(limit) => timeout(limit, work).await.map_err(|_| {
                    P2PError::Timeout(format!("{:?} request exceeded {:?}", kind, limit))
                })?,
                None => work.await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = stopping(&mut shutdown) => Err(P2PError::ShuttingDown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_completed_request_is_removed() {
        let pending = PendingRequests::new();
        let value = pending
            .run(RequestKind::Command, None, Some(Duration::from_secs(1)), async {
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_request_visible_while_running() {
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let target = NodeId::from_string("target");

        let runner = pending.clone();
        let task = tokio::spawn(async move {
            runner
                .run(RequestKind::Lookup, Some(target), None, async {
                    rx.await.map_err(|_| P2PError::ConnectionClosed)
                })
                .await
        });

        while pending.is_empty() {
            tokio::task::yield_now().await;
        }
        let snapshot = pending.snapshot();
        assert_eq!(snapshot[0].kind, RequestKind::Lookup);
        assert_eq!(snapshot[0].target, Some(target));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let pending = PendingRequests::new();
        let err = pending
            .run(
                RequestKind::Command,
                None,
                Some(Duration::from_millis(10)),
                std::future::pending::<Result<()>>(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, P2PError::Timeout(_)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_requests() {
        let pending = Arc::new(PendingRequests::new());
        let runner = pending.clone();
        let task = tokio::spawn(async move {
            runner
                .run(
                    RequestKind::FileTransfer,
                    None,
                    None,
                    std::future::pending::<Result<()>>(),
                )
                .await
        });

        while pending.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(pending.begin_shutdown(), 1);

        assert!(matches!(task.await.unwrap(), Err(P2PError::ShuttingDown)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_after_shutdown_work_never_runs() {
        let pending = PendingRequests::new();
        pending.begin_shutdown();

        let touched = AtomicBool::new(false);
        let err = pending
            .run(RequestKind::Command, None, None, async {
                touched.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, P2PError::ShuttingDown));
        assert!(!touched.load(Ordering::SeqCst));
    }
}
