use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CloseError;

/// Close hook for one registry member.
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn close(&self) -> Result<(), CloseError>;
}

/// Handle a running session task registers with the registry.
///
/// `close` asks the task to stop and waits for it to report that cleanup
/// has finished.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    shutdown: CancellationToken,
    finished: CancellationToken,
    close_timeout: Duration,
}

impl SessionHandle {
    pub fn new(id: String, close_timeout: Duration) -> Self {
        Self {
            id,
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            close_timeout,
        }
    }

    /// Cancelled when the session has been asked to shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn mark_finished(&self) {
        self.finished.cancel();
    }
}

#[async_trait]
impl SessionControl for SessionHandle {
    async fn close(&self) -> Result<(), CloseError> {
        self.shutdown.cancel();
        tokio::time::timeout(self.close_timeout, self.finished.cancelled())
            .await
            .map_err(|_| CloseError::Timeout {
                id: self.id.clone(),
                timeout: self.close_timeout,
            })
    }
}

struct Entry {
    control: Arc<dyn SessionControl>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CloseReport {
    pub closed: usize,
    pub failures: Vec<CloseError>,
}

/// Process-wide set of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Entry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add(&self, id: &str, control: Arc<dyn SessionControl>) {
        self.sessions.insert(
            id.to_string(),
            Entry {
                control,
                created_at: Utc::now(),
            },
        );
        debug!(session_id = id, live = self.sessions.len(), "session registered");
    }

    /// Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) {
        if let Some((_, entry)) = self.sessions.remove(id) {
            let age = Utc::now() - entry.created_at;
            debug!(
                session_id = id,
                age_ms = age.num_milliseconds(),
                live = self.sessions.len(),
                "session removed"
            );
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every live session once and drops it from the registry. Individual
    /// failures are collected in the report, never propagated.
    pub async fn close_all(&self) -> CloseReport {
        // Snapshot first; no map guard is held across the awaits below.
        let snapshot: Vec<(String, Arc<dyn SessionControl>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().control.clone()))
            .collect();
        info!(sessions = snapshot.len(), "closing all sessions");

        let results =
            futures::future::join_all(snapshot.iter().map(|(_, control)| control.close())).await;

        let mut report = CloseReport::default();
        for ((id, _), result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "session did not close cleanly");
                    report.failures.push(e);
                }
            }
        }
        // Sessions registered while closing were never asked to close.
        for (id, _) in &snapshot {
            self.sessions.remove(id);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SessionControl for Counting {
        async fn close(&self) -> Result<(), CloseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CloseError::Timeout {
                    id: "x".into(),
                    timeout: Duration::ZERO,
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn close_all_closes_each_once_despite_failures() {
        let registry = SessionRegistry::new();
        let members: Vec<Arc<Counting>> = (0..5)
            .map(|i| {
                Arc::new(Counting {
                    calls: AtomicUsize::new(0),
                    fail: i != 0,
                })
            })
            .collect();
        for (i, m) in members.iter().enumerate() {
            registry.add(&format!("s{i}"), m.clone());
        }

        let report = registry.close_all().await;

        assert!(registry.is_empty());
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 4);
        assert!(members.iter().all(|m| m.calls.load(Ordering::SeqCst) == 1));
    }

    struct Slow;

    #[async_trait]
    impl SessionControl for Slow {
        async fn close(&self) -> Result<(), CloseError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_added_during_close_all_stays_registered() {
        let registry = SessionRegistry::new_shared();
        registry.add("early", Arc::new(Slow));

        let closing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.close_all().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.add("late", Arc::new(Slow));

        let report = closing.await.unwrap();
        assert_eq!(report.closed, 1);
        assert!(!registry.contains("early"));
        assert!(registry.contains("late"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.add("a", Arc::new(SessionHandle::new("a".into(), Duration::ZERO)));
        registry.remove("a");
        registry.remove("a");
        registry.remove("never-added");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn handle_close_waits_for_finish() {
        let handle = SessionHandle::new("a".into(), Duration::from_secs(5));
        let token = handle.shutdown_token();
        let task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                handle.mark_finished();
            })
        };
        handle.close().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handle_close_times_out_when_task_is_stuck() {
        let handle = SessionHandle::new("stuck".into(), Duration::from_secs(5));
        let err = handle.close().await.unwrap_err();
        assert!(matches!(err, CloseError::Timeout { ref id, .. } if id == "stuck"));
    }
}
