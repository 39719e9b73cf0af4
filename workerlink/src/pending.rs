//! Pending-call table and the caller-side result handle.
//!
//! Every registered call is removed from the table exactly once: by its
//! response, by a timeout, or by a bulk failure when the connection goes away.
//! Removal is what grants the right to resolve, so no call resolves twice.

use std::future::IntoFuture;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::bridge::protocol::CallId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to send request: {0}")]
    Send(String),
}

pub type CallResult = Result<serde_json::Value, CallError>;

pub struct PendingCall {
    created_at: Instant,
    label: String,
    tx: oneshot::Sender<CallResult>,
}

impl PendingCall {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn resolve(self, id: CallId, result: CallResult) {
        tracing::debug!(
            %id,
            call = %self.label,
            ok = result.is_ok(),
            elapsed_ms = self.age().as_millis() as u64,
            "Call resolved"
        );
        if self.tx.send(result).is_err() {
            tracing::trace!(%id, "Call handle dropped before resolution");
        }
    }
}

/// Concurrent map from correlation id to unresolved call.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<CallId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new call under a fresh id.
    ///
    /// Ids are only ever taken from a vacant entry, so an outstanding id is never reused.
    pub fn register(
        self: &Arc<Self>,
        label: impl Into<String>,
        timeout: Duration,
    ) -> (CallId, CallHandle) {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let mut call = Some(PendingCall {
            created_at: Instant::now(),
            label,
            tx,
        });

        loop {
            let id = CallId::new();
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                if let Some(call) = call.take() {
                    slot.insert(call);
                }
                let handle = CallHandle {
                    id: Some(id),
                    rx,
                    timeout,
                    table: Arc::downgrade(self),
                };
                return (id, handle);
            }
            tracing::warn!(%id, "Correlation id collision, regenerating");
        }
    }

    /// Resolve one call. Returns false if the id was not pending.
    pub fn resolve(&self, id: &CallId, result: CallResult) -> bool {
        match self.calls.remove(id) {
            Some((id, call)) => {
                call.resolve(id, result);
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &CallError) -> usize {
        // Collect first: removing while holding an iterator shard guard would deadlock.
        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.resolve(&id, Err(error.clone())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Caller's handle to an eventual call result.
///
/// Awaiting applies the call timeout; on expiry the pending entry is removed so a
/// late response is dropped instead of resolving a second time.
pub struct CallHandle {
    id: Option<CallId>,
    rx: oneshot::Receiver<CallResult>,
    timeout: Duration,
    table: Weak<PendingCalls>,
}

impl CallHandle {
    /// A handle that is already failed, never registered in any table.
    pub fn failed(error: CallError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            id: None,
            rx,
            timeout: Duration::ZERO,
            table: Weak::new(),
        }
    }

    pub fn id(&self) -> Option<CallId> {
        self.id
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn wait(self) -> CallResult {
        let Self {
            id,
            mut rx,
            timeout,
            table,
        } = self;

        let Some(id) = id else {
            return rx
                .await
                .unwrap_or_else(|_| Err(CallError::ConnectionLost("call dropped".to_string())));
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::ConnectionLost("call dropped".to_string())),
            Err(_) => {
                let removed = table
                    .upgrade()
                    .map(|t| t.resolve(&id, Err(CallError::Timeout(timeout))))
                    .unwrap_or(false);
                if removed {
                    tracing::warn!(%id, ?timeout, "Call timed out");
                }
                // Whoever removed the entry resolved the channel.
                rx.await
                    .unwrap_or_else(|_| Err(CallError::ConnectionLost("call dropped".to_string())))
            }
        }
    }
}

impl IntoFuture for CallHandle {
    type Output = CallResult;
    type IntoFuture = BoxFuture<'static, CallResult>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn resolve_delivers_result_once() {
        let table = PendingCalls::new();
        let (id, handle) = table.register("nodes.listNodes", LONG);
        assert!(table.contains(&id));

        assert!(table.resolve(&id, Ok(json!(["1"]))));
        assert!(!table.resolve(&id, Ok(json!(["2"]))));
        assert!(table.is_empty());

        assert_eq!(handle.await, Ok(json!(["1"])));
    }

    #[tokio::test]
    async fn unknown_id_does_not_touch_table() {
        let table = PendingCalls::new();
        let (_id, _handle) = table.register("nodes.getNode", LONG);

        assert!(!table.resolve(&CallId::new(), Ok(json!(null))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_drains_every_call() {
        let table = PendingCalls::new();
        let handles: Vec<_> = (0..16)
            .map(|i| table.register(format!("call-{i}"), LONG).1)
            .collect();

        let lost = CallError::ConnectionLost("socket closed".to_string());
        assert_eq!(table.fail_all(&lost), 16);
        assert!(table.is_empty());

        for handle in handles {
            assert_eq!(handle.await, Err(lost.clone()));
        }
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let table = PendingCalls::new();
        let (id, handle) = table.register("slow", Duration::from_millis(20));

        let result = handle.await;
        assert_eq!(result, Err(CallError::Timeout(Duration::from_millis(20))));
        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, Ok(json!("late"))));
    }

    #[tokio::test]
    async fn failed_handle_resolves_immediately() {
        let handle = CallHandle::failed(CallError::NotConnected);
        assert!(handle.id().is_none());
        let err = handle.await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[tokio::test]
    async fn concurrent_register_and_fail_all() {
        let table = PendingCalls::new();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                let (_, handle) = table.register(format!("call-{i}"), LONG);
                handle.await
            }));
        }

        while table.len() < 8 {
            tokio::task::yield_now().await;
        }
        table.fail_all(&CallError::ConnectionLost("down".to_string()));

        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(CallError::ConnectionLost(_))
            ));
        }
    }
}
