//! Request/response correlation for one session.
//!
//! A `Correlator` lives exactly as long as one transport connection. Calls are
//! registered in its pending table before the request is written, responses
//! resolve them by id, and closing the correlator drains whatever is left.
//! Because each session has its own table, a response arriving on a new
//! connection can never resolve a call made on an old one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::bridge::codec::encode_request;
use crate::bridge::protocol::{CallId, RequestEnvelope, ResponseFrame};
use crate::bridge::transport::{FrameWriter, SendAck};
use crate::pending::{CallError, CallHandle, PendingCalls};

pub struct Correlator {
    pending: Arc<PendingCalls>,
    writer: FrameWriter,
    runtime: Handle,
    call_timeout: Duration,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl Correlator {
    /// Must be created inside a tokio runtime; the runtime is kept for send-ack watchers.
    pub fn new(writer: FrameWriter, call_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            pending: PendingCalls::new(),
            writer,
            runtime: Handle::current(),
            call_timeout,
            send_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Issue a call and return its handle without waiting on the network.
    pub fn call(
        &self,
        namespace: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> CallHandle {
        if self.is_closed() {
            return CallHandle::failed(CallError::ConnectionLost("session closed".to_string()));
        }

        let label = format!("{namespace}.{function}");
        let (id, handle) = self.pending.register(label, self.call_timeout);

        // close() may have drained the table between the check above and register().
        if self.is_closed() {
            self.pending.resolve(
                &id,
                Err(CallError::ConnectionLost("session closed".to_string())),
            );
            return handle;
        }

        let request = RequestEnvelope::new(id, namespace, function, args);
        let message = match encode_request(&request) {
            Ok(message) => message,
            Err(e) => {
                self.pending.resolve(&id, Err(CallError::Send(e.to_string())));
                return handle;
            }
        };

        let ack = match self.writer.send(message) {
            Ok(ack) => ack,
            Err(e) => {
                self.pending
                    .resolve(&id, Err(CallError::ConnectionLost(e.to_string())));
                return handle;
            }
        };

        tracing::debug!(%id, namespace, function, "Request queued");
        self.watch_ack(id, ack);
        handle
    }

    fn watch_ack(&self, id: CallId, ack: SendAck) {
        let pending = Arc::clone(&self.pending);
        let send_timeout = self.send_timeout;
        self.runtime.spawn(async move {
            match tokio::time::timeout(send_timeout, ack).await {
                Ok(Ok(Ok(()))) => tracing::trace!(%id, "Request written"),
                Ok(Ok(Err(reason))) => {
                    tracing::warn!(%id, error = %reason, "Failed to write request");
                    pending.resolve(&id, Err(CallError::Send(reason)));
                }
                // Writer went away; the session close drains the call.
                Ok(Err(_)) => tracing::debug!(%id, "Writer dropped before acknowledging request"),
                Err(_) => {
                    tracing::warn!(%id, timeout = ?send_timeout, "Request not written within send timeout");
                }
            }
        });
    }

    /// Route one response frame. Returns true if it resolved a pending call.
    ///
    /// Unknown, stale or malformed ids are logged and dropped.
    pub fn handle_response(&self, response: ResponseFrame) -> bool {
        let id = match CallId::parse(&response.id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(raw_id = %response.id, error = %e, "Response with unparseable id");
                return false;
            }
        };

        let result = response.into_outcome().map_err(CallError::Remote);
        if self.pending.resolve(&id, result) {
            true
        } else {
            tracing::debug!(%id, "Response for unknown call dropped");
            false
        }
    }

    /// Fail every outstanding call with `ConnectionLost(reason)` and refuse new ones.
    ///
    /// Returns the number of calls failed. Safe to call repeatedly.
    pub fn close(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let failed = self
            .pending
            .fail_all(&CallError::ConnectionLost(reason.to_string()));
        if failed > 0 {
            tracing::info!(failed, %reason, "Failed pending calls on disconnect");
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls still awaiting a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::Outbound;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    const LONG: Duration = Duration::from_secs(5);

    fn correlator() -> (Correlator, mpsc::UnboundedReceiver<Outbound>) {
        let (writer, rx) = FrameWriter::channel();
        (Correlator::new(writer, LONG, LONG), rx)
    }

    /// Pull the next request off the writer queue, acknowledging the write.
    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> RequestEnvelope {
        match rx.recv().await {
            Some(Outbound::Frame { message, ack }) => {
                let _ = ack.send(Ok(()));
                let Message::Text(text) = message else {
                    panic!("expected text frame");
                };
                serde_json::from_str(&text).unwrap()
            }
            Some(Outbound::Close) => panic!("unexpected close"),
            None => panic!("writer channel closed"),
        }
    }

    fn success(id: CallId, result: serde_json::Value) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            kind: "resultSuccess".to_string(),
            result,
            error: None,
        }
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (correlator, mut rx) = correlator();
        let handle = correlator.call("nodes", "listNodes", vec![]);

        let request = next_request(&mut rx).await;
        assert_eq!(request.namespace, "nodes");
        assert_eq!(request.function, "listNodes");
        assert_eq!(Some(request.id), handle.id());

        assert!(correlator.handle_response(success(request.id, json!(["1", "2"]))));
        assert_eq!(handle.await, Ok(json!(["1", "2"])));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn remote_failure_reaches_only_that_call() {
        let (correlator, mut rx) = correlator();
        let failing = correlator.call("nodes", "getNode", vec![json!("9")]);
        let ok = correlator.call("nodes", "getNode", vec![json!("1")]);

        let first = next_request(&mut rx).await;
        let second = next_request(&mut rx).await;

        correlator.handle_response(ResponseFrame {
            id: first.id.to_string(),
            kind: "resultError".to_string(),
            result: serde_json::Value::Null,
            error: Some("node not found".to_string()),
        });
        correlator.handle_response(success(second.id, json!({"id": "1"})));

        assert_eq!(
            failing.await,
            Err(CallError::Remote("node not found".to_string()))
        );
        assert_eq!(ok.await, Ok(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_dropped() {
        let (correlator, mut rx) = correlator();
        let _handle = correlator.call("nodes", "listNodes", vec![]);
        next_request(&mut rx).await;

        assert!(!correlator.handle_response(success(CallId::new(), json!(null))));
        let mut garbage = success(CallId::new(), json!(null));
        garbage.id = "not-a-uuid".to_string();
        assert!(!correlator.handle_response(garbage));
        assert_eq!(correlator.pending(), 1);
    }

    #[tokio::test]
    async fn response_then_disconnect_resolves_both() {
        let (correlator, mut rx) = correlator();
        let a = correlator.call("nodes", "a", vec![]);
        let b = correlator.call("nodes", "b", vec![]);
        let req_a = next_request(&mut rx).await;
        next_request(&mut rx).await;

        correlator.handle_response(success(req_a.id, json!("A")));
        assert_eq!(correlator.close("socket closed"), 1);
        assert_eq!(correlator.pending(), 0);

        assert_eq!(a.await, Ok(json!("A")));
        let err = b.await.unwrap_err();
        assert_eq!(err.to_string(), "connection lost: socket closed");
    }

    #[tokio::test]
    async fn closed_correlator_rejects_new_calls() {
        let (correlator, mut rx) = correlator();
        correlator.close("gone");
        correlator.close("gone");

        let handle = correlator.call("nodes", "listNodes", vec![]);
        assert!(matches!(handle.await, Err(CallError::ConnectionLost(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_error_fails_call() {
        let (correlator, mut rx) = correlator();
        let handle = correlator.call("nodes", "listNodes", vec![]);

        match rx.recv().await {
            Some(Outbound::Frame { ack, .. }) => {
                let _ = ack.send(Err("broken pipe".to_string()));
            }
            _ => panic!("expected frame"),
        }
        assert_eq!(
            handle.await,
            Err(CallError::Send("broken pipe".to_string()))
        );
    }

    #[tokio::test]
    async fn slow_write_ack_leaves_call_pending() {
        let (writer, mut rx) = FrameWriter::channel();
        let correlator = Correlator::new(writer, LONG, Duration::from_millis(100));
        let handle = correlator.call("nodes", "listNodes", vec![]);

        let (request, ack) = match rx.recv().await {
            Some(Outbound::Frame { message, ack }) => {
                let Message::Text(text) = message else {
                    panic!("expected text frame");
                };
                (serde_json::from_str::<RequestEnvelope>(&text).unwrap(), ack)
            }
            _ => panic!("expected frame"),
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(correlator.pending(), 1);

        let _ = ack.send(Ok(()));
        assert!(correlator.handle_response(success(request.id, json!("late"))));
        assert_eq!(handle.await, Ok(json!("late")));
    }

    #[tokio::test]
    async fn dropped_writer_fails_call_immediately() {
        let (correlator, rx) = correlator();
        drop(rx);
        let handle = correlator.call("nodes", "listNodes", vec![]);
        assert!(matches!(handle.await, Err(CallError::ConnectionLost(_))));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn many_calls_all_resolve_on_close() {
        let (correlator, _rx) = correlator();
        let handles: Vec<_> = (0..32)
            .map(|i| correlator.call("nodes", &format!("f{i}"), vec![json!(i)]))
            .collect();
        assert_eq!(correlator.pending(), 32);

        correlator.close("worker exited");
        for handle in handles {
            assert!(matches!(handle.await, Err(CallError::ConnectionLost(_))));
        }
    }
}
