//! Wire protocol types for host-worker communication.
//!
//! One WebSocket text message carries exactly one frame:
//! - **Requests** (host → worker): a flat envelope naming namespace + function
//! - **Responses** (worker → host): correlated to a request by id
//! - **Events** (worker → host): unsolicited push, tagged with a category

use serde::{Deserialize, Serialize};

/// Correlation id for one outstanding call.
///
/// UUID v4 so ids never repeat while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request sent to the worker. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: CallId,
    pub namespace: String,
    pub function: String,
    pub args: Vec<serde_json::Value>,
}

impl RequestEnvelope {
    pub fn new(
        id: CallId,
        namespace: impl Into<String>,
        function: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            namespace: namespace.into(),
            function: function.into(),
            args,
        }
    }
}

/// Response status string the worker uses for success. Anything else is a failure.
pub const RESULT_SUCCESS: &str = "resultSuccess";

/// Frames received from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "lowercase")]
pub enum InboundFrame {
    Response(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Kept as a raw string: foreign or malformed ids must still decode so they
    /// can be logged and dropped by the correlator.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Failure,
}

impl ResponseFrame {
    pub fn status(&self) -> ResponseStatus {
        if self.kind == RESULT_SUCCESS {
            ResponseStatus::Success
        } else {
            ResponseStatus::Failure
        }
    }

    /// Consume the frame into the caller-facing outcome.
    ///
    /// Failures without an error text get a generic reason naming the status.
    pub fn into_outcome(self) -> Result<serde_json::Value, String> {
        match self.status() {
            ResponseStatus::Success => Ok(self.result),
            ResponseStatus::Failure => Err(self
                .error
                .unwrap_or_else(|| format!("worker returned {}", self.kind))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub category: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_call_id() -> CallId {
        CallId::parse("6f2c1a9e-3b7d-4c2a-9e51-0d8f4b6a7c13").unwrap()
    }

    #[test]
    fn request_serializes_flat() {
        let req = RequestEnvelope::new(test_call_id(), "nodes", "getNode", vec![json!("42")]);
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": "6f2c1a9e-3b7d-4c2a-9e51-0d8f4b6a7c13",
          "namespace": "nodes",
          "function": "getNode",
          "args": [
            "42"
          ]
        }
        "#);
    }

    #[test]
    fn response_success_deserializes() {
        let raw = json!({
            "type": "response",
            "message": {"id": "abc", "type": "resultSuccess", "result": ["1", "2"]}
        });
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        match frame {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.id, "abc");
                assert_eq!(resp.status(), ResponseStatus::Success);
                assert_eq!(resp.into_outcome(), Ok(json!(["1", "2"])));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_failure_carries_error_text() {
        let raw = json!({
            "type": "response",
            "message": {"id": "abc", "type": "resultError", "error": "node not found"}
        });
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        let InboundFrame::Response(resp) = frame else {
            panic!("expected response");
        };
        assert_eq!(resp.status(), ResponseStatus::Failure);
        assert_eq!(resp.into_outcome(), Err("node not found".to_string()));
    }

    #[test]
    fn response_failure_without_error_names_status() {
        let resp = ResponseFrame {
            id: "abc".to_string(),
            kind: "resultTimeout".to_string(),
            result: serde_json::Value::Null,
            error: None,
        };
        assert_eq!(
            resp.into_outcome(),
            Err("worker returned resultTimeout".to_string())
        );
    }

    #[test]
    fn event_deserializes_with_missing_data() {
        let raw = json!({"type": "event", "message": {"type": "ready"}});
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Event(EventFrame {
                category: "ready".to_string(),
                data: serde_json::Value::Null,
            })
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let raw = json!({"type": "telemetry", "message": {}});
        assert!(serde_json::from_value::<InboundFrame>(raw).is_err());
    }

    #[test]
    fn call_ids_are_unique() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
        assert_eq!(CallId::parse(&a.to_string()).unwrap(), a);
    }
}
