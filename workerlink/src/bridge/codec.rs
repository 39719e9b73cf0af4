//! Frame codec for the worker WebSocket.
//!
//! One text message is one JSON frame. Binary messages are not part of the
//! protocol and are rejected here so the transport can log and skip them.

use tokio_tungstenite::tungstenite::Message;

use super::protocol::{InboundFrame, RequestEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported {0} frame")]
    Unsupported(&'static str),
    #[error("{category} event without payload")]
    MissingPayload { category: String },
}

pub fn encode_request(request: &RequestEnvelope) -> Result<Message, ProtocolError> {
    let json = serde_json::to_string(request)?;
    tracing::trace!(call_id = %request.id, json_size_bytes = json.len(), "Encoding request");
    if json.len() > 100_000 {
        tracing::info!(
            call_id = %request.id,
            json_size_kb = json.len() / 1024,
            "Large request being encoded"
        );
    }
    Ok(Message::Text(json))
}

pub fn decode_text(text: &str) -> Result<InboundFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode one WebSocket message.
///
/// Returns `Ok(None)` for control messages (ping/pong/close) that carry no frame.
pub fn decode_message(message: &Message) -> Result<Option<InboundFrame>, ProtocolError> {
    match message {
        Message::Text(text) => decode_text(text).map(Some),
        Message::Binary(_) => Err(ProtocolError::Unsupported("binary")),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CallId, EventFrame};

    #[test]
    fn encode_produces_text_message() {
        let req = RequestEnvelope::new(CallId::new(), "nodes", "listNodes", vec![]);
        let msg = encode_request(&req).unwrap();
        let Message::Text(text) = msg else {
            panic!("expected text message");
        };
        let parsed: RequestEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn decode_event_message() {
        let msg = Message::Text(
            r#"{"type":"event","message":{"type":"attributeChanged","data":{"value":1}}}"#
                .to_string(),
        );
        let frame = decode_message(&msg).unwrap().unwrap();
        assert_eq!(
            frame,
            InboundFrame::Event(EventFrame {
                category: "attributeChanged".to_string(),
                data: serde_json::json!({"value": 1}),
            })
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_text("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_binary() {
        let err = decode_message(&Message::Binary(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported("binary")));
    }

    #[test]
    fn control_messages_carry_no_frame() {
        assert!(decode_message(&Message::Ping(vec![])).unwrap().is_none());
        assert!(decode_message(&Message::Close(None)).unwrap().is_none());
    }
}
