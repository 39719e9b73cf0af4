//! Event classification and listener fan-out.
//!
//! Categories are resolved through a fixed table of decode functions; an
//! unknown category is ignored so newer workers can add events freely.
//! Delivery runs on one task per controller fed by an unbounded queue, which
//! keeps slow listeners off the transport's receive path and preserves arrival
//! order, including across reconnects.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::codec::ProtocolError;
use crate::bridge::protocol::EventFrame;
use crate::listener::{AttributeListener, ControllerStateListener, ListenerSet, NodeStateListener};

pub const ATTRIBUTE_CHANGED: &str = "attributeChanged";
pub const NODE_STATE_INFORMATION: &str = "nodeStateInformation";
pub const READY: &str = "ready";

/// A classified worker event.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    AttributeChanged(serde_json::Value),
    NodeState(serde_json::Value),
    Ready,
}

type DecodeFn = fn(serde_json::Value) -> Result<WorkerEvent, ProtocolError>;

fn require_payload(category: &str, data: serde_json::Value) -> Result<serde_json::Value, ProtocolError> {
    if data.is_null() {
        return Err(ProtocolError::MissingPayload {
            category: category.to_string(),
        });
    }
    Ok(data)
}

fn decode_attribute_changed(data: serde_json::Value) -> Result<WorkerEvent, ProtocolError> {
    require_payload(ATTRIBUTE_CHANGED, data).map(WorkerEvent::AttributeChanged)
}

fn decode_node_state(data: serde_json::Value) -> Result<WorkerEvent, ProtocolError> {
    require_payload(NODE_STATE_INFORMATION, data).map(WorkerEvent::NodeState)
}

fn decode_ready(_data: serde_json::Value) -> Result<WorkerEvent, ProtocolError> {
    Ok(WorkerEvent::Ready)
}

const DECODERS: &[(&str, DecodeFn)] = &[
    (ATTRIBUTE_CHANGED, decode_attribute_changed),
    (NODE_STATE_INFORMATION, decode_node_state),
    (READY, decode_ready),
];

/// Classify an event frame. `Ok(None)` means the category is not one we handle.
pub fn classify(frame: EventFrame) -> Result<Option<WorkerEvent>, ProtocolError> {
    let Some((_, decode)) = DECODERS
        .iter()
        .find(|(category, _)| *category == frame.category)
    else {
        return Ok(None);
    };
    decode(frame.data).map(Some)
}

/// Listener registries owned by one controller.
#[derive(Default)]
pub struct EventListeners {
    pub attribute: ListenerSet<dyn AttributeListener>,
    pub node_state: ListenerSet<dyn NodeStateListener>,
    pub controller: ListenerSet<dyn ControllerStateListener>,
}

/// Work item for the dispatch task.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchItem {
    Connected,
    Event(EventFrame),
    Disconnected(String),
}

impl EventListeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify_connected(&self) {
        self.controller.notify("connect", |l| l.on_connect());
    }

    pub fn notify_disconnected(&self, reason: &str) {
        self.controller
            .notify("disconnect", |l| l.on_disconnect(reason));
    }

    pub fn deliver(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::AttributeChanged(data) => {
                tracing::debug!(%data, "attributeChanged event");
                self.attribute
                    .notify(ATTRIBUTE_CHANGED, |l| l.on_attribute_changed(data));
            }
            WorkerEvent::NodeState(data) => {
                tracing::debug!(%data, "nodeStateInformation event");
                self.node_state
                    .notify(NODE_STATE_INFORMATION, |l| l.on_node_state(data));
            }
            WorkerEvent::Ready => {
                tracing::debug!("Worker reported ready");
                self.controller.notify(READY, |l| l.on_ready());
            }
        }
    }

    pub fn dispatch(&self, item: DispatchItem) {
        match item {
            DispatchItem::Connected => self.notify_connected(),
            DispatchItem::Disconnected(reason) => self.notify_disconnected(&reason),
            DispatchItem::Event(frame) => {
                let category = frame.category.clone();
                match classify(frame) {
                    Ok(Some(event)) => self.deliver(&event),
                    Ok(None) => tracing::trace!(%category, "Ignoring unknown event category"),
                    Err(e) => tracing::warn!(%category, error = %e, "Dropping invalid event"),
                }
            }
        }
    }
}

/// Queue handle for a dispatch task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

impl Dispatcher {
    /// Spawn the dispatch task. It exits once every `Dispatcher` clone is dropped
    /// and the queue is drained.
    pub fn spawn(listeners: Arc<EventListeners>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                listeners.dispatch(item);
            }
            tracing::trace!("Dispatcher exiting");
        });
        (Self { tx }, task)
    }

    pub fn enqueue(&self, item: DispatchItem) {
        if self.tx.send(item).is_err() {
            tracing::warn!("Dispatcher stopped, dropping item");
        }
    }
}
