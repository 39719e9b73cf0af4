//! workerlink: RPC bridge to a supervised child worker over WebSocket.

pub mod bridge;
mod controller;
mod correlator;
mod dispatcher;
mod listener;
mod pending;
mod supervisor;
pub mod worker_log;

pub use bridge::codec::ProtocolError;
pub use bridge::protocol::{CallId, EventFrame, InboundFrame, RequestEnvelope, ResponseFrame};
pub use bridge::transport::TransportError;
pub use controller::{ConnectionState, Controller, ControllerConfig, ControllerError};
pub use correlator::Correlator;
pub use dispatcher::{
    ATTRIBUTE_CHANGED, DispatchItem, NODE_STATE_INFORMATION, READY, WorkerEvent, classify,
};
pub use listener::{
    AttributeListener, ControllerStateListener, ListenerSet, NodeStateListener, ProcessListener,
};
pub use pending::{CallError, CallHandle, CallResult, PendingCalls};
pub use supervisor::{
    ProcessPhase, ProcessSupervisor, Readiness, SupervisorConfig, SupervisorError, WorkerScript,
};
