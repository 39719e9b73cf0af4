//! WebSocket transport to the worker.
//!
//! `Transport::connect` performs the handshake; `Transport::start` splits the
//! stream into a writer task (fed by `FrameWriter`) and a reader task that
//! decodes frames and hands them to a `FrameSink`. The sink sees `on_open`
//! once and `on_closed` at most once per connection, whichever side closes.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{ProtocolError, decode_message};
use super::protocol::InboundFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out connecting to {url} after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("transport closed")]
    Closed,
}

/// Receiver of everything the transport observes.
///
/// Called from the transport's own tasks; implementations must not block.
pub trait FrameSink: Send + Sync + 'static {
    fn on_open(&self);

    fn on_frame(&self, frame: InboundFrame);

    fn on_closed(&self, reason: String);
}

pub type SendAck = oneshot::Receiver<Result<(), String>>;

pub(crate) enum Outbound {
    Frame {
        message: Message,
        ack: oneshot::Sender<Result<(), String>>,
    },
    Close,
}

/// Cloneable handle for queueing outbound messages.
#[derive(Clone)]
pub struct FrameWriter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl FrameWriter {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. The returned receiver resolves once the socket write finishes.
    pub fn send(&self, message: Message) -> Result<SendAck, TransportError> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Frame { message, ack })
            .map_err(|_| TransportError::Closed)?;
        Ok(ack_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// Shared between the tasks so exactly one of them reports the close.
struct Link {
    closed: AtomicBool,
    sink: StdMutex<Option<Arc<dyn FrameSink>>>,
}

impl Link {
    fn sink(&self) -> Option<Arc<dyn FrameSink>> {
        match self.sink.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns false when the close was already reported.
    fn notify_closed(&self, reason: String) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!(%reason, "Transport closed");
        if let Some(sink) = self.sink() {
            sink.on_closed(reason);
        }
        true
    }
}

pub struct Transport {
    url: String,
    config: TransportConfig,
    writer: FrameWriter,
    link: Arc<Link>,
    pending_io: StdMutex<Option<(WsStream, mpsc::UnboundedReceiver<Outbound>)>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Open the WebSocket, bounded by `connect_timeout`.
    pub async fn connect(url: &str, config: TransportConfig) -> Result<Self, TransportError> {
        tracing::debug!(%url, "Connecting to worker");
        let (ws, _response) =
            match tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(TransportError::Connect {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(TransportError::ConnectTimeout {
                        url: url.to_string(),
                        timeout: config.connect_timeout,
                    });
                }
            };

        let (writer, outbound_rx) = FrameWriter::channel();
        Ok(Self {
            url: url.to_string(),
            config,
            writer,
            link: Arc::new(Link {
                closed: AtomicBool::new(false),
                sink: StdMutex::new(None),
            }),
            pending_io: StdMutex::new(Some((ws, outbound_rx))),
            writer_task: StdMutex::new(None),
            reader_task: StdMutex::new(None),
        })
    }

    /// Attach the sink and start the reader/writer tasks.
    ///
    /// `on_open` is delivered before any frame. Calling twice is a no-op.
    pub fn start(&self, sink: Arc<dyn FrameSink>) {
        let io = match self.pending_io.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some((ws, outbound_rx)) = io else {
            tracing::warn!(url = %self.url, "Transport already started");
            return;
        };

        match self.link.sink.lock() {
            Ok(mut guard) => *guard = Some(Arc::clone(&sink)),
            Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&sink)),
        }
        sink.on_open();

        let (ws_sink, ws_stream) = ws.split();
        let writer = tokio::spawn(run_writer(ws_sink, outbound_rx, Arc::clone(&self.link)));
        let reader = tokio::spawn(run_reader(ws_stream, sink, Arc::clone(&self.link)));

        for (slot, task) in [(&self.writer_task, writer), (&self.reader_task, reader)] {
            match slot.lock() {
                Ok(mut guard) => *guard = Some(task),
                Err(poisoned) => *poisoned.into_inner() = Some(task),
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn writer(&self) -> FrameWriter {
        self.writer.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.link.closed.load(Ordering::SeqCst)
    }

    /// Close the connection: a Close frame bounded by `close_timeout`, then
    /// unconditional task teardown. Safe to call repeatedly.
    ///
    /// Returns true if this call reported the close, false if the connection
    /// had already gone down.
    pub async fn close(&self, reason: &str) -> bool {
        // Claim the notification first so the worker's Close reply cannot race it.
        let reported = self.link.notify_closed(reason.to_string());

        let writer_task = take_task(&self.writer_task);
        let reader_task = take_task(&self.reader_task);

        if let Some(mut writer_task) = writer_task {
            if self.writer.tx.send(Outbound::Close).is_ok()
                && tokio::time::timeout(self.config.close_timeout, &mut writer_task)
                    .await
                    .is_err()
            {
                tracing::debug!(url = %self.url, "Graceful close timed out");
            }
            writer_task.abort();
        }
        if let Some(reader_task) = reader_task {
            reader_task.abort();
        }

        // Never started: drop the socket here.
        let _ = match self.pending_io.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        reported
    }
}

fn take_task(slot: &StdMutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for slot in [&self.writer_task, &self.reader_task] {
            if let Some(task) = take_task(slot) {
                task.abort();
            }
        }
    }
}

async fn run_writer(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    link: Arc<Link>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Frame { message, ack } => {
                let result = ws_sink.send(message).await.map_err(|e| e.to_string());
                let failed = result.as_ref().err().cloned();
                let _ = ack.send(result);
                if let Some(reason) = failed {
                    tracing::warn!(error = %reason, "Failed to write frame");
                    link.notify_closed(format!("send failed: {reason}"));
                    break;
                }
            }
            Outbound::Close => {
                if let Err(e) = ws_sink.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "Error sending close frame");
                }
                let _ = ws_sink.close().await;
                break;
            }
        }
    }
    tracing::trace!("Transport writer exiting");
}

async fn run_reader(
    mut ws_stream: SplitStream<WsStream>,
    sink: Arc<dyn FrameSink>,
    link: Arc<Link>,
) {
    let reason = loop {
        match ws_stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by worker".to_string());
            }
            Some(Ok(message)) => match decode_message(&message) {
                Ok(Some(frame)) => sink.on_frame(frame),
                Ok(None) => {}
                Err(ProtocolError::Unsupported(kind)) => {
                    tracing::debug!(kind, "Ignoring unsupported frame");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed frame");
                }
            },
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };
    link.notify_closed(reason);
    tracing::trace!("Transport reader exiting");
}
