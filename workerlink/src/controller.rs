//! Controller: the host-facing façade over one worker connection.
//!
//! A controller owns at most one live session. A session is one transport
//! connection plus its own correlator; it is torn down before a new one is
//! opened, so a response can never resolve a call from another session.
//!
//! Two ways to reach a worker:
//! - `connect(host, port)` attaches to an externally managed worker and may
//!   re-arm a reconnect timer when the connection drops unexpectedly.
//! - `connect_managed(dir)` spawns the worker under a `ProcessSupervisor`;
//!   each ready notification opens a session and each exit closes it with
//!   `"Exit code <n>"`. Restarts are the supervisor's job.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::InboundFrame;
use crate::bridge::transport::{FrameSink, Transport, TransportConfig, TransportError};
use crate::correlator::Correlator;
use crate::dispatcher::{DispatchItem, Dispatcher, EventListeners};
use crate::listener::{
    AttributeListener, ControllerStateListener, ListenerSet, NodeStateListener, ProcessListener,
};
use crate::pending::{CallError, CallHandle};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorError, WorkerScript};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("managed worker not configured: missing {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub call_timeout: Duration,
    pub close_timeout: Duration,
    /// Delay before reconnecting after an unexpected drop of an external worker.
    pub reconnect_delay: Option<Duration>,
    /// Path and query appended to `ws://host:port`.
    pub path: String,
    pub supervisor: Option<SupervisorConfig>,
    pub worker_script: Option<WorkerScript>,
    pub worker_args: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(
                std::env::var("WORKERLINK_CALL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60),
            ),
            close_timeout: Duration::from_secs(1),
            reconnect_delay: None,
            path: "/".to_string(),
            supervisor: None,
            worker_script: None,
            worker_args: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_supervisor(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = Some(config);
        self
    }

    pub fn with_worker_script(mut self, script: WorkerScript) -> Self {
        self.worker_script = Some(script);
        self
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            close_timeout: self.close_timeout,
        }
    }
}

/// State shared by a session's transport callbacks and the controller.
struct SessionShared {
    id: u64,
    host: String,
    port: u16,
    reconnectable: bool,
    /// Controller epoch this session was opened under.
    epoch: u64,
    correlator: Correlator,
    dispatcher: Dispatcher,
    /// Set before a host-initiated close so the drop is not treated as unexpected.
    explicit_close: AtomicBool,
    controller: Weak<ControllerInner>,
}

struct Session {
    shared: Arc<SessionShared>,
    transport: Transport,
}

/// Routes transport callbacks for one session.
struct SessionRouter {
    shared: Arc<SessionShared>,
}

impl FrameSink for SessionRouter {
    fn on_open(&self) {
        tracing::info!(session = self.shared.id, port = self.shared.port, "Connected to worker");
        if let Some(inner) = self.shared.controller.upgrade() {
            inner.session_opened(&self.shared);
        }
        self.shared.dispatcher.enqueue(DispatchItem::Connected);
    }

    fn on_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(response) => {
                self.shared.correlator.handle_response(response);
            }
            InboundFrame::Event(event) => {
                self.shared.dispatcher.enqueue(DispatchItem::Event(event));
            }
        }
    }

    fn on_closed(&self, reason: String) {
        tracing::info!(session = self.shared.id, %reason, "Worker connection closed");
        self.shared.correlator.close(&reason);
        self.shared
            .dispatcher
            .enqueue(DispatchItem::Disconnected(reason.clone()));
        if let Some(inner) = self.shared.controller.upgrade() {
            inner.session_closed(&self.shared);
        }
    }
}

struct ManagedWorker {
    supervisor: Arc<ProcessSupervisor>,
    detached: Arc<AtomicBool>,
}

#[derive(Debug)]
enum ManagedEvent {
    Ready(u16),
    Exit(i32),
}

/// Supervisor listener feeding the controller's managed-worker task.
struct ManagedListener {
    tx: mpsc::UnboundedSender<ManagedEvent>,
}

impl ProcessListener for ManagedListener {
    fn on_node_exit(&self, exit_code: i32) -> anyhow::Result<()> {
        self.tx.send(ManagedEvent::Exit(exit_code))?;
        Ok(())
    }

    fn on_node_ready(&self, port: u16) -> anyhow::Result<()> {
        self.tx.send(ManagedEvent::Ready(port))?;
        Ok(())
    }
}

struct ControllerInner {
    config: ControllerConfig,
    listeners: Arc<EventListeners>,
    process_listeners: ListenerSet<dyn ProcessListener>,
    /// One queue for the controller's lifetime keeps notifications ordered across sessions.
    dispatcher: StdMutex<Option<Dispatcher>>,
    /// Serializes session open/close.
    session: Mutex<Option<Session>>,
    /// Session accepting calls, if any.
    active: RwLock<Option<Arc<SessionShared>>>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect: StdMutex<Option<JoinHandle<()>>>,
    /// Bumped by every host connect/disconnect; reconnects from an older epoch are void.
    epoch: AtomicU64,
    managed: StdMutex<Option<ManagedWorker>>,
    session_seq: AtomicU64,
}

/// Façade over supervisor, transport, correlator and dispatcher.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                listeners: EventListeners::new(),
                process_listeners: ListenerSet::new(),
                dispatcher: StdMutex::new(None),
                session: Mutex::new(None),
                active: RwLock::new(None),
                state_tx,
                reconnect: StdMutex::new(None),
                epoch: AtomicU64::new(0),
                managed: StdMutex::new(None),
                session_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Connect to an already running worker, replacing any current session.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ControllerError> {
        let epoch = self.inner.cancel_reconnect();
        self.inner.stop_managed().await;
        self.inner.open_session(host, port, true, epoch).await
    }

    /// Spawn a supervised worker in `working_dir` and connect whenever it is ready.
    ///
    /// Returns the port the worker was launched with; the connection itself is
    /// established in the background once the worker signals readiness.
    pub async fn connect_managed(
        &self,
        working_dir: impl Into<PathBuf>,
    ) -> Result<u16, ControllerError> {
        self.disconnect().await;

        let supervisor_config = self
            .inner
            .config
            .supervisor
            .clone()
            .ok_or(ControllerError::NotConfigured("supervisor config"))?
            .with_working_dir(working_dir);
        let script = self
            .inner
            .config
            .worker_script
            .clone()
            .ok_or(ControllerError::NotConfigured("worker script"))?;

        let host = supervisor_config.host.clone();
        let supervisor = Arc::new(ProcessSupervisor::new(supervisor_config));
        let detached = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        supervisor.add_process_listener(Arc::new(ManagedListener { tx }));
        tokio::spawn(run_managed(
            Arc::downgrade(&self.inner),
            host,
            self.inner.epoch.load(Ordering::SeqCst),
            Arc::clone(&detached),
            rx,
        ));

        self.inner.set_state(ConnectionState::Connecting);
        match supervisor
            .start(script, self.inner.config.worker_args.clone())
            .await
        {
            Ok(port) => {
                *lock(&self.inner.managed) = Some(ManagedWorker {
                    supervisor,
                    detached,
                });
                Ok(port)
            }
            Err(e) => {
                detached.store(true, Ordering::SeqCst);
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Close the session, stop a managed worker and cancel pending reconnects.
    ///
    /// Every outstanding call is rejected. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.cancel_reconnect();
        self.inner.stop_managed().await;
        self.inner.close_session("disconnected").await;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .active_session()
            .is_some_and(|session| !session.correlator.is_closed())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Invoke `namespace.function(args)` on the worker.
    ///
    /// Never blocks. Without a live session the handle fails immediately with
    /// `CallError::NotConnected`.
    pub fn call(
        &self,
        namespace: &str,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> CallHandle {
        match self.inner.active_session() {
            Some(session) if !session.correlator.is_closed() => {
                session.correlator.call(namespace, function, args)
            }
            _ => {
                tracing::debug!(namespace, function, "Call rejected, not connected");
                CallHandle::failed(CallError::NotConnected)
            }
        }
    }

    /// Port of the managed worker, if one was started.
    pub fn worker_port(&self) -> Option<u16> {
        lock(&self.inner.managed)
            .as_ref()
            .and_then(|m| m.supervisor.port())
    }

    pub fn is_worker_ready(&self) -> bool {
        lock(&self.inner.managed)
            .as_ref()
            .is_some_and(|m| m.supervisor.is_ready())
    }

    pub fn add_attribute_listener(&self, listener: Arc<dyn AttributeListener>) {
        self.inner.listeners.attribute.add(listener);
    }

    pub fn remove_attribute_listener(&self, listener: &Arc<dyn AttributeListener>) -> bool {
        self.inner.listeners.attribute.remove(listener)
    }

    pub fn add_node_state_listener(&self, listener: Arc<dyn NodeStateListener>) {
        self.inner.listeners.node_state.add(listener);
    }

    pub fn remove_node_state_listener(&self, listener: &Arc<dyn NodeStateListener>) -> bool {
        self.inner.listeners.node_state.remove(listener)
    }

    pub fn add_controller_listener(&self, listener: Arc<dyn ControllerStateListener>) {
        self.inner.listeners.controller.add(listener);
    }

    pub fn remove_controller_listener(&self, listener: &Arc<dyn ControllerStateListener>) -> bool {
        self.inner.listeners.controller.remove(listener)
    }

    /// Ready/exit callbacks of the managed worker.
    pub fn add_process_listener(&self, listener: Arc<dyn ProcessListener>) {
        self.inner.process_listeners.add(listener);
    }

    pub fn remove_process_listener(&self, listener: &Arc<dyn ProcessListener>) -> bool {
        self.inner.process_listeners.remove(listener)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Controller mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

impl ControllerInner {
    fn active_session(&self) -> Option<Arc<SessionShared>> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active(&self, session: Option<Arc<SessionShared>>) {
        match self.active.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    /// Must be called inside the runtime; the dispatch task is spawned on first use.
    fn dispatcher(&self) -> Dispatcher {
        lock(&self.dispatcher)
            .get_or_insert_with(|| Dispatcher::spawn(Arc::clone(&self.listeners)).0)
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Connection state changed");
            *current = state;
            true
        });
    }

    async fn open_session(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        reconnectable: bool,
        epoch: u64,
    ) -> Result<(), ControllerError> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            teardown(previous, "superseded by new connection").await;
        }

        self.set_state(ConnectionState::Connecting);
        let url = format!("ws://{host}:{port}{}", self.config.path);
        let transport = match Transport::connect(&url, self.config.transport_config()).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(%url, error = %e, "Failed to connect to worker");
                self.set_state(ConnectionState::Disconnected);
                self.dispatcher()
                    .enqueue(DispatchItem::Disconnected(e.to_string()));
                if reconnectable {
                    self.arm_reconnect(host, port, epoch);
                }
                return Err(e.into());
            }
        };

        let id = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let dispatcher = self.dispatcher();
        let shared = Arc::new(SessionShared {
            id,
            host: host.to_string(),
            port,
            reconnectable,
            epoch,
            correlator: Correlator::new(
                transport.writer(),
                self.config.call_timeout,
                self.config.send_timeout,
            ),
            dispatcher,
            explicit_close: AtomicBool::new(false),
            controller: Arc::downgrade(self),
        });

        self.set_active(Some(Arc::clone(&shared)));
        transport.start(Arc::new(SessionRouter {
            shared: Arc::clone(&shared),
        }));
        *slot = Some(Session { shared, transport });
        Ok(())
    }

    /// Returns true if a live session was closed and told its listeners so.
    async fn close_session(&self, reason: &str) -> bool {
        let previous = self.session.lock().await.take();
        match previous {
            Some(previous) => teardown(previous, reason).await,
            None => false,
        }
    }

    fn session_opened(&self, shared: &SessionShared) {
        if self
            .active_session()
            .is_some_and(|active| active.id == shared.id)
        {
            self.set_state(ConnectionState::Connected);
        }
    }

    fn session_closed(self: &Arc<Self>, shared: &SessionShared) {
        let was_active = match self.active.write() {
            Ok(mut guard) => take_if_current(&mut guard, shared.id),
            Err(poisoned) => take_if_current(&mut poisoned.into_inner(), shared.id),
        };
        if !was_active {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        if shared.reconnectable && !shared.explicit_close.load(Ordering::SeqCst) {
            self.arm_reconnect(&shared.host, shared.port, shared.epoch);
        }
    }

    fn arm_reconnect(self: &Arc<Self>, host: &str, port: u16, epoch: u64) {
        let Some(delay) = self.config.reconnect_delay else {
            return;
        };
        let mut slot = lock(&self.reconnect);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(host, port, "Connection superseded, not reconnecting");
            return;
        }
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        tracing::info!(host, port, ?delay, "Scheduling reconnect");
        let weak = Arc::downgrade(self);
        let host = host.to_string();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut slot = lock(&inner.reconnect);
                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                // Past this point the attempt runs to completion; cancel only hits the sleep.
                slot.take();
            }
            if let Err(e) = inner.open_session(&host, port, true, epoch).await {
                tracing::debug!(error = %e, "Reconnect attempt failed");
            }
        }));
    }

    /// Void every reconnect armed so far and return the new epoch.
    fn cancel_reconnect(&self) -> u64 {
        let mut slot = lock(&self.reconnect);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(task) = slot.take() {
            tracing::debug!("Cancelling scheduled reconnect");
            task.abort();
        }
        epoch
    }

    async fn stop_managed(&self) {
        let managed = lock(&self.managed).take();
        if let Some(managed) = managed {
            managed.detached.store(true, Ordering::SeqCst);
            managed.supervisor.stop().await;
        }
    }
}

fn take_if_current(active: &mut Option<Arc<SessionShared>>, id: u64) -> bool {
    if active.as_ref().is_some_and(|a| a.id == id) {
        *active = None;
        true
    } else {
        false
    }
}

async fn teardown(session: Session, reason: &str) -> bool {
    tracing::debug!(session = session.shared.id, %reason, "Closing session");
    session.shared.explicit_close.store(true, Ordering::SeqCst);
    session.transport.close(reason).await
}

/// Follows the managed worker: connect on ready, drop the session on exit.
async fn run_managed(
    controller: Weak<ControllerInner>,
    host: String,
    epoch: u64,
    detached: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<ManagedEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = controller.upgrade() else {
            break;
        };
        match event {
            ManagedEvent::Ready(port) => {
                inner
                    .process_listeners
                    .notify("node_ready", |l| l.on_node_ready(port));
                if detached.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = inner.open_session(&host, port, false, epoch).await {
                    tracing::warn!(port, error = %e, "Failed to connect to managed worker");
                }
            }
            ManagedEvent::Exit(exit_code) => {
                if !detached.load(Ordering::SeqCst) {
                    let reason = format!("Exit code {exit_code}");
                    if !inner.close_session(&reason).await {
                        // The socket went down first; the exit still gets reported.
                        inner
                            .dispatcher()
                            .enqueue(DispatchItem::Disconnected(reason));
                    }
                    inner.set_state(ConnectionState::Disconnected);
                }
                inner
                    .process_listeners
                    .notify("node_exit", |l| l.on_node_exit(exit_code));
            }
        }
    }
    tracing::trace!("Managed worker task exiting");
}
