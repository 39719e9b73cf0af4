//! Worker process supervisor.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Exited`, and back to
//! `Starting` when an unplanned exit schedules a restart.
//!
//! Launch allocates a free port, resolves the worker binary and runs
//! `<binary> <script> --host <host> --port <port> [extra...]` with stdout and
//! stderr piped. Both streams are forwarded to tracing; the readiness rule is
//! applied to every line until it first matches, after which listeners get
//! `on_node_ready(port)` following a short settle delay.
//!
//! Each launch gets a generation number. Reader, ready and exit tasks carry the
//! generation they were started for and do nothing once it is stale, so a late
//! callback from a previous process never touches the current one.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::listener::{ListenerSet, ProcessListener, notify_all};
use crate::worker_log::forward_line;

const MAX_LINE_LENGTH: usize = 64 * 1024;
const MAX_PORT_ATTEMPTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker binary not found: {0}")]
    BinaryNotFound(PathBuf),
    #[error("failed to prepare worker script: {0}")]
    Script(#[source] std::io::Error),
    #[error("failed to allocate a port: {0}")]
    Port(#[source] std::io::Error),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {0} not captured")]
    StreamNotCaptured(&'static str),
    #[error("worker was never started")]
    NotStarted,
}

/// What the worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerScript {
    /// An existing file, passed through as-is.
    Path(PathBuf),
    /// Script text written to a temporary file for each launch and removed when
    /// that process exits.
    Embedded { name: String, contents: String },
}

/// Rule deciding when the worker is ready to accept connections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Readiness {
    /// The first output line on either stream.
    #[default]
    FirstLine,
    /// The first line containing this marker.
    Marker(String),
}

impl Readiness {
    fn matches(&self, line: &str) -> bool {
        match self {
            Readiness::FirstLine => true,
            Readiness::Marker(marker) => line.contains(marker.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Stopped,
    Starting,
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub host: String,
    pub restart_delay: Duration,
    pub ready_delay: Duration,
    pub stop_timeout: Duration,
    pub readiness: Readiness,
    pub working_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            host: "localhost".to_string(),
            restart_delay: Duration::from_secs(5),
            ready_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            readiness: Readiness::FirstLine,
            working_dir: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
struct LaunchSpec {
    script: WorkerScript,
    extra_args: Vec<String>,
}

struct WorkerState {
    phase: ProcessPhase,
    ready: bool,
    port: Option<u16>,
    pid: Option<u32>,
    script_path: Option<PathBuf>,
    launch: Option<LaunchSpec>,
    generation: u64,
    spawn_count: u64,
    stop_token: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
}

struct Inner {
    config: SupervisorConfig,
    listeners: ListenerSet<dyn ProcessListener>,
    state: StdMutex<WorkerState>,
    shutting_down: AtomicBool,
}

/// Owns one worker process at a time and restarts it after unplanned exits.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                listeners: ListenerSet::new(),
                state: StdMutex::new(WorkerState {
                    phase: ProcessPhase::Stopped,
                    ready: false,
                    port: None,
                    pid: None,
                    script_path: None,
                    launch: None,
                    generation: 0,
                    spawn_count: 0,
                    stop_token: None,
                    watcher: None,
                    restart: None,
                }),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Launch the worker and return the port it was told to listen on.
    ///
    /// A worker that is still alive is stopped first. Launch failures are
    /// returned here; later crashes are handled by the restart schedule.
    pub async fn start(
        &self,
        script: WorkerScript,
        extra_args: Vec<String>,
    ) -> Result<u16, SupervisorError> {
        let busy = {
            let state = self.inner.lock_state();
            state.stop_token.is_some() || state.restart.is_some()
        };
        if busy {
            tracing::debug!("Worker running or restart pending, stopping before start");
            self.stop().await;
        }
        self.inner.lock_state().launch = Some(LaunchSpec { script, extra_args });
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.inner.launch()
    }

    /// Stop the current worker and launch again with the last arguments.
    pub async fn restart(&self) -> Result<u16, SupervisorError> {
        if self.inner.lock_state().launch.is_none() {
            return Err(SupervisorError::NotStarted);
        }
        self.stop().await;
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.inner.launch()
    }

    /// Terminate the worker: SIGTERM, then a forced kill after `stop_timeout`.
    ///
    /// Cancels any scheduled restart. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let (restart, stop_token, watcher) = {
            let mut state = self.inner.lock_state();
            (
                state.restart.take(),
                state.stop_token.take(),
                state.watcher.take(),
            )
        };

        if let Some(restart) = restart {
            tracing::debug!("Cancelling scheduled worker restart");
            restart.abort();
        }
        if let Some(token) = stop_token {
            token.cancel();
        }
        if let Some(watcher) = watcher
            && let Err(e) = watcher.await
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Worker exit watcher failed");
        }

        let mut state = self.inner.lock_state();
        if state.phase != ProcessPhase::Stopped {
            tracing::info!("Worker stopped");
        }
        state.phase = ProcessPhase::Stopped;
        state.ready = false;
        state.pid = None;
    }

    /// Subscribe to exit/ready callbacks.
    ///
    /// A listener added while the worker is already ready is told so immediately.
    pub fn add_process_listener(&self, listener: Arc<dyn ProcessListener>) {
        let ready_port = {
            let state = self.inner.lock_state();
            self.inner.listeners.add(Arc::clone(&listener));
            if state.ready { state.port } else { None }
        };
        if let Some(port) = ready_port {
            notify_all(&[listener], "node_ready", |l| l.on_node_ready(port));
        }
    }

    pub fn remove_process_listener(&self, listener: &Arc<dyn ProcessListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Port of the most recent launch.
    pub fn port(&self) -> Option<u16> {
        self.inner.lock_state().port
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock_state().ready
    }

    pub fn phase(&self) -> ProcessPhase {
        self.inner.lock_state().phase
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_state().pid
    }

    /// Script path of the live process, if any.
    pub fn script_path(&self) -> Option<PathBuf> {
        self.inner.lock_state().script_path.clone()
    }

    /// Number of processes spawned over this supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.lock_state().spawn_count
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut state = self.inner.lock_state();
        if let Some(restart) = state.restart.take() {
            restart.abort();
        }
        if let Some(token) = state.stop_token.take() {
            token.cancel();
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Supervisor state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn launch(self: &Arc<Self>) -> Result<u16, SupervisorError> {
        let plan = self
            .lock_state()
            .launch
            .clone()
            .ok_or(SupervisorError::NotStarted)?;

        let previous_port = self.lock_state().port;

        let binary = resolve_binary(&self.config.binary)?;
        let (script_path, temp_script) = materialize_script(&plan.script)?;
        let port = allocate_port(previous_port)?;

        let mut command = Command::new(&binary);
        command
            .arg(&script_path)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(port.to_string())
            .args(&plan.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(
            binary = %binary.display(),
            script = %script_path.display(),
            port,
            "Spawning worker"
        );
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::StreamNotCaptured("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::StreamNotCaptured("stderr"))?;

        let mut state = self.lock_state();
        if let Some(stale) = state.stop_token.take() {
            tracing::warn!(generation = state.generation, "Replacing a live worker, terminating it");
            stale.cancel();
        }
        // The restart task may be the caller; detach its handle.
        state.restart = None;
        state.generation += 1;
        state.spawn_count += 1;
        let generation = state.generation;
        state.phase = ProcessPhase::Starting;
        state.ready = false;
        state.port = Some(port);
        state.pid = child.id();
        state.script_path = Some(script_path);

        let claimed = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_output(
            Arc::clone(self),
            generation,
            "stdout",
            stdout,
            Arc::clone(&claimed),
        ));
        tokio::spawn(read_output(
            Arc::clone(self),
            generation,
            "stderr",
            stderr,
            claimed,
        ));

        let stop_token = CancellationToken::new();
        if self.shutting_down.load(Ordering::SeqCst) {
            // A restart raced stop(); terminate what we just spawned.
            tracing::debug!(generation, "Stop requested during launch");
            stop_token.cancel();
        }
        state.stop_token = Some(stop_token.clone());
        state.watcher = Some(tokio::spawn(watch_exit(
            Arc::clone(self),
            generation,
            child,
            stop_token,
            temp_script,
        )));

        tracing::debug!(generation, pid = ?state.pid, "Worker spawned");
        Ok(port)
    }

    fn mark_ready(&self, generation: u64) {
        let (port, listeners) = {
            let mut state = self.lock_state();
            if state.generation != generation || state.phase != ProcessPhase::Starting {
                return;
            }
            let Some(port) = state.port else {
                return;
            };
            state.phase = ProcessPhase::Running;
            state.ready = true;
            // Snapshot under the state lock so add_process_listener can't double-notify.
            (port, self.listeners.snapshot())
        };
        tracing::info!(port, "Worker ready");
        notify_all(&listeners, "node_ready", |l| l.on_node_ready(port));
    }

    fn on_exit(self: &Arc<Self>, generation: u64, exit_code: i32) {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                tracing::debug!(generation, "Ignoring exit of superseded worker");
                return;
            }
            state.phase = ProcessPhase::Exited;
            state.ready = false;
            state.pid = None;
            state.script_path = None;
            state.stop_token = None;

            if self.shutting_down.load(Ordering::SeqCst) {
                tracing::info!(exit_code, "Worker exited during shutdown");
            } else {
                let delay = self.config.restart_delay;
                tracing::warn!(exit_code, ?delay, "Worker exited unexpectedly, scheduling restart");
                state.restart = Some(tokio::spawn(restart_after(Arc::clone(self), delay)));
            }
        }
        self.listeners
            .notify("node_exit", |l| l.on_node_exit(exit_code));
    }
}

fn resolve_binary(binary: &Path) -> Result<PathBuf, SupervisorError> {
    if binary.components().count() > 1 {
        return if binary.is_file() {
            Ok(binary.to_path_buf())
        } else {
            Err(SupervisorError::BinaryNotFound(binary.to_path_buf()))
        };
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(binary))
                .find(|candidate| is_executable(candidate))
        })
        .ok_or_else(|| SupervisorError::BinaryNotFound(binary.to_path_buf()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn materialize_script(
    script: &WorkerScript,
) -> Result<(PathBuf, Option<TempPath>), SupervisorError> {
    match script {
        WorkerScript::Path(path) => {
            if !path.is_file() {
                return Err(SupervisorError::Script(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                )));
            }
            Ok((path.clone(), None))
        }
        WorkerScript::Embedded { name, contents } => {
            use std::io::Write;
            let mut file = tempfile::Builder::new()
                .prefix("workerlink-")
                .suffix(&format!("-{name}"))
                .tempfile()
                .map_err(SupervisorError::Script)?;
            file.write_all(contents.as_bytes())
                .and_then(|()| file.flush())
                .map_err(SupervisorError::Script)?;
            let temp = file.into_temp_path();
            Ok((temp.to_path_buf(), Some(temp)))
        }
    }
}

/// Ask the OS for a free port, skipping the one the previous worker used.
/// The worker binds it after we release it.
fn allocate_port(previous: Option<u16>) -> Result<u16, SupervisorError> {
    let mut held = Vec::new();
    loop {
        let listener =
            std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(SupervisorError::Port)?;
        let port = listener.local_addr().map_err(SupervisorError::Port)?.port();
        if Some(port) != previous || held.len() >= MAX_PORT_ATTEMPTS {
            return Ok(port);
        }
        // Keep the repeat bound so the next bind gets a different port.
        held.push(listener);
    }
}

async fn read_output<R>(
    inner: Arc<Inner>,
    generation: u64,
    stream: &'static str,
    reader: R,
    claimed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if !claimed.load(Ordering::SeqCst)
                    && inner.config.readiness.matches(&line)
                    && !claimed.swap(true, Ordering::SeqCst)
                {
                    let inner = Arc::clone(&inner);
                    let delay = inner.config.ready_delay;
                    tracing::debug!(stream, ?delay, "Worker readiness signal seen");
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.mark_ready(generation);
                    });
                }
                forward_line(stream, &line);
            }
            Err(e) => {
                if !inner.shutting_down.load(Ordering::SeqCst) {
                    tracing::debug!(stream, error = %e, "Error reading worker output");
                }
                break;
            }
        }
    }
    tracing::trace!(stream, "Worker output closed");
}

async fn watch_exit(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    stop: CancellationToken,
    temp_script: Option<TempPath>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = stop.cancelled() => terminate(&mut child, inner.config.stop_timeout).await,
    };
    let exit_code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(error = %e, "Failed waiting for worker exit");
            -1
        }
    };
    tracing::debug!(exit_code, "Worker process exited");

    if let Some(temp) = temp_script
        && let Err(e) = temp.close()
    {
        tracing::debug!(error = %e, "Failed to delete temporary worker script");
    }
    inner.on_exit(generation, exit_code);
}

/// Signal-terminated processes have no code; report -1.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    request_termination(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(?grace, "Worker ignored termination request, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM to worker");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to terminate worker");
    }
}

async fn restart_after(inner: Arc<Inner>, delay: Duration) {
    tokio::time::sleep(delay).await;
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    tracing::info!("Restarting worker");
    if let Err(e) = inner.launch() {
        tracing::error!(error = %e, "Failed to restart worker");
    }
}
