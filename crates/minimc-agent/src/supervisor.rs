use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use minimc_process::{LogLevel, RunId, ServerStatus, SupervisorState};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::SupervisorError,
    launch::LaunchSpec,
    log_hub::LogHub,
    process_handle::{LineReader, ProcessHandle, ProcessKiller, StdinSink},
    telemetry::CONSOLE_TARGET,
};

/// Console line that asks the server to save and shut down.
pub const STOP_COMMAND: &str = "stop";

/// Output fragments that mean the server finished its own shutdown routine.
pub const DEFAULT_STOP_MARKERS: &[&str] = &[
    "Awaiting termination of I/O pool",
    "All dimensions are saved",
];

const DEFAULT_COMMAND_QUEUE: usize = 100;
const DEFAULT_READER_DRAIN: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Publishes to the hub and mirrors to tracing under the console target, which the hub
/// layer skips so the line is not published twice.
fn emit(hub: &LogHub, level: LogLevel, text: String) {
    match level {
        LogLevel::Error => tracing::error!(target: CONSOLE_TARGET, "{text}"),
        LogLevel::Warning => tracing::warn!(target: CONSOLE_TARGET, "{text}"),
        LogLevel::Info | LogLevel::Raw => tracing::info!(target: CONSOLE_TARGET, "{text}"),
    }
    hub.publish(level, text);
}

#[derive(Debug)]
struct InstanceState {
    state: SupervisorState,
    pid: Option<u32>,
    killer: Option<ProcessKiller>,
}

/// One run of the server, from admission to exit. Never reused: every start builds a
/// fresh instance.
#[derive(Debug)]
pub struct ServerInstance {
    run_id: RunId,
    inner: Mutex<InstanceState>,
    commands: mpsc::Sender<String>,
}

impl ServerInstance {
    fn new(queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let instance = Arc::new(Self {
            run_id: RunId::new(),
            inner: Mutex::new(InstanceState {
                state: SupervisorState::Starting,
                pid: None,
                killer: None,
            }),
            commands: tx,
        });
        (instance, rx)
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    fn mark_running(&self, pid: Option<u32>, killer: ProcessKiller) {
        let mut inner = self.lock();
        inner.state = SupervisorState::Running;
        inner.pid = pid;
        inner.killer = Some(killer);
    }

    fn mark_terminated(&self) {
        let mut inner = self.lock();
        inner.state = SupervisorState::Terminated;
        inner.killer = None;
    }

    fn mark_idle(&self) {
        let mut inner = self.lock();
        inner.state = SupervisorState::Idle;
        inner.pid = None;
    }

    fn enqueue_locked(&self, inner: &InstanceState, line: String) -> Result<(), SupervisorError> {
        if !inner.state.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        match self.commands.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SupervisorError::QueueFull),
            // The writer gave up on a broken stdin while the process lives on.
            Err(TrySendError::Closed(_)) => Err(SupervisorError::InputClosed),
        }
    }

    fn enqueue(&self, line: String) -> Result<(), SupervisorError> {
        let inner = self.lock();
        self.enqueue_locked(&inner, line)
    }

    fn request_stop(&self) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        self.enqueue_locked(&inner, STOP_COMMAND.to_string())?;
        inner.state = SupervisorState::Stopping;
        Ok(())
    }

    fn kill(&self) -> Result<(), SupervisorError> {
        let inner = self.lock();
        if !inner.state.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let killer = inner.killer.as_ref().ok_or(SupervisorError::NotRunning)?;
        killer.kill().map_err(|e| match e.kind() {
            // Reaped a moment ago; the watcher has not caught up yet.
            std::io::ErrorKind::NotFound => SupervisorError::NotRunning,
            _ => SupervisorError::Os(e),
        })
    }
}

/// Holds the one server instance allowed to be active at a time.
///
/// Built once at startup and shared with the supervisor and the HTTP layer. The lock only
/// guards the pointer; no I/O happens while it is held.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    active: Arc<Mutex<Option<Arc<ServerInstance>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ServerInstance>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active(&self) -> Option<Arc<ServerInstance>> {
        self.lock().clone()
    }

    fn admit(&self, candidate: Arc<ServerInstance>) -> Result<(), SupervisorError> {
        let mut active = self.lock();
        if let Some(current) = active.as_ref()
            && current.state().is_active()
        {
            return Err(SupervisorError::AlreadyRunning);
        }
        *active = Some(candidate);
        Ok(())
    }

    fn release(&self, instance: &Arc<ServerInstance>) {
        let mut active = self.lock();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            *active = None;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub command_queue: usize,
    pub stop_markers: Vec<String>,
    /// How long reader tasks may keep draining buffered output after the process exits.
    pub reader_drain: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            command_queue: DEFAULT_COMMAND_QUEUE,
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|m| m.to_string()).collect(),
            reader_drain: DEFAULT_READER_DRAIN,
        }
    }
}

/// Starts, stops and talks to the game server.
///
/// Cheap to clone; all clones share the registry and hub. Every operation is safe to call
/// from concurrent request handlers.
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: ProcessRegistry,
    hub: LogHub,
    launch: Arc<LaunchSpec>,
    options: Arc<SupervisorOptions>,
}

impl Supervisor {
    pub fn new(
        registry: ProcessRegistry,
        hub: LogHub,
        launch: LaunchSpec,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            registry,
            hub,
            launch: Arc::new(launch),
            options: Arc::new(options),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    /// Spawns the server. Returns once the process exists; readiness of the game itself is
    /// only visible in the console output.
    pub fn start(&self) -> Result<RunId, SupervisorError> {
        let (instance, commands_rx) = ServerInstance::new(self.options.command_queue);
        self.registry.admit(instance.clone())?;

        emit(
            &self.hub,
            LogLevel::Info,
            format!(
                "starting server: {} (cwd {})",
                self.launch.display(),
                self.launch.cwd.display()
            ),
        );

        let mut handle = match ProcessHandle::spawn(&self.launch) {
            Ok(handle) => handle,
            Err(err) => return Err(self.abort_start(&instance, err)),
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (handle.take_stdin(), handle.take_stdout(), handle.take_stderr())
        else {
            // Dropping the handle kills the child.
            drop(handle);
            return Err(self.abort_start(
                &instance,
                std::io::Error::other("server stdio pipes unavailable"),
            ));
        };

        let pid = handle.pid();
        instance.mark_running(pid, handle.killer());

        let cancel = CancellationToken::new();
        let markers: Arc<[String]> = self.options.stop_markers.clone().into();
        let mut readers = JoinSet::new();
        for reader in [stdout, stderr] {
            readers.spawn(pump_output(
                reader,
                self.hub.clone(),
                markers.clone(),
                cancel.clone(),
            ));
        }
        let writer = tokio::spawn(drain_commands(
            stdin,
            commands_rx,
            self.hub.clone(),
            cancel.clone(),
        ));
        tokio::spawn(watch_exit(
            handle,
            instance.clone(),
            self.registry.clone(),
            self.hub.clone(),
            TaskGroup {
                readers,
                writer,
                cancel,
                drain: self.options.reader_drain,
            },
        ));

        emit(
            &self.hub,
            LogLevel::Info,
            format!(
                "server process started (pid {}, run {})",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
                instance.run_id()
            ),
        );
        Ok(instance.run_id().clone())
    }

    fn abort_start(&self, instance: &Arc<ServerInstance>, err: std::io::Error) -> SupervisorError {
        instance.mark_terminated();
        self.registry.release(instance);
        emit(
            &self.hub,
            LogLevel::Error,
            format!("failed to start server: {err}"),
        );
        SupervisorError::LaunchFailure(err)
    }

    fn running_instance(&self) -> Result<Arc<ServerInstance>, SupervisorError> {
        self.registry.active().ok_or(SupervisorError::NotRunning)
    }

    /// Queues the graceful `stop` console command. Does not wait for the exit.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.running_instance()?.request_stop()?;
        emit(&self.hub, LogLevel::Info, "stop requested".to_string());
        Ok(())
    }

    /// SIGKILL, bypassing the command queue and the server's own shutdown.
    pub fn kill(&self) -> Result<(), SupervisorError> {
        self.running_instance()?.kill()?;
        emit(&self.hub, LogLevel::Warning, "server killed".to_string());
        Ok(())
    }

    /// Queues one console line. A trailing line ending is dropped; any other line break is
    /// rejected so a single call can never become several commands.
    pub fn run_command(&self, line: &str) -> Result<(), SupervisorError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.contains(['\r', '\n']) {
            return Err(SupervisorError::InvalidCommand);
        }
        self.running_instance()?.enqueue(line.to_string())
    }

    pub fn status(&self) -> bool {
        self.registry
            .active()
            .is_some_and(|instance| instance.state().is_running())
    }

    pub fn describe(&self) -> ServerStatus {
        let Some(instance) = self.registry.active() else {
            return ServerStatus::idle();
        };
        let state = instance.state();
        ServerStatus {
            running: state.is_running(),
            state,
            run_id: Some(instance.run_id().clone()),
            pid: instance.pid(),
        }
    }

    /// Polls until no instance is active. Returns false on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self
                .registry
                .active()
                .is_some_and(|instance| instance.state().is_active());
            if !active {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Graceful stop with a deadline, escalating to kill. Used when the agent shuts down.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.status() {
            return;
        }
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "graceful stop request failed");
        }
        if self.wait_for_exit(grace).await {
            return;
        }

        emit(
            &self.hub,
            LogLevel::Warning,
            format!(
                "server did not stop within {}s, killing it",
                grace.as_secs()
            ),
        );
        if let Err(err) = self.kill() {
            tracing::warn!(error = %err, "kill during shutdown failed");
        }
        self.wait_for_exit(Duration::from_secs(5)).await;
    }
}

/// Background tasks of one run. Owned by the exit watcher and torn down with it.
struct TaskGroup {
    readers: JoinSet<()>,
    writer: JoinHandle<()>,
    cancel: CancellationToken,
    drain: Duration,
}

impl TaskGroup {
    async fn shutdown(mut self) {
        let drained = tokio::time::timeout(self.drain, async {
            while self.readers.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            tracing::debug!("output readers still open after exit, cancelling");
        }

        self.cancel.cancel();
        while self.readers.join_next().await.is_some() {}
        let _ = self.writer.await;
    }
}

async fn pump_output(
    mut reader: LineReader,
    hub: LogHub,
    stop_markers: Arc<[String]>,
    cancel: CancellationToken,
) {
    let stream = reader.stream_name();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = reader.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                tracing::info!(target: CONSOLE_TARGET, stream, "{line}");
                let stopped = stop_markers.iter().any(|m| line.contains(m.as_str()));
                hub.publish(LogLevel::Raw, line);
                if stopped {
                    emit(&hub, LogLevel::Info, "server has been stopped".to_string());
                }
            }
            Ok(None) => break,
            Err(err) => {
                emit(
                    &hub,
                    LogLevel::Warning,
                    format!("reading server {stream} failed: {err}"),
                );
                break;
            }
        }
    }
}

async fn drain_commands(
    mut stdin: StdinSink,
    mut commands: mpsc::Receiver<String>,
    hub: LogHub,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = commands.recv() => line,
        };
        let Some(line) = line else {
            break;
        };

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = stdin.send_line(&line) => res,
        };
        if let Err(err) = res {
            emit(
                &hub,
                LogLevel::Warning,
                format!("writing to server stdin failed: {err}"),
            );
            break;
        }
    }
}

async fn watch_exit(
    handle: ProcessHandle,
    instance: Arc<ServerInstance>,
    registry: ProcessRegistry,
    hub: LogHub,
    tasks: TaskGroup,
) {
    let exit = handle.wait().await;
    instance.mark_terminated();
    registry.release(&instance);

    tasks.shutdown().await;

    let level = if exit.success {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    emit(&hub, level, format!("server process exited ({exit})"));
    instance.mark_idle();
}
