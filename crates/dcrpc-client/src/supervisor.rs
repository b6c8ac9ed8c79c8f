//! Engine process lifecycle: spawn, handshake, exit monitoring and shutdown.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dcrpc_core::{ClientConfig, ACCOUNTS_PATH_ENV};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};

use crate::connection::{self, Connection};
use crate::correlator::{Correlator, IdAllocator};
use crate::error::RpcError;
use crate::framer;
use crate::state::{ConnectionState, LossReason};

/// Tracing target for lines the engine writes to stderr.
pub const ENGINE_LOG_TARGET: &str = "dcrpc::engine";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] dcrpc_core::Error),

    #[error("Failed to spawn engine '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("Engine did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Engine exited during startup (code {0:?})")]
    ProcessExited(Option<i32>),

    #[error("Engine handshake failed: {0}")]
    Handshake(#[source] RpcError),

    #[error("Engine {0} was not captured")]
    MissingPipe(&'static str),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when a signal ended the process.
    pub code: Option<i32>,
    /// Whether the client asked for the exit.
    pub requested: bool,
}

pub type CrashListener = Box<dyn Fn(&ProcessExit) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Close stdin, wait out the grace period, then kill.
    Graceful,
    Kill,
}

type CrashListeners = Arc<Mutex<Vec<CrashListener>>>;

fn lock_listeners(listeners: &Mutex<Vec<CrashListener>>) -> MutexGuard<'_, Vec<CrashListener>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control side of a running engine. Dropping it stops the engine.
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: Mutex<Option<oneshot::Sender<StopMode>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    crash_listeners: CrashListeners,
}

impl ProcessHandle {
    /// Starts the exit monitor for `child`.
    fn monitor(child: Child, correlator: Arc<Correlator>, grace: Duration) -> Self {
        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let crash_listeners: CrashListeners = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(monitor_process(
            child,
            stop_rx,
            correlator,
            grace,
            exit_tx,
            crash_listeners.clone(),
        ));

        Self {
            pid,
            stop_tx: Mutex::new(Some(stop_tx)),
            exit_rx,
            crash_listeners,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn on_crash(&self, listener: CrashListener) {
        lock_listeners(&self.crash_listeners).push(listener);
    }

    /// Asks the monitor for a graceful stop. Later requests are no-ops.
    pub fn request_shutdown(&self) {
        self.stop(StopMode::Graceful);
    }

    fn kill(&self) {
        self.stop(StopMode::Kill);
    }

    fn stop(&self, mode: StopMode) {
        let tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The monitor is gone once the process has exited.
            let _ = tx.send(mode);
        }
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = rx.wait_for(Option::is_some).await.map(|exit| *exit);
        exit.ok().flatten().unwrap_or(ProcessExit {
            code: None,
            requested: true,
        })
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Stop(StopMode),
}

async fn monitor_process(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<StopMode>,
    correlator: Arc<Correlator>,
    grace: Duration,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    crash_listeners: CrashListeners,
) {
    // A dropped sender means the owning connection is gone.
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        mode = &mut stop_rx => Wake::Stop(mode.unwrap_or(StopMode::Graceful)),
    };

    let (status, requested) = match wake {
        Wake::Exited(status) => (status, false),
        Wake::Stop(mode) => (stop_child(&mut child, &correlator, mode, grace).await, true),
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!("Failed to wait for engine process: {}", e);
            None
        }
    };
    let exit = ProcessExit { code, requested };

    if requested {
        tracing::info!("Engine stopped (code {:?})", code);
        correlator.close(LossReason::Shutdown).await;
    } else {
        tracing::error!("Engine exited unexpectedly (code {:?})", code);
        correlator.close(LossReason::ProcessExited(code)).await;

        // Taken out of the lock so a listener may register further listeners.
        let listeners = std::mem::take(&mut *lock_listeners(&crash_listeners));
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&exit))).is_err() {
                tracing::error!("Crash listener panicked");
            }
        }
    }

    let _ = exit_tx.send(Some(exit));
}

async fn stop_child(
    child: &mut Child,
    correlator: &Correlator,
    mode: StopMode,
    grace: Duration,
) -> io::Result<ExitStatus> {
    correlator.state_cell().degrade("shutting down");

    if mode == StopMode::Graceful {
        // End of input asks the engine to exit.
        correlator.writer().close().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => tracing::warn!("Engine did not exit within {:?}, killing it", grace),
        }
    }

    child.kill().await?;
    child.wait().await
}

fn forward_stderr(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).split(b'\n');
        loop {
            match lines.next_segment().await {
                Ok(Some(line)) => {
                    let line = String::from_utf8_lossy(&line);
                    tracing::info!(target: ENGINE_LOG_TARGET, "{}", line.trim_end());
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Engine stderr closed: {}", e);
                    break;
                }
            }
        }
    });
}

/// Starts engine processes from one configuration.
///
/// Every connection started here draws request ids from the same counter, so
/// ids never repeat across restarts.
pub struct Supervisor {
    config: ClientConfig,
    ids: Arc<IdAllocator>,
}

impl Supervisor {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ids: Arc::new(IdAllocator::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawns the engine and waits for it to answer the handshake.
    pub async fn start(&self) -> Result<Connection> {
        let engine = &self.config.engine;
        let rpc = &self.config.rpc;

        let mut command = Command::new(&engine.executable);
        command
            .args(&engine.args)
            .envs(&engine.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = engine.working_dir {
            command.current_dir(dir);
        }
        if let Some(ref dir) = engine.accounts_dir {
            command.env(ACCOUNTS_PATH_ENV, dir);
        }

        tracing::info!("Starting engine {}", engine.executable);
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            executable: engine.executable.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let (reader, writer) = framer::framed(stdout, stdin, rpc.frame_format, rpc.max_frame_size);
        let correlator = Arc::new(Correlator::new(
            self.ids.clone(),
            writer,
            ConnectionState::Starting,
        ));
        let grace = rpc.shutdown_grace();
        let process = ProcessHandle::monitor(child, correlator.clone(), grace);
        let pid = process.pid();
        let reader_task = connection::spawn_reader(reader, correlator.clone(), Some(grace));
        let connection = Connection::assemble(correlator, reader_task, Some(process));

        match self.handshake(&connection).await {
            Ok(()) => {
                tracing::info!("Engine ready (pid {:?})", pid);
                Ok(connection)
            }
            Err(e) => {
                tracing::error!("Engine failed to start: {}", e);
                if matches!(e, SupervisorError::StartupTimeout(_)) {
                    if let Some(process) = connection.process() {
                        process.kill();
                    }
                }
                connection.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, connection: &Connection) -> Result<()> {
        let correlator = connection.correlator();
        let rpc = &self.config.rpc;

        if let Some(ref method) = rpc.handshake_method {
            let startup = rpc.startup_timeout();
            let answer = tokio::time::timeout(startup, async {
                correlator.submit_unchecked(method, Vec::new()).await?.await
            })
            .await;

            match answer {
                Err(_) => return Err(SupervisorError::StartupTimeout(startup)),
                Ok(Ok(info)) => tracing::debug!("Handshake answer: {}", info),
                Ok(Err(RpcError::TransportLost(LossReason::ProcessExited(code)))) => {
                    return Err(SupervisorError::ProcessExited(code))
                }
                Ok(Err(e @ RpcError::TransportLost(_))) | Ok(Err(e @ RpcError::Send(_))) => {
                    return Err(self.exit_during_startup(connection, e).await)
                }
                Ok(Err(e)) => return Err(SupervisorError::Handshake(e)),
            }
        }

        if correlator.state_cell().mark_ready() {
            Ok(())
        } else {
            let e = RpcError::NotReady(correlator.state());
            Err(self.exit_during_startup(connection, e).await)
        }
    }

    /// Prefers the exit code over a transport error when the process is
    /// already on its way out.
    async fn exit_during_startup(&self, connection: &Connection, e: RpcError) -> SupervisorError {
        let exited = match connection.process() {
            Some(process) => tokio::time::timeout(self.config.rpc.shutdown_grace(), process.wait())
                .await
                .ok(),
            None => None,
        };
        match exited {
            Some(exit) => SupervisorError::ProcessExited(exit.code),
            None => SupervisorError::Handshake(e),
        }
    }

    /// Shuts `old` down and starts a fresh engine with the same id counter.
    pub async fn restart(&self, old: &Connection) -> Result<Connection> {
        if let Some(exit) = old.shutdown().await {
            tracing::info!("Previous engine exited (code {:?})", exit.code);
        }
        self.start().await
    }
}
