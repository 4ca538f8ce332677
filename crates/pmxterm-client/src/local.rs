//! A backend process owned by this client.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pmxterm_proto::Announcement;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::error::{ClientError, Result};

/// How long a fresh backend gets to print its announcement.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits after SIGTERM before killing the backend.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendState {
    NotRunning,
    Starting,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    FailedToStart,
    Crashed,
    ReadError,
    WriteError,
    Unknown,
}

/// Lifecycle events of a [`LocalBackend`].
///
/// Every run that got as far as spawning a process ends with exactly one
/// `Finished`, carrying the exit code (`-1` when there is none).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Started,
    Finished(i32),
    Failed(FailureKind),
}

/// How to launch the backend binary.
#[derive(Clone, Debug)]
pub struct LocalOptions {
    pub program: PathBuf,
    /// `ipc` or `tcp`.
    pub transport: String,
    /// Bind address; tcp only.
    pub address: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra arguments appended after the transport flags.
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub startup_timeout: Duration,
}

impl LocalOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.transport.clone()];
        if let Some(address) = &self.address {
            args.push("-a".to_string());
            args.push(address.clone());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

impl Default for LocalOptions {
    fn default() -> Self {
        let transport = if cfg!(target_os = "linux") { "ipc" } else { "tcp" };
        Self {
            program: PathBuf::from("pmxterm-backend"),
            transport: transport.to_string(),
            address: None,
            working_dir: None,
            args: Vec::new(),
            envs: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

struct Run {
    backend: Backend,
    pid: Option<u32>,
    stopping: Arc<AtomicBool>,
    watcher: JoinHandle<i32>,
}

/// Spawns the backend binary, connects to it and reports its lifecycle.
pub struct LocalBackend {
    options: LocalOptions,
    state: Arc<Mutex<BackendState>>,
    events: broadcast::Sender<BackendEvent>,
    run: Option<Run>,
}

impl LocalBackend {
    pub fn new(options: LocalOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            options,
            state: Arc::new(Mutex::new(BackendState::NotRunning)),
            events,
            run: None,
        }
    }

    pub fn options(&self) -> &LocalOptions {
        &self.options
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe before [`start`](Self::start) to see every event.
    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    /// The connected backend while running.
    pub fn backend(&self) -> Option<Backend> {
        match self.state() {
            BackendState::Running => self.run.as_ref().map(|run| run.backend.clone()),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.run.as_ref().and_then(|run| run.pid)
    }

    fn set_state(&self, state: BackendState) {
        set_state(&self.state, state);
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// Launch the backend, wait for its announcement and connect.
    pub async fn start(&mut self) -> Result<Backend> {
        if self.state() != BackendState::NotRunning {
            return Err(ClientError::AlreadyRunning);
        }
        self.set_state(BackendState::Starting);

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("failed to launch {}: {e}", self.options.program.display());
                self.emit(BackendEvent::Failed(FailureKind::FailedToStart));
                self.emit(BackendEvent::Finished(-1));
                self.set_state(BackendState::NotRunning);
                return Err(ClientError::Start(e.to_string()));
            }
        };
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            return Err(self
                .abort_start(child, FailureKind::FailedToStart, "no stdout".to_string())
                .await);
        };
        let mut lines = BufReader::new(stdout).lines();

        let waited =
            tokio::time::timeout(self.options.startup_timeout, read_announcement(&mut lines)).await;
        let announcement = match waited {
            Ok(Ok(Some(announcement))) => announcement,
            Ok(Ok(None)) => {
                let reason = "backend exited before announcing its endpoints".to_string();
                return Err(self.abort_start(child, FailureKind::FailedToStart, reason).await);
            }
            Ok(Err(e)) => {
                return Err(self.abort_start(child, FailureKind::ReadError, e.to_string()).await);
            }
            Err(_) => {
                let reason = format!(
                    "no announcement within {:?}",
                    self.options.startup_timeout
                );
                return Err(self.abort_start(child, FailureKind::FailedToStart, reason).await);
            }
        };

        let backend = match Backend::connect("local", announcement).await {
            Ok(backend) => backend,
            Err(e) => {
                return Err(self.abort_start(child, FailureKind::FailedToStart, e.to_string()).await);
            }
        };

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log::info!("backend: {line}");
            }
        });

        let stopping = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_exit(
            child,
            Arc::clone(&stopping),
            self.events.clone(),
            Arc::clone(&self.state),
        ));

        self.run = Some(Run {
            backend: backend.clone(),
            pid,
            stopping,
            watcher,
        });
        self.set_state(BackendState::Running);
        self.emit(BackendEvent::Started);
        log::info!("local backend started (pid {pid:?})");
        Ok(backend)
    }

    /// Bury every session, SIGTERM the backend and wait for it to exit.
    /// Returns the exit code.
    pub async fn stop(&mut self) -> Result<i32> {
        let Some(mut run) = self.run.take() else {
            return Err(ClientError::NotRunning);
        };
        run.stopping.store(true, Ordering::SeqCst);

        if !run.watcher.is_finished() {
            if let Err(e) = run.backend.bury_all().await {
                log::warn!("bury_all before stop failed: {e}");
                self.emit(BackendEvent::Failed(FailureKind::WriteError));
            }
            if let Some(pid) = run.pid {
                send_signal(pid, libc::SIGTERM);
            }
        }
        drop(run.backend);

        let joined = match tokio::time::timeout(STOP_TIMEOUT, &mut run.watcher).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!("backend ignored SIGTERM for {STOP_TIMEOUT:?}, killing");
                if let Some(pid) = run.pid {
                    send_signal(pid, libc::SIGKILL);
                }
                run.watcher.await
            }
        };
        joined.map_err(|e| {
            self.emit(BackendEvent::Failed(FailureKind::Unknown));
            ClientError::Io(std::io::Error::other(e))
        })
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.options.program);
        command
            .args(self.options.command_args())
            .envs(self.options.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.options.working_dir {
            command.current_dir(dir);
        }
        command.spawn()
    }

    /// Kill a half-started backend, report the failure and finish the run.
    async fn abort_start(&mut self, mut child: Child, kind: FailureKind, reason: String) -> ClientError {
        log::error!("local backend failed to start: {reason}");
        let _ = child.start_kill();
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        self.emit(BackendEvent::Failed(kind));
        self.emit(BackendEvent::Finished(code));
        self.set_state(BackendState::NotRunning);
        ClientError::Start(reason)
    }
}

fn set_state(state: &Mutex<BackendState>, next: BackendState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

async fn read_announcement(lines: &mut Lines<BufReader<ChildStdout>>) -> std::io::Result<Option<Announcement>> {
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<Announcement>(line.trim()) {
            Ok(announcement) => return Ok(Some(announcement)),
            Err(_) => log::info!("backend: {line}"),
        }
    }
    Ok(None)
}

/// Wait for the backend to exit and finish the run. An exit nobody asked
/// for is reported as a crash first.
async fn watch_exit(
    mut child: Child,
    stopping: Arc<AtomicBool>,
    events: broadcast::Sender<BackendEvent>,
    state: Arc<Mutex<BackendState>>,
) -> i32 {
    let code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            log::error!("waiting for backend failed: {e}");
            let _ = events.send(BackendEvent::Failed(FailureKind::Unknown));
            -1
        }
    };
    if !stopping.load(Ordering::SeqCst) {
        log::warn!("backend exited unexpectedly with code {code}");
        let _ = events.send(BackendEvent::Failed(FailureKind::Crashed));
    }
    set_state(&state, BackendState::NotRunning);
    let _ = events.send(BackendEvent::Finished(code));
    code
}

fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        log::debug!("kill({pid}, {signal}): {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<BackendEvent>) -> Vec<BackendEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_command_args() {
        let options = LocalOptions {
            transport: "tcp".to_string(),
            address: Some("127.0.0.1".to_string()),
            args: vec!["--sweep-interval-ms".to_string(), "5".to_string()],
            ..LocalOptions::default()
        };
        assert_eq!(
            options.command_args(),
            ["-t", "tcp", "-a", "127.0.0.1", "--sweep-interval-ms", "5"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let mut local = LocalBackend::new(LocalOptions::new("/nonexistent/pmxterm-backend"));
        let mut rx = local.events();

        assert!(matches!(local.start().await, Err(ClientError::Start(_))));
        assert_eq!(local.state(), BackendState::NotRunning);
        assert_eq!(
            drain(&mut rx),
            [
                BackendEvent::Failed(FailureKind::FailedToStart),
                BackendEvent::Finished(-1)
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_before_announcing_fails_to_start() {
        // Ignores its arguments and exits 1 without printing anything.
        let mut local = LocalBackend::new(LocalOptions::new("/bin/false"));
        let mut rx = local.events();

        assert!(matches!(local.start().await, Err(ClientError::Start(_))));
        assert_eq!(local.state(), BackendState::NotRunning);
        assert_eq!(
            drain(&mut rx),
            [
                BackendEvent::Failed(FailureKind::FailedToStart),
                BackendEvent::Finished(1)
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut local = LocalBackend::new(LocalOptions::default());
        assert!(matches!(local.stop().await, Err(ClientError::NotRunning)));
        assert!(local.backend().is_none());
    }
}
