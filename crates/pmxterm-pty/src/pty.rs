use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// How often a dying child is polled while waiting for it to exit.
const REAP_POLL: Duration = Duration::from_millis(10);

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("invalid command line {0:?}")]
    InvalidCommand(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
    #[error("session is not alive")]
    Closed,
    #[error("PTY input closed")]
    InputClosed,
}

/// Owns a portable-pty child process, master pair, reader, and writer.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn `command` on a new PTY of the given dimensions.
    ///
    /// The command line is split shell-style. `None` runs the user's default
    /// shell (`$SHELL` or `/bin/sh`).
    pub fn spawn(command: Option<&str>, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let argv = command_argv(command)?;

        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {:?}: {e}", argv[0])))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let pid = child.process_id();

        Ok(Self {
            master: pair.master,
            reader: Some(reader),
            writer: Some(writer),
            child,
            pid,
        })
    }

    /// OS process id of the child, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the blocking output reader to a dedicated thread.
    ///
    /// Returns `None` once the reader has been taken.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Hand the blocking input writer to a dedicated thread.
    ///
    /// Returns `None` once the writer has been taken; [`write`](Self::write)
    /// then fails with [`PtyError::Closed`].
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// Write bytes to the PTY master (user input -> child).
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self.writer.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Check if the child process is still alive.
    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Get the child process exit status if it has exited.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Terminate the child and reap it, returning its exit code.
    ///
    /// Sends SIGTERM and SIGHUP, waits up to `grace` for the child to exit,
    /// then kills it outright and blocks until it is reaped.
    pub fn terminate(&mut self, grace: Duration) -> Result<u32, PtyError> {
        if let Some(code) = self.try_wait() {
            return Ok(code);
        }

        self.signal_hangup();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(code) = self.try_wait() {
                return Ok(code);
            }
            thread::sleep(REAP_POLL);
        }

        log::warn!(
            "pid {:?} still running {grace:?} after SIGTERM, killing",
            self.pid
        );
        if let Err(e) = self.child.kill() {
            // Lost the race with a natural exit; wait() below still reaps.
            log::debug!("kill pid {:?}: {e}", self.pid);
        }
        let status = self.child.wait()?;
        Ok(status.exit_code())
    }

    #[cfg(unix)]
    fn signal_hangup(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        // Interactive shells ignore SIGTERM; SIGHUP is what a closing terminal delivers.
        for signal in [libc::SIGTERM, libc::SIGHUP] {
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(pid as libc::pid_t, signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_hangup(&mut self) {
        let _ = self.child.kill();
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Split a command line into argv, defaulting to the user's shell.
fn command_argv(command: Option<&str>) -> Result<Vec<String>, PtyError> {
    let Some(line) = command else {
        return Ok(vec![default_shell()]);
    };
    let argv =
        shell_words::split(line).map_err(|_| PtyError::InvalidCommand(line.to_string()))?;
    if argv.is_empty() {
        return Err(PtyError::InvalidCommand(line.to_string()));
    }
    Ok(argv)
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
