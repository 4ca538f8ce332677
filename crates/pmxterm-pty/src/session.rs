use std::mem;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pmxterm_vt::{Screen, Terminal, TerminalFactory};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::pty::{PtyError, PtyHandle};
use crate::supervisor;

/// Opaque client-chosen session identifier.
pub type SessionId = String;

/// Where a session is in its one-way lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unborn,
    Alive,
    Dead,
}

/// Resources that exist only while the child runs.
struct Live {
    pty: PtyHandle,
    terminal: Box<dyn Terminal>,
    output: mpsc::Receiver<Vec<u8>>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    drain_budget: usize,
}

enum Lifecycle {
    Unborn,
    Alive(Live),
    Dead,
}

/// One interactive session: a PTY child, its output queue and the terminal
/// that output is applied to.
pub struct Session {
    id: SessionId,
    cols: u16,
    rows: u16,
    created_at: DateTime<Utc>,
    last_change: DateTime<Utc>,
    last_seen: Instant,
    lifecycle: Lifecycle,
}

impl Session {
    /// A fresh, unborn record.
    pub fn new(id: impl Into<SessionId>, cols: u16, rows: u16) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            cols,
            rows,
            created_at: now,
            last_change: now,
            last_seen: Instant::now(),
            lifecycle: Lifecycle::Unborn,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn `command` and start its reader thread.
    ///
    /// Only an unborn session can be spawned. On failure the session is
    /// dead.
    pub fn spawn(
        &mut self,
        command: Option<&str>,
        factory: &TerminalFactory,
        queue_capacity: usize,
    ) -> Result<(), PtyError> {
        if !matches!(self.lifecycle, Lifecycle::Unborn) {
            return Err(PtyError::Closed);
        }
        self.lifecycle = Lifecycle::Dead;

        let mut pty = PtyHandle::spawn(command, self.cols, self.rows)?;
        let (Some(reader), Some(writer)) = (pty.take_reader(), pty.take_writer()) else {
            let _ = pty.terminate(Duration::ZERO);
            return Err(PtyError::SpawnFailed("PTY I/O already taken".to_string()));
        };

        let (input, input_rx) = mpsc::unbounded_channel();
        let writer = match supervisor::spawn_writer(&self.id, writer, input_rx) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = pty.terminate(Duration::ZERO);
                return Err(e.into());
            }
        };

        let capacity = queue_capacity.max(1);
        let (tx, output) = mpsc::channel(capacity);
        let reader = match supervisor::spawn_reader(&self.id, reader, tx) {
            Ok(handle) => handle,
            Err(e) => {
                // Dropping `input` ends the writer thread.
                let _ = pty.terminate(Duration::ZERO);
                return Err(e.into());
            }
        };

        self.lifecycle = Lifecycle::Alive(Live {
            pty,
            terminal: factory(self.cols, self.rows),
            output,
            input,
            reader: Some(reader),
            writer: Some(writer),
            drain_budget: capacity,
        });
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        match self.lifecycle {
            Lifecycle::Unborn => SessionState::Unborn,
            Lifecycle::Alive(_) => SessionState::Alive,
            Lifecycle::Dead => SessionState::Dead,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == SessionState::Alive
    }

    /// Child pid, reported only while alive.
    pub fn pid(&self) -> Option<u32> {
        self.live().and_then(|live| live.pty.pid())
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wall-clock time output was last applied to the terminal.
    pub fn last_change(&self) -> DateTime<Utc> {
        self.last_change
    }

    /// Mark the session as in use.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Resize both the PTY and the terminal.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let live = self.live_mut().ok_or(PtyError::Closed)?;
        live.pty.resize(cols, rows)?;
        live.terminal.resize(cols, rows);
        self.cols = cols;
        self.rows = rows;
        Ok(())
    }

    /// Queue keystrokes for the child.
    ///
    /// The terminal translates them first (newlines, application cursor
    /// keys); the untranslated bytes are mirrored into its echo path. The
    /// bytes reach the PTY on the writer thread, so this never blocks on a
    /// child that has stopped reading.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let live = self.live_mut().ok_or(PtyError::Closed)?;
        let translated = live.terminal.translate_input(data);
        live.input
            .send(translated)
            .map_err(|_| PtyError::InputClosed)?;
        live.terminal.echo(data);
        Ok(())
    }

    /// Apply queued child output to the terminal without blocking.
    ///
    /// At most one queue's worth of chunks is taken per call so a chatty
    /// child cannot hold the table lock indefinitely. Replies the terminal
    /// produces are queued back to the child. Returns whether any bytes
    /// were applied.
    pub fn drain(&mut self) -> bool {
        let Lifecycle::Alive(live) = &mut self.lifecycle else {
            return false;
        };

        let mut applied = false;
        for _ in 0..live.drain_budget {
            match live.output.try_recv() {
                Ok(chunk) => {
                    live.terminal.feed(&chunk);
                    applied = true;
                }
                Err(_) => break,
            }
        }
        if !applied {
            return false;
        }

        let replies = live.terminal.take_replies();
        if !replies.is_empty() && live.input.send(replies).is_err() {
            log::debug!("session {}: input closed, dropping terminal replies", self.id);
        }
        self.last_change = Utc::now();
        true
    }

    /// Snapshot of the screen, or `None` unless alive.
    pub fn dump(&self) -> Option<Screen> {
        self.live().map(|live| live.terminal.snapshot())
    }

    /// Whether the child has exited on its own.
    pub fn child_exited(&mut self) -> bool {
        self.live_mut()
            .is_some_and(|live| live.pty.try_wait().is_some())
    }

    /// Terminate and reap the child, release every live resource and mark
    /// the session dead. Returns the child's exit code when one was reaped.
    pub fn bury(&mut self, grace: Duration) -> Option<u32> {
        let Lifecycle::Alive(live) = mem::replace(&mut self.lifecycle, Lifecycle::Dead) else {
            return None;
        };
        let Live {
            mut pty,
            terminal,
            output,
            input,
            reader,
            writer,
            ..
        } = live;

        // Unblocks a reader parked on a full queue.
        drop(output);
        drop(input);
        drop(terminal);

        let code = match pty.terminate(grace) {
            Ok(code) => Some(code),
            Err(e) => {
                log::warn!("session {}: reaping child failed: {e}", self.id);
                None
            }
        };
        drop(pty);

        for (kind, handle) in [("reader", reader), ("writer", writer)] {
            let Some(handle) = handle else { continue };
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Still parked in the PTY; it exits once the PTY reports EOF or EIO.
                log::debug!("session {}: detaching {kind} thread", self.id);
            }
        }
        code
    }

    fn live(&self) -> Option<&Live> {
        match &self.lifecycle {
            Lifecycle::Alive(live) => Some(live),
            _ => None,
        }
    }

    fn live_mut(&mut self) -> Option<&mut Live> {
        match &mut self.lifecycle {
            Lifecycle::Alive(live) => Some(live),
            _ => None,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_alive() {
            self.bury(Duration::ZERO);
        }
    }
}
