use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use pmxterm_proto::{Command, Notification, NotificationKind, Payload};
use pmxterm_vt::Screen;
use tokio::sync::broadcast;

use crate::backend::Backend;
use crate::error::Result;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(0);

/// A fresh id: wall-clock microseconds, our pid and a per-process counter.
pub fn generate_id() -> String {
    format!(
        "{}-{}-{}",
        Utc::now().timestamp_micros(),
        std::process::id(),
        NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
    )
}

/// Client-side stub for one backend session.
///
/// The remote session only exists once [`start`](Session::start) succeeds.
/// `write` and `dump` keep it alive first, so a session that was buried
/// in the meantime reports `false`/`None` instead of being recreated.
pub struct Session {
    backend: Backend,
    id: String,
    cols: u16,
    rows: u16,
    started: bool,
}

impl Session {
    pub(crate) fn new(backend: Backend, cols: u16, rows: u16) -> Self {
        Self {
            backend,
            id: generate_id(),
            cols,
            rows,
            started: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawn `command` (or the backend's default shell) for this session.
    pub async fn start(&mut self, command: Option<&str>) -> Result<bool> {
        let started = self
            .backend
            .query(&Command::Keepalive {
                id: self.id.clone(),
                cols: self.cols,
                rows: self.rows,
                command: command.map(str::to_string),
            })
            .await?;
        self.started = started;
        Ok(started)
    }

    pub async fn keepalive(&self) -> Result<bool> {
        self.backend
            .query(&Command::Keepalive {
                id: self.id.clone(),
                cols: self.cols,
                rows: self.rows,
                command: None,
            })
            .await
    }

    /// Record new dimensions; a started session is resized right away.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<bool> {
        self.cols = cols;
        self.rows = rows;
        if self.started {
            self.keepalive().await
        } else {
            Ok(true)
        }
    }

    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<bool> {
        if !self.keepalive().await? {
            return Ok(false);
        }
        let data = data.as_ref();
        let payload = match std::str::from_utf8(data) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Bytes(data.to_vec()),
        };
        self.backend
            .query(&Command::Write {
                id: self.id.clone(),
                data: payload,
            })
            .await
    }

    pub async fn dump(&self) -> Result<Option<Screen>> {
        if !self.keepalive().await? {
            return Ok(None);
        }
        self.backend
            .query(&Command::Dump {
                id: self.id.clone(),
            })
            .await
    }

    /// Bury the remote session. The id can never be used again.
    pub async fn close(&self) -> Result<bool> {
        self.backend
            .query(&Command::Bury {
                id: self.id.clone(),
            })
            .await
    }

    pub async fn is_alive(&self) -> Result<bool> {
        self.backend
            .query(&Command::IsAlive {
                id: self.id.clone(),
            })
            .await
    }

    pub async fn pid(&self) -> Result<Option<u32>> {
        self.backend
            .query(&Command::Pid {
                id: self.id.clone(),
            })
            .await
    }

    pub async fn last_change(&self) -> Result<Option<DateTime<Utc>>> {
        self.backend
            .query(&Command::LastChange {
                id: self.id.clone(),
            })
            .await
    }

    /// Notifications for this session only.
    pub fn updates(&self) -> SessionUpdates {
        SessionUpdates {
            id: self.id.clone(),
            rx: self.backend.notifications(),
        }
    }
}

/// Receiver of one session's notifications.
pub struct SessionUpdates {
    id: String,
    rx: broadcast::Receiver<Notification>,
}

impl SessionUpdates {
    /// The next event for this session, or `None` once the backend's
    /// notification channel is gone. Events lost to lag are skipped.
    pub async fn recv(&mut self) -> Option<NotificationKind> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if notification.session == self.id => {
                    return Some(notification.kind)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::debug!("session {}: {missed} notifications lost", self.id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
