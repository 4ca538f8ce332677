use std::sync::Arc;

use pmxterm_proto::{Announcement, Command, Endpoint, Notification, Subscribe};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::{forward_notifications, CommandConnection};
use crate::error::{ClientError, Result};
use crate::session::Session;

/// Notifications buffered per local listener.
const EVENT_CAPACITY: usize = 256;

struct Inner {
    name: String,
    announcement: Announcement,
    commands: CommandConnection,
    // Never read; new receivers are cloned from it. Closes when the
    // forwarder's sender drops.
    notifications: broadcast::Receiver<Notification>,
    forwarder: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Handle on a running backend: its command channel plus a local fan-out
/// of its notifications. Cheap to clone.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    /// Connect to both channels named in `announcement`.
    pub async fn connect(name: impl Into<String>, announcement: Announcement) -> Result<Self> {
        let commands = CommandConnection::connect(&announcement.multiplexer).await?;
        let (tx, notifications) = broadcast::channel(EVENT_CAPACITY);
        let forwarder =
            forward_notifications(&announcement.notifier, Subscribe::default(), tx).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                announcement,
                commands,
                notifications,
                forwarder,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn announcement(&self) -> &Announcement {
        &self.inner.announcement
    }

    /// Run `command` and return the raw result.
    pub async fn execute(&self, command: &Command) -> Result<Value> {
        self.inner.commands.call(&command.to_request()).await
    }

    /// Run `command` and decode its result as `T`.
    pub(crate) async fn query<T: DeserializeOwned>(&self, command: &Command) -> Result<T> {
        let value = self.execute(command).await?;
        serde_json::from_value(value.clone()).map_err(|_| ClientError::UnexpectedResult {
            verb: command.verb(),
            value,
        })
    }

    pub async fn platform(&self) -> Result<String> {
        self.query(&Command::Platform).await
    }

    pub async fn sessions(&self) -> Result<Vec<String>> {
        self.query(&Command::Sessions).await
    }

    pub async fn bury_all(&self) -> Result<bool> {
        self.query(&Command::BuryAll).await
    }

    /// Ask the backend to push every notification to `address` as well.
    pub async fn setup_channel(&self, address: Endpoint) -> Result<bool> {
        self.query(&Command::SetupChannel { address }).await
    }

    /// Bury every session on the backend.
    pub async fn close(&self) -> Result<bool> {
        self.bury_all().await
    }

    /// A new 80x24 session stub. Nothing runs until it is started.
    pub fn session(&self) -> Session {
        self.session_with_size(80, 24)
    }

    pub fn session_with_size(&self, cols: u16, rows: u16) -> Session {
        Session::new(self.clone(), cols, rows)
    }

    /// Every notification the backend publishes from now on. The receiver
    /// closes once the backend's notification channel does.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.resubscribe()
    }
}
