use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Endpoint;

/// One command-channel request: `{"command": "<verb>", "args": [...]}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One command-channel response.
///
/// `result` is `null` whenever `error` is set. Errors are informational:
/// clients treat them like any other `null`/`false` sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            result: result.into(),
            error: None,
        }
    }

    pub fn unknown_command(verb: &str) -> Self {
        Self::error(format!("unknown command: {verb}"))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// What happened to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// New output was applied; re-fetch with `dump`.
    Changed,
    /// The session is gone.
    Buried,
}

/// A change hint published on the notification channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub session: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn changed(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            kind: NotificationKind::Changed,
        }
    }

    pub fn buried(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            kind: NotificationKind::Buried,
        }
    }
}

/// Optional first line a notification subscriber sends. An empty list
/// subscribes to every session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(default)]
    pub subscribe: Vec<String>,
}

impl Subscribe {
    pub fn matches(&self, session: &str) -> bool {
        self.subscribe.is_empty() || self.subscribe.iter().any(|s| s == session)
    }
}

/// The line a backend prints on stdout once both channels are bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub multiplexer: Endpoint,
    pub notifier: Endpoint,
}

impl Announcement {
    /// Parse the announcement out of captured startup output, taking the
    /// last line that decodes.
    pub fn from_output(output: &str) -> Option<Self> {
        output
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .find_map(|line| serde_json::from_str(line).ok())
    }
}

/// Encode `value` as a single newline-terminated JSON line.
pub fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}
