use std::time::Duration;

/// Sessions untouched for this long are buried by the sweep.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a buried child gets to exit before it is killed.
pub const DEFAULT_BURY_GRACE: Duration = Duration::from_secs(2);

/// Output chunks buffered per session before the reader thread blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Period of the supervisor sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Notifications buffered per subscriber before it starts losing them.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Tunables for a [`Multiplexer`](crate::Multiplexer).
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Command line for sessions that don't name one. `None` runs the
    /// user's default shell.
    pub default_command: Option<String>,
    pub idle_timeout: Duration,
    pub bury_grace: Duration,
    pub queue_capacity: usize,
    pub notify_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            default_command: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            bury_grace: DEFAULT_BURY_GRACE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}
