//! Command-line and environment configuration for the backend binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use pmxterm_proto::Endpoint;
use pmxterm_pty::config::{
    MultiplexerConfig, DEFAULT_BURY_GRACE, DEFAULT_IDLE_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SWEEP_INTERVAL,
};

/// Socket family both channels listen on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Unix domain sockets in the socket directory.
    Ipc,
    /// Loopback (or `--address`) TCP.
    Tcp,
}

#[derive(Debug, Parser)]
#[command(name = "pmxterm-backend", version, about = "pmxterm terminal session backend")]
pub struct BackendArgs {
    /// Socket type for the command and notification channels.
    #[arg(short = 't', long, value_enum, default_value_t = Transport::Ipc, env = "PMX_TRANSPORT")]
    pub transport: Transport,

    /// Bind address for the tcp transport [default: 127.0.0.1].
    #[arg(short = 'a', long, env = "PMX_ADDRESS")]
    pub address: Option<IpAddr>,

    /// Port of the command (request/response) channel; 0 picks a free one.
    #[arg(long, alias = "rep-port", default_value_t = 0, env = "PMX_COMMAND_PORT")]
    pub command_port: u16,

    /// Port of the notification channel; 0 picks a free one.
    #[arg(long, alias = "pub-port", default_value_t = 0, env = "PMX_NOTIFY_PORT")]
    pub notify_port: u16,

    /// Directory for ipc sockets [default: the system temp dir].
    #[arg(long, env = "PMX_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,

    /// Command line for sessions that don't name one [default: $SHELL or /bin/sh].
    #[arg(long, env = "PMX_SHELL")]
    pub shell: Option<String>,

    /// Bury sessions nobody has touched for this many seconds.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs(), env = "PMX_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    /// Period of the output sweep in milliseconds.
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL.as_millis() as u64, env = "PMX_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// How long a buried child gets between SIGTERM and SIGKILL, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_BURY_GRACE.as_millis() as u64, env = "PMX_BURY_GRACE_MS")]
    pub bury_grace_ms: u64,

    /// Output chunks queued per session before its reader blocks.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, env = "PMX_QUEUE_CAPACITY")]
    pub queue_capacity: usize,
}

impl BackendArgs {
    /// Reject combinations clap can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transport == Transport::Ipc
            && (self.address.is_some() || self.command_port != 0 || self.notify_port != 0)
        {
            bail!("--address and ports only apply to the tcp transport");
        }
        if self.idle_timeout_secs == 0 {
            bail!("--idle-timeout-secs must be at least 1");
        }
        if self.sweep_interval_ms == 0 {
            bail!("--sweep-interval-ms must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("--queue-capacity must be at least 1");
        }
        Ok(())
    }

    /// Where the command and notification channels should listen.
    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        match self.transport {
            Transport::Ipc => {
                let dir = self.socket_dir.clone().unwrap_or_else(std::env::temp_dir);
                let pid = std::process::id();
                (
                    Endpoint::Ipc(dir.join(format!("pmx-{pid}-cmd.sock"))),
                    Endpoint::Ipc(dir.join(format!("pmx-{pid}-notify.sock"))),
                )
            }
            Transport::Tcp => {
                let ip = self.address.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                (
                    Endpoint::Tcp(SocketAddr::new(ip, self.command_port)),
                    Endpoint::Tcp(SocketAddr::new(ip, self.notify_port)),
                )
            }
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            default_command: self.shell.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            bury_grace: Duration::from_millis(self.bury_grace_ms),
            queue_capacity: self.queue_capacity,
            ..MultiplexerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> BackendArgs {
        BackendArgs::try_parse_from(std::iter::once("pmxterm-backend").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.transport, Transport::Ipc);
        args.validate().unwrap();

        let config = args.multiplexer_config();
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.bury_grace, DEFAULT_BURY_GRACE);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(args.sweep_interval(), DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn test_ipc_endpoints_live_in_socket_dir() {
        let args = parse(&["--socket-dir", "/tmp/pmx-test"]);
        let (cmd, notify) = args.endpoints();
        let (Endpoint::Ipc(cmd), Endpoint::Ipc(notify)) = (cmd, notify) else {
            panic!("expected ipc endpoints");
        };
        assert!(cmd.starts_with("/tmp/pmx-test"));
        assert!(notify.starts_with("/tmp/pmx-test"));
        assert_ne!(cmd, notify);
    }

    #[test]
    fn test_tcp_endpoints() {
        let args = parse(&["-t", "tcp", "--command-port", "4000", "--pub-port", "4001"]);
        args.validate().unwrap();
        let (cmd, notify) = args.endpoints();
        assert_eq!(cmd, "tcp://127.0.0.1:4000".parse::<Endpoint>().unwrap());
        assert_eq!(notify, "tcp://127.0.0.1:4001".parse::<Endpoint>().unwrap());
    }

    #[test]
    fn test_tcp_custom_address() {
        let args = parse(&["-t", "tcp", "-a", "0.0.0.0"]);
        let (cmd, _) = args.endpoints();
        assert_eq!(cmd, "tcp://0.0.0.0:0".parse::<Endpoint>().unwrap());
    }

    #[test]
    fn test_ipc_with_address_is_rejected() {
        assert!(parse(&["-t", "ipc", "-a", "127.0.0.1"]).validate().is_err());
        assert!(parse(&["--command-port", "4000"]).validate().is_err());
    }

    #[test]
    fn test_zero_values_are_rejected() {
        assert!(parse(&["--sweep-interval-ms", "0"]).validate().is_err());
        assert!(parse(&["--queue-capacity", "0"]).validate().is_err());
        assert!(parse(&["--idle-timeout-secs", "0"]).validate().is_err());
        parse(&["--idle-timeout-secs", "1"]).validate().unwrap();
    }

    #[test]
    fn test_shell_becomes_default_command() {
        let args = parse(&["--shell", "/bin/sh -l", "--idle-timeout-secs", "60"]);
        let config = args.multiplexer_config();
        assert_eq!(config.default_command.as_deref(), Some("/bin/sh -l"));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_transport() {
        assert!(BackendArgs::try_parse_from(["pmxterm-backend", "-t", "zmq"]).is_err());
    }
}
