//! Socket plumbing for the command channel, the notification channel and
//! client-registered push channels.
//!
//! Every channel carries newline-delimited JSON. Both listeners accept
//! until shutdown is signalled; each connection runs as its own task.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pmxterm_proto::{
    connect, read_line, to_line, Endpoint, Frame, Notification, ReadHalf, Request, Response,
    Subscribe, WriteHalf, MAX_LINE,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;

use crate::context::BackendContext;
use crate::dispatch;

/// Which protocol an accepted connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Commands,
    Notifications,
}

/// A bound command or notification listener.
pub enum Listener {
    Unix { inner: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `endpoint`, clearing a stale socket file left by a crashed
    /// backend. A socket something still answers on is an error.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Ipc(path) => {
                remove_stale_socket(path).await?;
                let inner = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    inner,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// The endpoint clients should dial, with any OS-assigned port resolved.
    pub fn endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Ipc(path.clone())),
            Listener::Tcp(inner) => Ok(Endpoint::Tcp(inner.local_addr()?)),
        }
    }

    pub async fn accept(&self) -> io::Result<(ReadHalf, WriteHalf)> {
        match self {
            Listener::Unix { inner, .. } => {
                let (stream, _) = inner.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Listener::Tcp(inner) => {
                let (stream, _) = inner.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }

    /// Remove the socket file, if this is a Unix listener.
    pub fn remove_socket(&self) {
        if let Listener::Unix { path, .. } = self {
            match std::fs::remove_file(path) {
                Ok(()) => log::debug!("removed socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove socket {}: {e}", path.display()),
            }
        }
    }
}

async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another backend is listening on {}", path.display()),
        ));
    }
    log::info!("removing stale socket {}", path.display());
    std::fs::remove_file(path)
}

/// Accept connections until shutdown, handing each to the `channel`
/// handler. The socket file is removed on the way out.
pub async fn run_accept_loop(listener: Listener, channel: Channel, ctx: Arc<BackendContext>) {
    let mut shutdown = ctx.shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((reader, writer)) => {
                    log::debug!("{channel:?} connection accepted");
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        let reader = BufReader::new(reader);
                        let outcome = match channel {
                            Channel::Commands => serve_commands(reader, writer, ctx, MAX_LINE).await,
                            Channel::Notifications => serve_notifications(reader, writer, ctx).await,
                        };
                        if let Err(e) = outcome {
                            log::debug!("{channel:?} connection closed: {e}");
                        }
                    });
                }
                // Transient; keep accepting.
                Err(e) => log::error!("{channel:?} accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }

    log::info!("{channel:?} listener stopped");
    listener.remove_socket();
}

/// Answer requests one line at a time, in order.
///
/// Every non-blank line gets exactly one response. Lines that are not valid
/// JSON, not UTF-8, or longer than `limit` bytes are answered with an error
/// and the connection stays open.
pub async fn serve_commands<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: Arc<BackendContext>,
    limit: usize,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = read_line(&mut reader, limit).await? {
        let response = match frame {
            Frame::Line(line) if line.trim_ascii().is_empty() => continue,
            Frame::Line(line) => match serde_json::from_slice::<Request>(&line) {
                Ok(request) => dispatch::dispatch(&ctx, request).await,
                Err(e) => Response::error(format!("malformed request: {e}")),
            },
            Frame::Oversized => Response::error(format!("malformed request: longer than {limit} bytes")),
        };
        write_line(&mut writer, &response).await?;
    }
    Ok(())
}

/// Stream notifications to a subscriber.
///
/// The subscriber may send `{"subscribe": [ids]}` lines at any time to
/// narrow (or, with an empty list, widen) what it receives. The connection
/// ends when the subscriber hangs up.
pub async fn serve_notifications<R, W>(
    reader: R,
    mut writer: W,
    ctx: Arc<BackendContext>,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut events = ctx.notifier().subscribe();
    let mut filter = Subscribe::default();
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Subscribe>(&line) {
                    Ok(subscribe) => filter = subscribe,
                    Err(e) => log::warn!("ignoring bad subscribe line: {e}"),
                },
                None => return Ok(()),
            },
            event = events.recv() => match event {
                Ok(notification) => {
                    if filter.matches(&notification.session) {
                        write_line(&mut writer, &notification).await?;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::debug!("notification subscriber lagged, {missed} events dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Connect to a client-provided endpoint and push every notification there
/// until the peer goes away or the backend shuts down.
pub async fn register_push_channel(ctx: &Arc<BackendContext>, address: Endpoint) -> bool {
    let (_reader, writer) = match connect(&address).await {
        Ok(halves) => halves,
        Err(e) => {
            log::warn!("setup_channel {address}: {e}");
            return false;
        }
    };
    log::info!("pushing notifications to {address}");

    let events = ctx.notifier().subscribe();
    let shutdown = ctx.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = push_notifications(writer, events, shutdown).await {
            log::info!("push channel {address} closed: {e}");
        }
    });
    true
}

async fn push_notifications(
    mut writer: WriteHalf,
    mut events: tokio::sync::broadcast::Receiver<Notification>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(notification) => write_line(&mut writer, &notification).await?,
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    writer.shutdown().await
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let line = to_line(value).map_err(io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
