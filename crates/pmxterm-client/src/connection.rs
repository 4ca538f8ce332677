//! Raw newline-delimited JSON connections to a backend.

use pmxterm_proto::{connect, to_line, Endpoint, Notification, ReadHalf, Request, Response, Subscribe, WriteHalf};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{broadcast, Mutex};

use crate::error::{ClientError, Result};

struct CommandIo {
    lines: Lines<BufReader<ReadHalf>>,
    writer: WriteHalf,
    /// Set while a request is on the wire. Still set on entry means the
    /// previous call was dropped and its response may be unread.
    in_flight: bool,
}

impl CommandIo {
    async fn open(endpoint: &Endpoint) -> Result<Self> {
        let (reader, writer) = connect(endpoint).await?;
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            in_flight: false,
        })
    }
}

/// The command channel. Requests are strictly one at a time.
///
/// A call abandoned mid-flight (its future dropped, e.g. by a timeout)
/// leaves the stream out of step; the next call reconnects first.
pub struct CommandConnection {
    endpoint: Endpoint,
    io: Mutex<CommandIo>,
}

impl CommandConnection {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.clone(),
            io: Mutex::new(CommandIo::open(endpoint).await?),
        })
    }

    /// Send `request` and wait for its response. An `error` in the
    /// response becomes [`ClientError::Remote`].
    pub async fn call(&self, request: &Request) -> Result<Value> {
        let line = to_line(request)?;
        let mut io = self.io.lock().await;
        if io.in_flight {
            log::debug!("command connection to {} out of step, reconnecting", self.endpoint);
            *io = CommandIo::open(&self.endpoint).await?;
        }

        io.in_flight = true;
        io.writer.write_all(line.as_bytes()).await?;
        io.writer.flush().await?;
        let reply = io
            .lines
            .next_line()
            .await?
            .ok_or(ClientError::Disconnected)?;
        io.in_flight = false;

        let response: Response = serde_json::from_str(&reply)?;
        match response.error {
            Some(error) => Err(ClientError::Remote(error)),
            None => Ok(response.result),
        }
    }
}

/// Subscribe to a backend's notification channel and forward every
/// notification into `tx` until the backend hangs up.
pub async fn forward_notifications(
    endpoint: &Endpoint,
    subscribe: Subscribe,
    tx: broadcast::Sender<Notification>,
) -> Result<tokio::task::JoinHandle<()>> {
    let (reader, mut writer) = connect(endpoint).await?;
    if !subscribe.subscribe.is_empty() {
        writer.write_all(to_line(&subscribe)?.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(tokio::spawn(async move {
        // Keeps our side of the subscription open.
        let _writer = writer;
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<Notification>(&line) {
                    Ok(notification) => {
                        let _ = tx.send(notification);
                    }
                    Err(e) => log::warn!("bad notification {line:?}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("notification channel read failed: {e}");
                    break;
                }
            }
        }
        log::debug!("notification channel closed");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::UnixListener;

    /// Answers each request with its first argument, after `delay`.
    fn slow_echo(listener: UnixListener, delay: Duration) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Request = serde_json::from_str(&line).unwrap();
                        tokio::time::sleep(delay).await;
                        let response = Response::ok(request.args[0].clone());
                        let reply = to_line(&response).unwrap();
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    fn echo(n: u64) -> Request {
        Request {
            command: "echo".to_string(),
            args: vec![json!(n)],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_call_does_not_shift_responses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        slow_echo(UnixListener::bind(&path).unwrap(), Duration::from_millis(200));
        let conn = CommandConnection::connect(&Endpoint::Ipc(path)).await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(20), conn.call(&echo(1))).await;
        assert!(abandoned.is_err());

        assert_eq!(conn.call(&echo(2)).await.unwrap(), json!(2));
        assert_eq!(conn.call(&echo(3)).await.unwrap(), json!(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_calls_are_answered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        slow_echo(UnixListener::bind(&path).unwrap(), Duration::ZERO);
        let conn = CommandConnection::connect(&Endpoint::Ipc(path)).await.unwrap();

        for n in 0..5 {
            assert_eq!(conn.call(&echo(n)).await.unwrap(), json!(n));
        }
    }
}
