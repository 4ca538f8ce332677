//! Dialing endpoints and reading bounded lines off a channel.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::endpoint::Endpoint;

pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest line either side accepts.
pub const MAX_LINE: usize = 64 << 20;

/// Dial `endpoint` and split the stream.
pub async fn connect(endpoint: &Endpoint) -> io::Result<(ReadHalf, WriteHalf)> {
    match endpoint {
        Endpoint::Ipc(path) => {
            let (r, w) = UnixStream::connect(path).await?.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
    }
}

/// One line read by [`read_line`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// The raw bytes, newline included when there was one.
    Line(Vec<u8>),
    /// The line exceeded the limit and was skipped up to its newline.
    Oversized,
}

/// Read one newline-terminated line of at most `limit` bytes.
///
/// Bytes are not required to be UTF-8. An overlong line is consumed and
/// discarded without buffering it. Returns `None` at a clean EOF. Not
/// cancel safe.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut seen = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match seen {
                0 => None,
                _ if seen > limit => Some(Frame::Oversized),
                _ => Some(Frame::Line(line)),
            });
        }

        let (take, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        seen = seen.saturating_add(take);
        if seen <= limit {
            line.extend_from_slice(&available[..take]);
        } else if !line.is_empty() {
            line = Vec::new();
        }
        reader.consume(take);

        if done {
            return Ok(Some(if seen > limit {
                Frame::Oversized
            } else {
                Frame::Line(line)
            }));
        }
    }
}
