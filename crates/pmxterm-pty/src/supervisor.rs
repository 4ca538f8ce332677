//! Process supervision: per-session I/O threads and the periodic sweep.
//!
//! PTY reads and writes block, so each live session gets two OS threads.
//! The reader owns the PTY reader and pushes raw chunks into a bounded
//! channel; the writer owns the PTY writer and empties an input channel
//! into it. Neither thread touches the session table. The sweep task drains
//! the output channels into the terminals under the table lock, on tokio's
//! blocking pool.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::multiplexer::Multiplexer;

/// Size of a single PTY read.
pub const READ_CHUNK: usize = 4096;

/// Start the reader thread for session `id`.
///
/// The thread exits on EOF, on a read error, or once the receiving end of
/// `tx` has been dropped. A full channel blocks the thread, which in turn
/// stops draining the PTY and stalls the child.
pub fn spawn_reader(
    id: &str,
    reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("pmx-read-{}", id.replace('\0', ""));
    thread::Builder::new()
        .name(name)
        .spawn(move || read_loop(reader, tx))
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the child side of the PTY is gone.
            Err(_) => return,
        };
        if tx.blocking_send(buf[..n].to_vec()).is_err() {
            return;
        }
    }
}

/// Start the writer thread for session `id`.
///
/// Chunks queued on `rx` are written to the PTY in order. The thread exits
/// once every sender is gone or a write fails; a child that stops reading
/// blocks this thread only.
pub fn spawn_writer(
    id: &str,
    writer: Box<dyn Write + Send>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("pmx-write-{}", id.replace('\0', ""));
    let id = id.to_string();
    thread::Builder::new()
        .name(name)
        .spawn(move || write_loop(&id, writer, rx))
}

fn write_loop(id: &str, mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
            log::debug!("session {id}: PTY write failed: {e}");
            return;
        }
    }
}

/// Run [`Multiplexer::sweep`] every `period` until `shutdown` flips (or its
/// sender is dropped), then bury every remaining session.
///
/// Each sweep runs on the blocking pool so PTY writes and reaping never
/// stall the runtime. Missed ticks are skipped rather than bunched up.
pub fn spawn_sweep_loop(
    mux: Arc<Multiplexer>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let mux = Arc::clone(&mux);
            if let Err(e) = tokio::task::spawn_blocking(move || mux.sweep()).await {
                log::error!("sweep failed: {e}");
            }
        }

        log::info!("sweep loop stopping, burying all sessions");
        if let Err(e) = tokio::task::spawn_blocking(move || mux.bury_all()).await {
            log::error!("bury_all on shutdown failed: {e}");
        }
    })
}
