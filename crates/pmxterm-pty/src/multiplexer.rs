use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use pmxterm_proto::Notification;
use pmxterm_vt::{vt_factory, Screen, TerminalFactory};

use crate::config::MultiplexerConfig;
use crate::notify::Notifier;
use crate::session::{Session, SessionId};

/// Every tracked session plus the ids that may never come back.
#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    buried: HashSet<SessionId>,
}

/// Owns all sessions of one backend.
///
/// Commands from any connection and the supervisor sweep share this value
/// behind an `Arc`; the table sits under one mutex. Unknown ids answer with
/// sentinels (`false`/`None`), never with errors.
pub struct Multiplexer {
    table: Mutex<SessionTable>,
    config: MultiplexerConfig,
    factory: TerminalFactory,
    notifier: Notifier,
}

impl Multiplexer {
    /// Create an empty multiplexer whose sessions use [`VtTerminal`](pmxterm_vt::VtTerminal).
    pub fn new(config: MultiplexerConfig) -> Self {
        Self::with_factory(config, vt_factory())
    }

    pub fn with_factory(config: MultiplexerConfig, factory: TerminalFactory) -> Self {
        let notifier = Notifier::new(config.notify_capacity);
        Self {
            table: Mutex::new(SessionTable::default()),
            config,
            factory,
            notifier,
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        // A panicking session is buried by the sweep; the table itself stays usable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create-or-touch.
    ///
    /// An unseen id spawns `command` (or the configured default) at
    /// `cols` x `rows` and returns whether that worked. A live id is touched
    /// and resized if the dimensions differ. A buried id returns `false`.
    pub fn keepalive(&self, id: &str, cols: u16, rows: u16, command: Option<&str>) -> bool {
        let mut table = self.lock();
        if table.buried.contains(id) {
            return false;
        }

        if let Some(session) = table.sessions.get_mut(id) {
            if !session.is_alive() {
                return false;
            }
            session.touch();
            if session.size() != (cols, rows) {
                if let Err(e) = session.resize(cols, rows) {
                    log::warn!("session {id}: resize to {cols}x{rows} failed: {e}");
                }
            }
            return true;
        }

        let command = command.or(self.config.default_command.as_deref());
        let mut session = Session::new(id, cols, rows);
        match session.spawn(command, &self.factory, self.config.queue_capacity) {
            Ok(()) => {
                log::info!(
                    "session {id}: spawned {} (pid {:?}) at {cols}x{rows}",
                    command.unwrap_or("default shell"),
                    session.pid()
                );
                table.sessions.insert(id.to_string(), session);
                true
            }
            Err(e) => {
                log::error!("session {id}: spawn failed: {e}");
                table.buried.insert(id.to_string());
                false
            }
        }
    }

    /// Resize a live session. Takes effect immediately.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let mut table = self.lock();
        let Some(session) = table.sessions.get_mut(id) else {
            return false;
        };
        session.touch();
        match session.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("session {id}: resize to {cols}x{rows} failed: {e}");
                false
            }
        }
    }

    /// Send keystrokes to a live session.
    ///
    /// Input is queued for the session's writer thread, so the table lock is
    /// never held across a PTY write. A closed input returns `false` and
    /// leaves the session alone; a child that has really gone is reaped by
    /// the next sweep.
    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        let written = {
            let mut table = self.lock();
            let Some(session) = table.sessions.get_mut(id) else {
                return false;
            };
            session.touch();
            session.write(data)
        };
        match written {
            Ok(()) => {
                self.notifier.publish(Notification::changed(id));
                true
            }
            Err(e) => {
                log::warn!("session {id}: write failed: {e}");
                false
            }
        }
    }

    /// Apply one session's pending output. Returns whether anything changed.
    pub fn drain(&self, id: &str) -> bool {
        let mut table = self.lock();
        let Some(session) = table.sessions.get_mut(id) else {
            return false;
        };
        session.drain()
    }

    /// Screen snapshot of a live session.
    pub fn dump(&self, id: &str) -> Option<Screen> {
        let mut table = self.lock();
        let session = table.sessions.get_mut(id)?;
        session.touch();
        session.dump()
    }

    /// Terminate a session and forget it for good.
    ///
    /// Always `true`: burying an unknown or already buried id only records
    /// the tombstone. The child is reaped outside the table lock.
    pub fn bury(&self, id: &str) -> bool {
        let session = {
            let mut table = self.lock();
            table.buried.insert(id.to_string());
            table.sessions.remove(id)
        };

        if let Some(mut session) = session {
            let code = session.bury(self.config.bury_grace);
            log::info!("session {id}: buried (exit code {code:?})");
            self.notifier.publish(Notification::buried(id));
        }
        true
    }

    pub fn bury_all(&self) -> bool {
        let ids: Vec<SessionId> = self.lock().sessions.keys().cloned().collect();
        for id in &ids {
            self.bury(id);
        }
        true
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.lock().sessions.get(id).is_some_and(Session::is_alive)
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.lock().sessions.get(id).and_then(Session::pid)
    }

    pub fn last_change(&self, id: &str) -> Option<DateTime<Utc>> {
        self.lock().sessions.get(id).map(Session::last_change)
    }

    pub fn size(&self, id: &str) -> Option<(u16, u16)> {
        self.lock().sessions.get(id).map(Session::size)
    }

    /// Ids of all live sessions, sorted.
    pub fn sessions(&self) -> Vec<SessionId> {
        let table = self.lock();
        let mut ids: Vec<SessionId> = table
            .sessions
            .iter()
            .filter(|(_, session)| session.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Name of the OS the backend runs on.
    pub fn platform(&self) -> &'static str {
        std::env::consts::OS
    }

    /// One supervisor pass over every session.
    ///
    /// Idle sessions are evicted, every other session's queued output is
    /// applied, and sessions whose child exited or whose terminal panicked
    /// are buried. Returns the ids whose screens changed; a
    /// `changed` notification is published for each.
    pub fn sweep(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut doomed: Vec<SessionId> = Vec::new();
        let mut changed: Vec<SessionId> = Vec::new();

        {
            let mut table = self.lock();
            for (id, session) in table.sessions.iter_mut() {
                if session.idle_for(now) >= idle_timeout {
                    log::info!("session {id}: idle for {idle_timeout:?}, evicting");
                    doomed.push(id.clone());
                    continue;
                }

                match panic::catch_unwind(AssertUnwindSafe(|| session.drain())) {
                    Ok(true) => changed.push(id.clone()),
                    Ok(false) => {}
                    Err(_) => {
                        log::error!("session {id}: terminal panicked, burying");
                        doomed.push(id.clone());
                        continue;
                    }
                }

                if session.child_exited() {
                    log::info!("session {id}: child exited");
                    doomed.push(id.clone());
                }
            }
        }

        for id in &doomed {
            self.bury(id);
        }
        changed.retain(|id| !doomed.contains(id));
        for id in &changed {
            self.notifier.publish(Notification::changed(id.as_str()));
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmxterm_proto::NotificationKind;
    use pmxterm_vt::{Terminal, VtTerminal};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> MultiplexerConfig {
        MultiplexerConfig {
            default_command: Some("/bin/sh".to_string()),
            bury_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn wait_for_screen(mux: &Multiplexer, id: &str, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            mux.sweep();
            if mux.dump(id).is_some_and(|s| s.contains(needle)) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_unknown_ids_answer_with_sentinels() {
        let mux = Multiplexer::new(test_config());
        assert!(!mux.is_alive("nope"));
        assert_eq!(mux.pid("nope"), None);
        assert_eq!(mux.last_change("nope"), None);
        assert_eq!(mux.size("nope"), None);
        assert!(mux.dump("nope").is_none());
        assert!(!mux.write("nope", b"x"));
        assert!(!mux.resize("nope", 10, 10));
        assert!(!mux.drain("nope"));
        assert!(mux.sessions().is_empty());
    }

    #[test]
    fn test_keepalive_twice_keeps_pid() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        let pid = mux.pid("a");
        assert!(pid.is_some());

        assert!(mux.keepalive("a", 80, 24, None));
        assert_eq!(mux.pid("a"), pid);
        assert!(mux.is_alive("a"));
        assert!(mux.last_change("a").is_some());
    }

    #[test]
    fn test_keepalive_resizes_on_new_dimensions() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        assert!(mux.keepalive("a", 100, 30, None));
        assert_eq!(mux.size("a"), Some((100, 30)));
    }

    #[test]
    fn test_bury_is_final() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        let mut rx = mux.notifier().subscribe();

        assert!(mux.bury("a"));
        assert!(!mux.is_alive("a"));
        assert_eq!(mux.pid("a"), None);
        assert!(!mux.keepalive("a", 80, 24, None));
        assert!(!mux.is_alive("a"));
        assert!(mux.bury("a"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event, Notification::buried("a"));
    }

    #[test]
    fn test_bury_unknown_id_tombstones_it() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.bury("ghost"));
        assert!(!mux.keepalive("ghost", 80, 24, None));
    }

    #[test]
    fn test_spawn_failure() {
        let mux = Multiplexer::new(test_config());
        assert!(!mux.keepalive("bad", 80, 24, Some("/nonexistent/pmxterm-shell")));
        assert!(!mux.is_alive("bad"));
        assert!(!mux.keepalive("bad", 80, 24, None));
    }

    #[test]
    fn test_resize_is_immediate() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        let pid = mux.pid("a");

        assert!(mux.resize("a", 132, 43));
        assert_eq!(mux.size("a"), Some((132, 43)));
        let screen = mux.dump("a").unwrap();
        assert_eq!((screen.cols, screen.rows), (132, 43));
        assert_eq!(mux.pid("a"), pid);
        assert!(mux.is_alive("a"));
    }

    #[test]
    fn test_write_then_dump() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        let mut rx = mux.notifier().subscribe();

        assert!(mux.write("a", b"echo PMX_$((40+2))\n"));
        assert_eq!(rx.try_recv().unwrap(), Notification::changed("a"));
        assert!(wait_for_screen(&mux, "a", "PMX_42"));
    }

    #[test]
    fn test_sweep_reports_changes() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("a", 80, 24, None));
        mux.write("a", b"echo SWEEP_OK\n");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut reported = false;
        while Instant::now() < deadline && !reported {
            reported = mux.sweep().iter().any(|id| id == "a");
            thread::sleep(Duration::from_millis(20));
        }
        assert!(reported);
    }

    #[test]
    fn test_idle_sessions_are_evicted() {
        let mux = Multiplexer::new(MultiplexerConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        });
        assert!(mux.keepalive("idle", 80, 24, None));
        let mut rx = mux.notifier().subscribe();

        thread::sleep(Duration::from_millis(100));
        mux.sweep();

        assert!(!mux.is_alive("idle"));
        assert!(!mux.keepalive("idle", 80, 24, None));
        let kinds: Vec<NotificationKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.kind)
            .collect();
        assert!(kinds.contains(&NotificationKind::Buried));
    }

    #[test]
    fn test_keepalive_defers_eviction() {
        let mux = Multiplexer::new(MultiplexerConfig {
            idle_timeout: Duration::from_millis(300),
            ..test_config()
        });
        assert!(mux.keepalive("busy", 80, 24, None));
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(100));
            assert!(mux.keepalive("busy", 80, 24, None));
            mux.sweep();
        }
        assert!(mux.is_alive("busy"));
    }

    #[test]
    fn test_exited_child_is_reaped() {
        let mux = Multiplexer::new(test_config());
        assert!(mux.keepalive("short", 80, 24, Some("/bin/sh -c 'exit 0'")));

        let deadline = Instant::now() + Duration::from_secs(5);
        while mux.is_alive("short") && Instant::now() < deadline {
            mux.sweep();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!mux.is_alive("short"));
        assert!(!mux.keepalive("short", 80, 24, None));
    }

    #[test]
    fn test_sessions_lists_live_ids_sorted() {
        let mux = Multiplexer::new(test_config());
        for id in ["c", "a", "b"] {
            assert!(mux.keepalive(id, 80, 24, None));
        }
        mux.bury("b");
        assert_eq!(mux.sessions(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_bury_all() {
        let mux = Multiplexer::new(test_config());
        for id in ["x", "y", "z"] {
            assert!(mux.keepalive(id, 80, 24, None));
        }
        assert!(mux.bury_all());
        assert!(mux.sessions().is_empty());
        for id in ["x", "y", "z"] {
            assert!(!mux.is_alive(id));
            assert!(!mux.keepalive(id, 80, 24, None));
        }
        assert!(mux.bury_all());
    }

    #[test]
    fn test_concurrent_writes_do_not_interfere() {
        let mux = Arc::new(Multiplexer::new(test_config()));
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    let id = format!("t{n}");
                    assert!(mux.keepalive(&id, 80, 24, None));
                    // Quotes keep the echoed command line from matching the marker.
                    assert!(mux.write(&id, format!("echo MARK_{n}_O''K\n").as_bytes()));
                    let marker = format!("MARK_{n}_OK");
                    assert!(wait_for_screen(&mux, &id, &marker), "{id} missing {marker}");

                    let screen = mux.dump(&id).unwrap();
                    for other in (0..4).filter(|&m| m != n) {
                        assert!(!screen.contains(&format!("MARK_{other}_OK")));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mux.sessions().len(), 4);
    }

    #[test]
    fn test_platform() {
        let mux = Multiplexer::new(test_config());
        assert_eq!(mux.platform(), std::env::consts::OS);
    }

    #[test]
    fn test_stalled_child_does_not_block_other_sessions() {
        let mux = Arc::new(Multiplexer::new(MultiplexerConfig {
            queue_capacity: 4,
            ..test_config()
        }));
        assert!(mux.keepalive("stuck", 80, 24, Some("/bin/sh -c 'stty raw -echo; cat'")));
        assert!(mux.keepalive("other", 80, 24, None));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = Arc::clone(&mux);
        thread::spawn(move || {
            // cat echoes into a queue nobody drains, then stops reading.
            let written = worker.write("stuck", &vec![b'x'; 4 << 20]);
            let alive = worker.is_alive("other");
            let _ = done_tx.send((written, alive));
        });

        let (written, alive) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("table lock held by a stalled write");
        assert!(written);
        assert!(alive);
        assert!(mux.write("other", b"echo FREE_$((2+3))\n"));
        assert!(wait_for_screen(&mux, "other", "FREE_5"));
        assert!(mux.is_alive("stuck"));
    }

    /// Answers every feed with a cursor position report.
    struct Chatty(VtTerminal);

    impl Terminal for Chatty {
        fn feed(&mut self, bytes: &[u8]) {
            self.0.feed(bytes);
        }

        fn snapshot(&self) -> Screen {
            self.0.snapshot()
        }

        fn resize(&mut self, cols: u16, rows: u16) {
            self.0.resize(cols, rows);
        }

        fn translate_input(&self, bytes: &[u8]) -> Vec<u8> {
            self.0.translate_input(bytes)
        }

        fn take_replies(&mut self) -> Vec<u8> {
            b"\x1b[1;1R".to_vec()
        }
    }

    #[test]
    fn test_input_fault_keeps_session_alive() {
        let factory: TerminalFactory =
            Arc::new(|cols, rows| Box::new(Chatty(VtTerminal::new(cols, rows))) as Box<dyn Terminal>);
        let mux = Multiplexer::with_factory(test_config(), factory);
        // Once the child drops its end of the PTY, writes to it fail with EIO
        // while the child itself keeps running.
        assert!(mux.keepalive(
            "deaf",
            80,
            24,
            Some("/bin/sh -c 'echo TICK; exec 0<&- 1>&- 2>&-; sleep 30'")
        ));
        assert!(wait_for_screen(&mux, "deaf", "TICK"));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut refused = false;
        while Instant::now() < deadline && !refused {
            refused = !mux.write("deaf", b"x");
            mux.sweep();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(refused, "write never reported the closed input");

        for _ in 0..5 {
            mux.sweep();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(mux.is_alive("deaf"));
        assert!(mux.pid("deaf").is_some());
    }

    /// Delegates to a real terminal but blows up on a trigger word.
    struct Fragile(VtTerminal);

    impl Terminal for Fragile {
        fn feed(&mut self, bytes: &[u8]) {
            if String::from_utf8_lossy(bytes).contains("KABOOM") {
                panic!("terminal fault");
            }
            self.0.feed(bytes);
        }

        fn snapshot(&self) -> Screen {
            self.0.snapshot()
        }

        fn resize(&mut self, cols: u16, rows: u16) {
            self.0.resize(cols, rows);
        }

        fn translate_input(&self, bytes: &[u8]) -> Vec<u8> {
            self.0.translate_input(bytes)
        }
    }

    #[test]
    fn test_terminal_panic_is_isolated() {
        let factory: TerminalFactory =
            Arc::new(|cols, rows| Box::new(Fragile(VtTerminal::new(cols, rows))) as Box<dyn Terminal>);
        let mux = Multiplexer::with_factory(test_config(), factory);
        assert!(mux.keepalive("fragile", 80, 24, None));
        assert!(mux.keepalive("sturdy", 80, 24, None));

        // The echoed command line reads KA''BOOM; only the output trips the fault.
        assert!(mux.write("fragile", b"echo KA''BOOM\n"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while mux.is_alive("fragile") && Instant::now() < deadline {
            mux.sweep();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!mux.is_alive("fragile"));
        assert!(mux.is_alive("sturdy"));
        assert!(mux.write("sturdy", b"echo STILL_$((1+2))\n"));
        assert!(wait_for_screen(&mux, "sturdy", "STILL_3"));
    }
}
