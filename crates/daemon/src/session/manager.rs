//! Per-channel session manager.
//!
//! A [`SessionManager`] owns at most one live [`ProcessHandle`] for one
//! caller channel and drives the session state machine:
//!
//! ```text
//! Uninitialized --init/write--> Running --exit--> Exited --init/write--> Running
//!                                  |  ^
//!                                  +--+ init (forced restart)
//! any state --teardown--> Closed
//! ```
//!
//! All operations take the session lock, so a spawn in progress holds off
//! concurrent writes until the new process is ready. Input is only queued
//! under the lock, so a shell that stops reading cannot wedge the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::pty::{Generation, ProcessHandle, SessionError, TerminalSize};
use super::relay::{OutputRelay, SessionEvent};
use super::shell::ShellCommand;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No process has been started yet.
    Uninitialized,
    /// A process is live.
    Running,
    /// The last process ended; the next init or write starts a new one.
    Exited,
    /// Torn down; every further operation is ignored.
    Closed,
}

/// Tunables for the processes a session spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSettings {
    /// Size used for the first spawn, until the caller resizes.
    pub initial_size: TerminalSize,
    /// Maximum bytes per PTY read, and thus per output event.
    pub read_buffer_size: usize,
    /// Capacity of the caller event channel, in events.
    pub output_buffer: usize,
    /// How long a forced restart waits for the old process to drain.
    pub restart_grace: Duration,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            initial_size: TerminalSize::DEFAULT,
            read_buffer_size: 4096,
            output_buffer: 256,
            restart_grace: Duration::from_millis(500),
        }
    }
}

struct ActiveProcess {
    handle: Arc<ProcessHandle>,
    relay: OutputRelay,
}

struct SessionInner {
    state: SessionState,
    active: Option<ActiveProcess>,
    dimensions: TerminalSize,
}

impl SessionInner {
    /// Notices a process that has exited on its own. The relay is kept until
    /// it has delivered the exit event; `start` drains it otherwise.
    fn reap(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if active.handle.is_alive() {
            return;
        }

        if self.state == SessionState::Running {
            self.state = SessionState::Exited;
        }
        if active.relay.is_finished() {
            self.active = None;
        }
    }

    fn live(&self) -> Option<&Arc<ProcessHandle>> {
        self.active
            .as_ref()
            .map(|active| &active.handle)
            .filter(|handle| handle.is_alive())
    }
}

/// Owns the shell process of one caller channel.
pub struct SessionManager {
    inner: Mutex<SessionInner>,
    events: mpsc::Sender<SessionEvent>,
    current: Arc<AtomicU64>,
    settings: TerminalSettings,
    shell: ShellCommand,
}

impl SessionManager {
    /// Creates a session that pushes its events into `events`.
    pub fn new(
        events: mpsc::Sender<SessionEvent>,
        settings: TerminalSettings,
        shell: ShellCommand,
    ) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                active: None,
                dimensions: settings.initial_size,
            }),
            events,
            current: Arc::new(AtomicU64::new(0)),
            settings,
            shell,
        }
    }

    /// Creates a session together with its event receiver, sized by
    /// `settings.output_buffer`.
    pub fn channel(
        settings: TerminalSettings,
        shell: ShellCommand,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(settings.output_buffer.max(1));
        (Self::new(tx, settings, shell), rx)
    }

    /// Starts a fresh process, killing and draining any live one first.
    ///
    /// Returns the new generation, or `None` if the spawn failed (the caller
    /// has then been sent a diagnostic output event) or the session is closed.
    pub async fn init(&self) -> Option<Generation> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            tracing::debug!("Ignoring init on closed session");
            return None;
        }
        self.start(&mut inner).await
    }

    /// Sends input to the live process, starting one first if there is none.
    ///
    /// Write failures are logged and dropped.
    pub async fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            tracing::debug!(bytes = data.len(), "Ignoring input on closed session");
            return;
        }
        inner.reap();

        if inner.live().is_none() {
            tracing::debug!("Input with no live process, starting shell");
            if self.start(&mut inner).await.is_none() {
                return;
            }
        }

        // Queued, not written: a shell that stops reading its input must not
        // hold the session lock.
        if let Some(handle) = inner.live() {
            if let Err(e) = handle.send_input(data.to_vec()) {
                tracing::warn!(generation = handle.generation(), error = %e, "Dropped terminal input");
            }
        }
    }

    /// Applies new dimensions. Zero sizes are ignored; with no live process
    /// the size is only remembered for the next spawn.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let size = match TerminalSize::new(cols, rows) {
            Ok(size) => size,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring resize");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.reap();
        inner.dimensions = size;

        if let Some(handle) = inner.live() {
            if let Err(e) = handle.resize(size).await {
                tracing::warn!(generation = handle.generation(), error = %e, "Resize failed");
            }
        }
    }

    /// Kills the live process, stops its relay and closes the session.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.state = SessionState::Closed;

        if let Some(active) = inner.active.take() {
            self.retire(active).await;
        }
        tracing::debug!(generation = self.generation(), "Session torn down");
    }

    pub async fn state(&self) -> SessionState {
        let mut inner = self.inner.lock().await;
        inner.reap();
        inner.state
    }

    /// The generation of the most recent spawn attempt; 0 before the first.
    pub fn generation(&self) -> Generation {
        self.current.load(Ordering::SeqCst)
    }

    pub async fn dimensions(&self) -> TerminalSize {
        self.inner.lock().await.dimensions
    }

    /// PID of the live process, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.live().and_then(|h| h.pid())
    }

    /// Spawns a new process. Must be called with the session lock held.
    async fn start(&self, inner: &mut SessionInner) -> Option<Generation> {
        // An exited process may still have its exit event in flight; it goes
        // out before the generation moves on.
        if let Some(active) = inner.active.take() {
            if active.handle.is_alive() {
                tracing::info!(generation = active.handle.generation(), "Restarting shell");
            }
            self.retire(active).await;
            inner.state = SessionState::Exited;
        }

        // Published before the spawn so a failure diagnostic is tagged with
        // the attempt it belongs to.
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;

        let spawned = ProcessHandle::spawn(generation, &self.shell, inner.dimensions)
            .map(Arc::new)
            .and_then(|handle| {
                let relay = OutputRelay::start(
                    Arc::clone(&handle),
                    self.events.clone(),
                    Arc::clone(&self.current),
                    self.settings.read_buffer_size,
                )?;
                Ok(ActiveProcess { handle, relay })
            });

        match spawned {
            Ok(active) => {
                inner.active = Some(active);
                inner.state = SessionState::Running;
                Some(generation)
            }
            Err(e) => {
                tracing::warn!(generation = generation, error = %e, "Failed to start shell");
                self.report_spawn_failure(generation, &e).await;
                None
            }
        }
    }

    /// Kills a process and waits (bounded) for its relay to deliver the
    /// remaining output and the exit event.
    async fn retire(&self, active: ActiveProcess) {
        let generation = active.handle.generation();
        if let Err(e) = active.handle.kill().await {
            tracing::warn!(generation = generation, error = %e, "Failed to kill shell");
        }
        if !active.relay.join(self.settings.restart_grace).await {
            tracing::warn!(
                generation = generation,
                "Shell output not drained within grace period, discarding the rest"
            );
        }
    }

    async fn report_spawn_failure(&self, generation: Generation, error: &SessionError) {
        let message = format!("\r\nError initializing terminal: {}\r\n", error);
        let event = SessionEvent::Output {
            generation,
            data: message.into_bytes(),
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!(generation = generation, "Event receiver closed");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("generation", &self.generation())
            .field("shell", &self.shell.program())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_session() -> (SessionManager, mpsc::Receiver<SessionEvent>) {
        SessionManager::channel(TerminalSettings::default(), ShellCommand::new("/bin/sh"))
    }

    /// A session whose caller is behind: its one-slot channel is already full.
    async fn lagging_session(shell: ShellCommand) -> (SessionManager, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(1);
        tx.send(SessionEvent::Output {
            generation: 0,
            data: b"backlog".to_vec(),
        })
        .await
        .unwrap();
        (SessionManager::new(tx, TerminalSettings::default(), shell), rx)
    }

    /// Receives events until `stop` matches one, or gives up after ~5s.
    async fn recv_until<F>(rx: &mut mpsc::Receiver<SessionEvent>, mut stop: F) -> Vec<SessionEvent>
    where
        F: FnMut(&[SessionEvent]) -> bool,
    {
        let mut events = Vec::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(event)) => {
                    events.push(event);
                    if stop(&events) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        events
    }

    fn text_of(events: &[SessionEvent], generation: Generation) -> String {
        let bytes: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { generation: g, data } if *g == generation => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn exits_of(events: &[SessionEvent], generation: Generation) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Exit { generation: g, .. } if *g == generation))
            .count()
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (session, _rx) = sh_session();
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(session.generation(), 0);
        assert_eq!(session.dimensions().await, TerminalSize::DEFAULT);
        assert!(session.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_init_starts_shell() {
        let (session, _rx) = sh_session();

        let generation = session.init().await;
        assert_eq!(generation, Some(1));
        assert_eq!(session.state().await, SessionState::Running);
        assert!(session.pid().await.is_some());

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_input_before_init_spawns_shell() {
        let (session, mut rx) = sh_session();

        session.write(b"echo hi\n").await;
        assert_eq!(session.state().await, SessionState::Running);
        assert_eq!(session.generation(), 1);

        let events = recv_until(&mut rx, |ev| {
            let text = text_of(ev, 1);
            // The echoed command line, then the command's own output
            text.matches("hi").count() >= 2
        })
        .await;
        assert!(text_of(&events, 1).contains("hi\r\n"));

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_init_twice_keeps_one_process() {
        let (session, mut rx) = sh_session();

        assert_eq!(session.init().await, Some(1));
        let first_pid = session.pid().await;
        assert_eq!(session.init().await, Some(2));
        let second_pid = session.pid().await;

        assert_ne!(first_pid, second_pid);
        assert_eq!(session.state().await, SessionState::Running);

        session.write(b"echo gen2_marker\n").await;
        let events = recv_until(&mut rx, |ev| text_of(ev, 2).contains("gen2_marker\r\n")).await;

        assert!(exits_of(&events, 1) <= 1);
        assert_eq!(exits_of(&events, 2), 0);

        // Nothing from the first generation arrives after the second starts
        let first_gen2 = events.iter().position(|e| e.generation() == 2);
        let last_gen1 = events.iter().rposition(|e| e.generation() == 1);
        if let (Some(first_gen2), Some(last_gen1)) = (first_gen2, last_gen1) {
            assert!(last_gen1 < first_gen2);
        }

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_exit_reported_once() {
        let (session, mut rx) = sh_session();
        session.init().await;

        session.write(b"exit\n").await;
        let events = recv_until(&mut rx, |ev| exits_of(ev, 1) > 0).await;

        assert_eq!(exits_of(&events, 1), 1);
        match events.last() {
            Some(SessionEvent::Exit { exit, .. }) => {
                assert_eq!(exit.code, Some(0));
                assert_eq!(exit.signal, None);
            }
            other => panic!("expected exit last, got {:?}", other),
        }

        // No duplicate exit shows up later
        let later = recv_until(&mut rx, |_| false).await;
        assert_eq!(exits_of(&later, 1), 0);

        assert_eq!(session.state().await, SessionState::Exited);
        assert!(session.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_write_after_exit_respawns() {
        let (session, mut rx) = sh_session();
        session.init().await;
        session.write(b"exit\n").await;
        recv_until(&mut rx, |ev| exits_of(ev, 1) > 0).await;

        session.write(b"echo again_marker\n").await;
        assert_eq!(session.generation(), 2);
        let events = recv_until(&mut rx, |ev| text_of(ev, 2).contains("again_marker\r\n")).await;
        assert!(text_of(&events, 2).contains("again_marker"));

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_invalid_shell_reports_diagnostic() {
        let (session, mut rx) = SessionManager::channel(
            TerminalSettings::default(),
            ShellCommand::new("/nonexistent/ptybridge-shell"),
        );

        assert_eq!(session.init().await, None);
        assert_eq!(session.state().await, SessionState::Uninitialized);

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Output { generation, data } => {
                assert_eq!(generation, 1);
                let text = String::from_utf8(data).unwrap();
                assert!(text.starts_with("\r\nError initializing terminal: "));
                assert!(text.contains("/nonexistent/ptybridge-shell"));
                assert!(text.ends_with("\r\n"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Input triggers another attempt, which fails the same way
        session.write(b"ls\n").await;
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Output { generation: 2, .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_init_succeeds_once_shell_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell");
        let (session, mut rx) = SessionManager::channel(
            TerminalSettings::default(),
            ShellCommand::new(path.display().to_string()),
        );

        assert_eq!(session.init().await, None);
        assert_eq!(session.state().await, SessionState::Uninitialized);
        let events = recv_until(&mut rx, |ev| {
            text_of(ev, 1).contains("Error initializing terminal")
        })
        .await;
        assert!(text_of(&events, 1).contains("Error initializing terminal"));

        std::os::unix::fs::symlink("/bin/sh", &path).unwrap();

        assert_eq!(session.init().await, Some(2));
        assert_eq!(session.state().await, SessionState::Running);
        assert!(session.pid().await.is_some());

        session.write(b"echo retry_$((1+1))\n").await;
        let events = recv_until(&mut rx, |ev| text_of(ev, 2).contains("retry_2")).await;
        assert!(text_of(&events, 2).contains("retry_2"));
        assert!(events.iter().all(|e| e.generation() == 2));

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_exit_survives_queries_while_caller_lags() {
        let (session, mut rx) = lagging_session(ShellCommand::new("true")).await;

        assert_eq!(session.init().await, Some(1));
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The exit event is stuck behind the backlog while these run
        assert_eq!(session.state().await, SessionState::Exited);
        assert!(session.pid().await.is_none());
        session.resize(100, 40).await;
        assert_eq!(session.state().await, SessionState::Exited);

        let events = recv_until(&mut rx, |ev| exits_of(ev, 1) > 0).await;
        assert_eq!(events.first().map(SessionEvent::generation), Some(0));
        assert_eq!(exits_of(&events, 1), 1);
    }

    #[tokio::test]
    async fn test_exit_delivered_before_respawn_while_caller_lags() {
        let shell = ShellCommand::new("sh").arg("-c").arg("exit 5");
        let (session, mut rx) = lagging_session(shell).await;
        let session = Arc::new(session);

        assert_eq!(session.init().await, Some(1));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write(b"x").await })
        };
        let events = recv_until(&mut rx, |ev| exits_of(ev, 1) > 0).await;
        writer.await.unwrap();

        assert_eq!(session.generation(), 2);
        assert!(events.iter().all(|e| e.generation() < 2));
        match events.last() {
            Some(SessionEvent::Exit { generation, exit }) => {
                assert_eq!(*generation, 1);
                assert_eq!(exit.code, Some(5));
            }
            other => panic!("expected exit of generation 1, got {:?}", other),
        }

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_not_blocked_by_unread_input() {
        // `sleep` never reads its terminal
        let (session, _rx) = SessionManager::channel(
            TerminalSettings::default(),
            ShellCommand::new("sleep").arg("60"),
        );
        assert_eq!(session.init().await, Some(1));

        let data = format!("{}\n", "a".repeat(1023)).repeat(1024);
        timeout(Duration::from_secs(2), session.write(data.as_bytes()))
            .await
            .expect("write waited on the shell");

        timeout(Duration::from_secs(3), session.teardown())
            .await
            .expect("teardown waited on pending input");
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_resize_applies_and_persists() {
        let (session, mut rx) = sh_session();

        // No process yet: remembered for the spawn
        session.resize(100, 40).await;
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(session.dimensions().await, TerminalSize { cols: 100, rows: 40 });

        session.init().await;
        session.write(b"stty size\n").await;
        let events = recv_until(&mut rx, |ev| text_of(ev, 1).contains("40 100")).await;
        assert!(text_of(&events, 1).contains("40 100"));

        session.resize(132, 43).await;
        session.write(b"stty size\n").await;
        let events = recv_until(&mut rx, |ev| text_of(ev, 1).contains("43 132")).await;
        assert!(text_of(&events, 1).contains("43 132"));

        session.teardown().await;
    }

    #[tokio::test]
    async fn test_zero_resize_ignored() {
        let (session, _rx) = sh_session();
        session.resize(0, 40).await;
        session.resize(80, 0).await;
        assert_eq!(session.dimensions().await, TerminalSize::DEFAULT);
    }

    #[tokio::test]
    async fn test_teardown_closes_session() {
        let (session, mut rx) = sh_session();
        session.init().await;

        session.teardown().await;
        assert_eq!(session.state().await, SessionState::Closed);
        assert!(session.pid().await.is_none());

        // Operations after teardown do nothing
        assert_eq!(session.init().await, None);
        session.write(b"echo nope\n").await;
        session.resize(100, 50).await;
        assert_eq!(session.state().await, SessionState::Closed);
        assert_eq!(session.generation(), 1);

        // Teardown is idempotent
        session.teardown().await;

        // Only events of generation 1 were ever produced
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), rx.recv()).await {
            assert_eq!(event.generation(), 1);
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_share_one_spawn() {
        let (session, mut rx) = sh_session();
        let session = Arc::new(session);

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session.write(format!("echo w{}\n", i).as_bytes()).await;
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(session.generation(), 1);
        assert_eq!(session.state().await, SessionState::Running);

        let events = recv_until(&mut rx, |ev| {
            let text = text_of(ev, 1);
            (0..8).all(|i| text.contains(&format!("w{}\r\n", i)))
        })
        .await;
        assert!(events.iter().all(|e| e.generation() == 1));

        session.teardown().await;
    }
}
