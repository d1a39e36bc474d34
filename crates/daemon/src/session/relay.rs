//! Output relay: moves bytes from a PTY to the caller's event channel.
//!
//! Each live process gets exactly one relay task. The task reads the PTY on
//! tokio's blocking pool, forwards every chunk unchanged and in read order,
//! and finishes with a single [`SessionEvent::Exit`] once the process is gone,
//! even if a background job still holds the terminal open.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::pty::{Generation, ProcessExit, ProcessHandle, SessionError};

/// How long a cancelled relay still waits for its process to be reaped.
const CANCELLED_EXIT_WAIT: Duration = Duration::from_millis(100);

/// Once the process has exited, output still arriving is forwarded until the
/// PTY stays quiet this long.
const EXIT_DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Cap on forwarding output after the process has exited.
const EXIT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a relay task after it was cancelled.
const CANCEL_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Events pushed from a session to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes produced by the process of `generation`.
    Output { generation: Generation, data: Vec<u8> },
    /// The process of `generation` has ended. Sent once, after its last output.
    Exit {
        generation: Generation,
        exit: ProcessExit,
    },
}

impl SessionEvent {
    pub fn generation(&self) -> Generation {
        match self {
            SessionEvent::Output { generation, .. } | SessionEvent::Exit { generation, .. } => {
                *generation
            }
        }
    }
}

/// Handle to a running relay task.
pub struct OutputRelay {
    generation: Generation,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OutputRelay {
    /// Starts relaying output of `handle` into `events`.
    ///
    /// `current` is the session's current generation. Events whose generation
    /// no longer matches it are dropped instead of delivered.
    pub fn start(
        handle: Arc<ProcessHandle>,
        events: mpsc::Sender<SessionEvent>,
        current: Arc<AtomicU64>,
        read_buffer_size: usize,
    ) -> Result<Self, SessionError> {
        let reader = handle.take_reader().ok_or_else(|| {
            SessionError::SpawnFailed("PTY output is already being relayed".to_string())
        })?;

        let generation = handle.generation();
        let cancel = CancellationToken::new();
        let task = RelayTask {
            handle,
            events,
            current,
            cancel: cancel.clone(),
            read_buffer_size: read_buffer_size.max(1),
        };

        let task = tokio::spawn(task.run(reader));

        Ok(Self {
            generation,
            cancel,
            task,
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops forwarding. Events not yet delivered are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits up to `grace` for the relay to deliver everything, including the
    /// exit event. If it has not finished by then it is cancelled.
    ///
    /// Returns `true` if the relay completed on its own.
    pub async fn join(mut self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, &mut self.task).await.is_ok() {
            return true;
        }

        self.cancel.cancel();
        if tokio::time::timeout(CANCEL_JOIN_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!(generation = self.generation, "Relay task did not stop, aborting");
            self.task.abort();
        }
        false
    }
}

impl Drop for OutputRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RelayTask {
    handle: Arc<ProcessHandle>,
    events: mpsc::Sender<SessionEvent>,
    current: Arc<AtomicU64>,
    cancel: CancellationToken,
    read_buffer_size: usize,
}

enum ReadOutcome {
    Data(Box<dyn Read + Send>, Vec<u8>),
    Eof,
    Failed(std::io::Error),
}

impl RelayTask {
    async fn run(self, reader: Box<dyn Read + Send>) {
        let generation = self.handle.generation();

        // Exit is watched alongside the reads: a background job that inherited
        // the terminal can keep the PTY open long after the shell is gone.
        let process_exit = self.handle.wait_exit(&self.cancel, None);
        tokio::pin!(process_exit);

        let mut exited: Option<ProcessExit> = None;
        let mut drain_until: Option<Instant> = None;
        let mut drain_limit = Instant::now();
        let mut read = Some(self.read_chunk(reader));

        while let Some(pending) = read.as_mut() {
            // A read left behind keeps running on the blocking pool until
            // the PTY closes; its result is discarded.
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                exit = &mut process_exit, if exited.is_none() => {
                    // `None` means cancelled or unpollable; either way the
                    // status is as good as it gets.
                    exited = Some(exit.unwrap_or_else(ProcessExit::unknown));
                    let now = Instant::now();
                    drain_limit = now + EXIT_DRAIN_LIMIT;
                    drain_until = Some(now + EXIT_DRAIN_IDLE);
                    continue;
                }
                _ = sleep_until(drain_until.unwrap_or(drain_limit)), if drain_until.is_some() => {
                    tracing::debug!(generation = generation, "PTY held open after exit");
                    break;
                }
                outcome = pending => outcome,
            };
            read = None;

            match outcome {
                Ok(ReadOutcome::Data(reader, data)) => {
                    if !self.deliver(SessionEvent::Output { generation, data }).await {
                        break;
                    }
                    if drain_until.is_some() {
                        drain_until = Some((Instant::now() + EXIT_DRAIN_IDLE).min(drain_limit));
                    }
                    read = Some(self.read_chunk(reader));
                }
                Ok(ReadOutcome::Eof) => {
                    tracing::debug!(generation = generation, "PTY EOF");
                }
                Ok(ReadOutcome::Failed(e)) => {
                    // EIO is how Linux reports a closed slave side
                    tracing::debug!(generation = generation, error = %e, "PTY read ended");
                }
                Err(e) => {
                    tracing::error!(generation = generation, error = %e, "Read task panicked");
                }
            }
        }

        let exit = match exited {
            Some(exit) => Some(exit),
            None if self.cancel.is_cancelled() => {
                self.handle
                    .wait_exit(&CancellationToken::new(), Some(CANCELLED_EXIT_WAIT))
                    .await
            }
            None => process_exit.await,
        };
        let exit = exit.unwrap_or_else(ProcessExit::unknown);

        tracing::info!(
            generation = generation,
            code = ?exit.code,
            signal = ?exit.signal,
            "Shell exited"
        );

        self.deliver(SessionEvent::Exit { generation, exit }).await;
    }

    fn read_chunk(&self, mut reader: Box<dyn Read + Send>) -> JoinHandle<ReadOutcome> {
        let size = self.read_buffer_size;
        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; size];
            match reader.read(&mut buffer) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    buffer.truncate(n);
                    ReadOutcome::Data(reader, buffer)
                }
                Err(e) => ReadOutcome::Failed(e),
            }
        })
    }

    /// Pushes one event, waiting for channel capacity. Returns `false` when
    /// the relay should stop.
    async fn deliver(&self, event: SessionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let generation = event.generation();
        if self.current.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation = generation, "Dropping event from superseded generation");
            return false;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    tracing::debug!(generation = generation, "Event receiver closed");
                }
                sent.is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::TerminalSize;
    use crate::session::shell::ShellCommand;
    use tokio::time::timeout;

    fn spawn_sh(generation: Generation) -> Arc<ProcessHandle> {
        let shell = ShellCommand::new("/bin/sh");
        Arc::new(ProcessHandle::spawn(generation, &shell, TerminalSize::DEFAULT).unwrap())
    }

    /// Collects events until an exit arrives or nothing comes for a while.
    async fn collect_until_exit(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for _ in 0..100 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(event)) => {
                    let is_exit = matches!(event, SessionEvent::Exit { .. });
                    events.push(event);
                    if is_exit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        events
    }

    fn output_text(events: &[SessionEvent]) -> String {
        let bytes: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Output { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_output_then_single_exit() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(64);
        let _relay = OutputRelay::start(handle.clone(), tx, current, 4096).unwrap();

        handle.write(b"echo relay_marker; exit 3\n").await.unwrap();
        let events = collect_until_exit(&mut rx).await;

        assert!(output_text(&events).contains("relay_marker"));

        let exits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Exit { .. }))
            .collect();
        assert_eq!(exits.len(), 1);
        assert!(matches!(events.last(), Some(SessionEvent::Exit { .. })));
        match exits[0] {
            SessionEvent::Exit { generation, exit } => {
                assert_eq!(*generation, 1);
                assert_eq!(exit.code, Some(3));
            }
            _ => unreachable!(),
        }

        // Nothing after the exit
        assert!(timeout(Duration::from_millis(200), rx.recv())
            .await
            .map(|e| e.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_output_preserves_order() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(4);
        // Small reads to force many chunks through a small channel
        let _relay = OutputRelay::start(handle.clone(), tx, current, 16).unwrap();

        handle
            .write(b"i=1; while [ $i -le 200 ]; do echo line$i; i=$((i+1)); done; exit\n")
            .await
            .unwrap();
        let text = output_text(&collect_until_exit(&mut rx).await);

        let numbers: Vec<u32> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("line"))
            .filter_map(|n| n.parse().ok())
            .collect();
        assert_eq!(numbers, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_exit_not_held_back_by_background_job() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(64);
        let _relay = OutputRelay::start(handle.clone(), tx, current, 4096).unwrap();

        // The job inherits the terminal and keeps the PTY open after `exit`
        let started = std::time::Instant::now();
        handle.write(b"sleep 3 &\nexit 0\n").await.unwrap();
        let events = collect_until_exit(&mut rx).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        match events.last() {
            Some(SessionEvent::Exit { generation, exit }) => {
                assert_eq!(*generation, 1);
                assert_eq!(exit.code, Some(0));
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_superseded_generation_dropped() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(2));
        let (tx, mut rx) = mpsc::channel(64);
        let relay = OutputRelay::start(handle.clone(), tx, current, 4096).unwrap();

        handle.write(b"echo stale; exit\n").await.unwrap();
        assert!(relay.join(Duration::from_secs(5)).await);

        // Sender dropped with the task and nothing was delivered
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_kill_drains_to_exit() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, mut rx) = mpsc::channel(64);
        let relay = OutputRelay::start(handle.clone(), tx, current, 4096).unwrap();

        handle.kill().await.unwrap();
        assert!(relay.join(Duration::from_secs(5)).await);

        let events = collect_until_exit(&mut rx).await;
        let exits = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Exit { generation: 1, .. }))
            .count();
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_task() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, _rx) = mpsc::channel(64);
        let relay = OutputRelay::start(handle.clone(), tx, current, 4096).unwrap();

        relay.cancel();
        timeout(Duration::from_secs(2), async {
            while !relay.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay did not stop after cancel");

        let _ = handle.kill().await;
    }

    #[tokio::test]
    async fn test_reader_cannot_be_relayed_twice() {
        let handle = spawn_sh(1);
        let current = Arc::new(AtomicU64::new(1));
        let (tx, _rx) = mpsc::channel(64);
        let _relay = OutputRelay::start(handle.clone(), tx.clone(), current.clone(), 4096).unwrap();

        let second = OutputRelay::start(handle.clone(), tx, current, 4096);
        assert!(second.is_err());

        let _ = handle.kill().await;
    }
}
