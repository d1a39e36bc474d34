//! PTY process handles.
//!
//! A [`ProcessHandle`] owns one shell process running inside a pseudo-terminal
//! together with the master side of the PTY pair. Output is not read here: the
//! reader is handed out once via [`ProcessHandle::take_reader`] and drained by
//! the [`OutputRelay`](super::relay::OutputRelay).
//!
//! Nothing here blocks an async worker. Input is written by a dedicated
//! thread per process, and killing or reaping the child runs on the blocking
//! pool.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, TryLockError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::shell::ShellCommand;

/// Identifies one spawn attempt within a session. Strictly increasing.
pub type Generation = u64;

/// How often a handle checks whether its child has been reaped.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Input chunks queued for the writer thread before further input is refused.
const INPUT_QUEUE: usize = 1024;

type SharedChild = Arc<StdMutex<Box<dyn Child + Send + Sync>>>;

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The shell could not be started.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// The process has exited or was killed.
    #[error("process already terminated (generation {0})")]
    AlreadyTerminated(Generation),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to deliver the termination request.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// Terminal dimensions must be positive.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub const DEFAULT: TerminalSize = TerminalSize { cols: 80, rows: 30 };

    /// Validates that both dimensions are positive.
    pub fn new(cols: u16, rows: u16) -> Result<Self, SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    fn pack(self) -> u32 {
        (u32::from(self.cols) << 16) | u32::from(self.rows)
    }

    fn unpack(packed: u32) -> Self {
        Self {
            cols: (packed >> 16) as u16,
            rows: (packed & 0xFFFF) as u16,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a process ended. Exactly one of the two fields is set when the
/// platform reports it; both are `None` if the status could not be collected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code for a normal exit.
    pub code: Option<i32>,
    /// Signal description when the process was terminated by a signal.
    pub signal: Option<String>,
}

impl ProcessExit {
    /// An exit whose status could not be observed.
    pub fn unknown() -> Self {
        Self::default()
    }

    fn from_status(status: &ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Self {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => Self {
                code: Some(status.exit_code() as i32),
                signal: None,
            },
        }
    }
}

/// One chunk of input for the writer thread.
struct WriteRequest {
    data: Vec<u8>,
    reply: Option<oneshot::Sender<Result<(), SessionError>>>,
}

/// A shell process running in a PTY.
///
/// Writes and resizes go straight to the PTY; they never wait on the output
/// relay. After [`kill`](Self::kill) or process exit the handle is inert:
/// writes and resizes fail with [`SessionError::AlreadyTerminated`].
pub struct ProcessHandle {
    generation: Generation,
    pid: Option<u32>,

    /// Released on kill so the kernel can tear the PTY down.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// Feeds the writer thread. Dropping it stops the thread.
    input: StdMutex<Option<mpsc::Sender<WriteRequest>>>,

    /// Handed out once to the output relay.
    reader: StdMutex<Option<Box<dyn Read + Send>>>,

    child: SharedChild,
    exit: StdMutex<Option<ProcessExit>>,

    /// Fired by `kill`; abandons writes still waiting on the PTY.
    killed: CancellationToken,

    /// False once killed or exited.
    alive: AtomicBool,
    size: AtomicU32,
}

impl ProcessHandle {
    /// Spawns `shell` in a fresh PTY of the given size.
    pub fn spawn(
        generation: Generation,
        shell: &ShellCommand,
        size: TerminalSize,
    ) -> Result<Self, SessionError> {
        let size = TerminalSize::new(size.cols, size.rows)?;
        let program = shell.resolve()?;

        let pair = native_pty_system()
            .openpty(size.to_pty_size())
            .map_err(|e| SessionError::SpawnFailed(format!("failed to open PTY: {}", e)))?;

        let child = pair
            .slave
            .spawn_command(shell.to_command_builder(&program))
            .map_err(|e| {
                SessionError::SpawnFailed(format!("failed to start `{}`: {}", shell.program(), e))
            })?;

        // Only the child may hold the slave, otherwise the reader never sees
        // EOF when the shell exits.
        drop(pair.slave);

        let pid = child.process_id();
        let child: SharedChild = Arc::new(StdMutex::new(child));
        let killed = CancellationToken::new();

        let attached = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)))
            .map_err(|e| e.to_string())
            .and_then(|(reader, writer)| {
                let (input, requests) = mpsc::channel(INPUT_QUEUE);
                spawn_writer(generation, writer, requests, killed.clone())
                    .map_err(|e| e.to_string())?;
                Ok((reader, input))
            });
        let (reader, input) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                reap_in_background(child);
                return Err(SessionError::SpawnFailed(format!(
                    "failed to attach to PTY: {}",
                    e
                )));
            }
        };

        tracing::info!(
            generation = generation,
            pid = ?pid,
            shell = %shell.program(),
            cols = size.cols,
            rows = size.rows,
            "Spawned shell"
        );

        Ok(Self {
            generation,
            pid,
            master: Mutex::new(Some(pair.master)),
            input: StdMutex::new(Some(input)),
            reader: StdMutex::new(Some(reader)),
            child,
            exit: StdMutex::new(None),
            killed,
            alive: AtomicBool::new(true),
            size: AtomicU32::new(size.pack()),
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the last size applied to the PTY.
    pub fn size(&self) -> TerminalSize {
        TerminalSize::unpack(self.size.load(Ordering::SeqCst))
    }

    /// Returns whether the process can still accept input.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Takes the PTY output reader. Returns `None` on every call after the first.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Queues input for the shell without waiting for it to reach the PTY.
    ///
    /// Fails with [`SessionError::WriteFailed`] if the shell has stopped
    /// reading and the input queue is full.
    pub fn send_input(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.enqueue(data, None)
    }

    /// Writes data to the shell's input and waits until the PTY accepted it.
    ///
    /// A write stuck behind a shell that does not read its input is abandoned
    /// with [`SessionError::AlreadyTerminated`] once the handle is killed.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let (reply, written) = oneshot::channel();
        self.enqueue(data.to_vec(), Some(reply))?;

        tokio::select! {
            biased;
            _ = self.killed.cancelled() => Err(SessionError::AlreadyTerminated(self.generation)),
            result = written => {
                result.unwrap_or(Err(SessionError::AlreadyTerminated(self.generation)))
            }
        }
    }

    fn enqueue(
        &self,
        data: Vec<u8>,
        reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    ) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.generation));
        }

        let input = self
            .input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = input
            .as_ref()
            .ok_or(SessionError::AlreadyTerminated(self.generation))?;

        sender
            .try_send(WriteRequest { data, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    SessionError::WriteFailed("input queue full".to_string())
                }
                TrySendError::Closed(_) => SessionError::AlreadyTerminated(self.generation),
            })
    }

    /// Changes the PTY window size; the kernel notifies the shell.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let size = TerminalSize::new(size.cols, size.rows)?;
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.generation));
        }

        let guard = self.master.lock().await;
        let master = guard
            .as_ref()
            .ok_or(SessionError::AlreadyTerminated(self.generation))?;

        master
            .resize(size.to_pty_size())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        self.size.store(size.pack(), Ordering::SeqCst);

        tracing::debug!(
            generation = self.generation,
            cols = size.cols,
            rows = size.rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Reads the window size back from the PTY itself.
    pub async fn pty_size(&self) -> Result<TerminalSize, SessionError> {
        let guard = self.master.lock().await;
        let master = guard
            .as_ref()
            .ok_or(SessionError::AlreadyTerminated(self.generation))?;
        let size = master
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        Ok(TerminalSize {
            cols: size.cols,
            rows: size.rows,
        })
    }

    /// Terminates the process and releases the PTY master and input.
    ///
    /// Safe to call any number of times, including after the process exited
    /// on its own.
    pub async fn kill(&self) -> Result<(), SessionError> {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.killed.cancel();

        self.input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.master.lock().await.take();

        if self.recorded_exit().is_some() {
            return Ok(());
        }

        // The platform kill waits for the child to react to SIGHUP
        let child = Arc::clone(&self.child);
        let generation = self.generation;
        let outcome = tokio::task::spawn_blocking(move || terminate(generation, &child))
            .await
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        match outcome {
            Ok(Some(exit)) => self.record_exit(exit),
            Ok(None) => {
                if was_alive {
                    tracing::info!(generation = self.generation, pid = ?self.pid, "Killed shell");
                }
            }
            Err(e) => return Err(SessionError::KillFailed(e.to_string())),
        }

        Ok(())
    }

    /// Checks whether the process has exited, without waiting.
    pub async fn try_exit_status(&self) -> Result<Option<ProcessExit>, SessionError> {
        if let Some(exit) = self.recorded_exit() {
            return Ok(Some(exit));
        }

        let status = match self.child.try_lock() {
            Ok(mut child) => child.try_wait()?,
            // A kill is running on the blocking pool; ask again later
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().try_wait()?,
        };

        match status {
            Some(status) => {
                let exit = ProcessExit::from_status(&status);
                self.record_exit(exit.clone());
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    /// Waits for the process to exit.
    ///
    /// Returns `None` if `cancel` fires first. If `limit` is given, gives up
    /// after that long and also returns `None`.
    pub async fn wait_exit(
        &self,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Option<ProcessExit> {
        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);

        loop {
            match self.try_exit_status().await {
                Ok(Some(exit)) => return Some(exit),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(generation = self.generation, error = %e, "Failed to poll shell status");
                    return None;
                }
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return None;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
            }
        }
    }

    fn recorded_exit(&self) -> Option<ProcessExit> {
        self.exit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_exit(&self, exit: ProcessExit) {
        self.alive.store(false, Ordering::SeqCst);
        let mut slot = self.exit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            tracing::debug!(
                generation = self.generation,
                code = ?exit.code,
                signal = ?exit.signal,
                "Shell exited"
            );
            *slot = Some(exit);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.killed.cancel();
        if self.recorded_exit().is_none() {
            reap_in_background(Arc::clone(&self.child));
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("size", &self.size())
            .finish()
    }
}

fn spawn_writer(
    generation: Generation,
    writer: Box<dyn Write + Send>,
    requests: mpsc::Receiver<WriteRequest>,
    killed: CancellationToken,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-writer-{}", generation))
        .spawn(move || run_writer(generation, writer, requests, killed))
        .map(|_| ())
}

/// Copies queued input into the PTY until the handle lets go of the queue.
fn run_writer(
    generation: Generation,
    mut writer: Box<dyn Write + Send>,
    mut requests: mpsc::Receiver<WriteRequest>,
    killed: CancellationToken,
) {
    while let Some(request) = requests.blocking_recv() {
        if killed.is_cancelled() {
            break;
        }

        let result = writer
            .write_all(&request.data)
            .and_then(|()| writer.flush())
            .map_err(|e| SessionError::WriteFailed(e.to_string()));

        match request.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(generation = generation, error = %e, "Dropped shell input");
                }
            }
        }
    }

    tracing::debug!(generation = generation, "PTY writer stopped");
}

/// Delivers the termination request unless the child is already gone.
///
/// Returns the exit status when the child had exited before the request.
fn terminate(
    generation: Generation,
    child: &StdMutex<Box<dyn Child + Send + Sync>>,
) -> std::io::Result<Option<ProcessExit>> {
    let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    match child.try_wait() {
        Ok(Some(status)) => return Ok(Some(ProcessExit::from_status(&status))),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(generation = generation, error = %e, "try_wait failed before kill");
        }
    }

    if let Err(e) = child.kill() {
        // Lost a race with a natural exit
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(Some(ProcessExit::from_status(&status)));
        }
        return Err(e);
    }

    Ok(None)
}

/// Kills and reaps a child nobody is tracking anymore.
fn reap_in_background(child: SharedChild) {
    let reap = move || {
        let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    };

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(reap);
        }
        Err(_) => reap(),
    }
}
