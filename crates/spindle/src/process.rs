//! Subprocess-backed pipeline stage.
//!
//! A `ProcessStage` owns exactly one OS process and its three pipes. The
//! stage spawns the process at `start`, immediately begins draining stderr
//! into an internal buffer, and streams stdout out in chunks, capped by an
//! optional byte limit and wall-clock timeout, both of which end the stream
//! by closing the stage's own descriptors rather than killing the process.
//!
//! Runtime state sits behind interior mutability: one stage is serviced by
//! two boundary tasks at once (stdin feed and stdout drain), plus its
//! private stderr task. Locks follow the pipe-buffer discipline: async
//! mutexes guard the pipes held across reads/writes; `std::sync::Mutex`
//! guards bookkeeping whose critical sections are a few loads and stores.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChunkReceiver, ChunkSender, READ_CHUNK_SIZE};
use crate::error::PipelineError;
use crate::stage::Stage;

/// A pipeline stage backed by one OS subprocess.
pub struct ProcessStage {
    argv: Vec<String>,
    env: HashMap<String, String>,
    limit: Option<usize>,
    timeout: Option<Duration>,

    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    stdout: AsyncMutex<Option<ChildStdout>>,
    stderr: Arc<StdMutex<Vec<u8>>>,
    drain: StdMutex<Option<JoinHandle<()>>>,
    feeder: StdMutex<Option<JoinHandle<()>>>,

    pid: StdMutex<Option<u32>>,
    exit: StdMutex<Option<i32>>,
    remaining: StdMutex<Option<usize>>,
    first_read: StdMutex<Option<Instant>>,
    finished: AtomicBool,
    // Tripped by stop() so a concurrent wait() holding the child lock
    // performs the kill itself instead of blocking stop out of it.
    kill: CancellationToken,
}

impl ProcessStage {
    /// Create a stage from a shell-syntax command line, split with
    /// quote-aware tokenization (`"a 'b c'"` → `["a", "b c"]`).
    pub fn new(command: &str) -> Result<Self, PipelineError> {
        let argv = shlex::split(command).unwrap_or_default();
        if argv.is_empty() {
            return Err(PipelineError::EmptyCommand(command.to_string()));
        }
        Ok(Self::from_parts(argv))
    }

    /// Create a stage from a pre-tokenized argument vector.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_parts(argv.into_iter().map(Into::into).collect())
    }

    fn from_parts(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: HashMap::new(),
            limit: None,
            timeout: None,
            child: AsyncMutex::new(None),
            stdin: AsyncMutex::new(None),
            stdout: AsyncMutex::new(None),
            stderr: Arc::new(StdMutex::new(Vec::new())),
            drain: StdMutex::new(None),
            feeder: StdMutex::new(None),
            pid: StdMutex::new(None),
            exit: StdMutex::new(None),
            remaining: StdMutex::new(None),
            first_read: StdMutex::new(None),
            finished: AtomicBool::new(false),
            kill: CancellationToken::new(),
        }
    }

    /// Append a trailing argument. Anything stringifiable is accepted and
    /// converted to text (paths, numbers, ...).
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.argv.push(arg.to_string());
        self
    }

    /// Add an environment override, merged onto a copy of the ambient
    /// environment at spawn time. Never mutates the parent's environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Cap the total bytes read from this stage's output.
    pub fn limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Bound the wall-clock time spent reading this stage's output,
    /// measured from the first chunk. The process itself is not killed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command line this stage runs, re-joined with spaces.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// The OS process id, available once the stage has started.
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// The exit code, available once the process has been waited on
    /// (via [`ProcessStage::wait`] or `stop`). `-1` stands in for a
    /// signal-killed process with no code.
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit)
    }

    /// Everything the process has sent to stderr so far, decoded as text.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.stderr)).into_owned()
    }

    /// Wait for the process to exit, record its exit code, and return it.
    /// Returns the recorded code immediately if the process was already
    /// reaped; `None` if the stage never started. Joins the stderr drain
    /// before returning, so `stderr_text` is complete afterwards.
    pub async fn wait(&self) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        let code = {
            let mut guard = self.child.lock().await;
            // stop() may have reaped the child while we queued for the
            // lock; in that case the code is already recorded.
            let Some(child) = guard.as_mut() else {
                return *lock(&self.exit);
            };
            // stop() cannot take the child lock while we hold it, so it
            // trips the kill token instead and the kill happens here.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = self.kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    *lock(&self.exit) = Some(code);
                    guard.take();
                    code
                }
                Err(_) => return None,
            }
        };
        let drain = lock(&self.drain).take();
        if let Some(handle) = drain {
            let _ = handle.await;
        }
        Some(code)
    }

    /// Close the stage's output and error descriptors. Ends the output
    /// stream and stops the stderr drain; the one mechanism that unblocks
    /// anything still trying to read from this stage.
    async fn close_output(&self) {
        self.finished.store(true, Ordering::Release);
        self.stdout.lock().await.take();
        if let Some(handle) = lock(&self.drain).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Stage for ProcessStage {
    async fn start(&self, input: Option<Vec<u8>>) -> Result<(), PipelineError> {
        if self.argv.is_empty() {
            return Err(PipelineError::EmptyCommand(String::new()));
        }
        tracing::debug!(command = %self.command_line(), "spawning stage process");

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| PipelineError::Spawn {
            command: self.command_line(),
            source,
        })?;

        *lock(&self.pid) = child.id();
        *lock(&self.remaining) = self.limit;

        if let Some(mut stderr) = child.stderr.take() {
            let buf = Arc::clone(&self.stderr);
            let handle = tokio::spawn(async move {
                let mut chunk = [0u8; READ_CHUNK_SIZE];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => lock(&buf).extend_from_slice(&chunk[..n]),
                    }
                }
            });
            *lock(&self.drain) = Some(handle);
        }

        *self.stdout.lock().await = child.stdout.take();
        *self.stdin.lock().await = child.stdin.take();
        *self.child.lock().await = Some(child);

        if let Some(message) = input {
            // Feed the initial message from a private task so a large
            // write cannot stall startup of the rest of the chain.
            if let Some(mut stdin) = self.stdin.lock().await.take() {
                let handle = tokio::spawn(async move {
                    let _ = stdin.write_all(&message).await;
                    // stdin drops here: EOF to the process
                });
                *lock(&self.feeder) = Some(handle);
            }
        }
        Ok(())
    }

    async fn send_to_channel(&self, tx: ChunkSender) {
        loop {
            let Some(chunk) = self.receive_some(READ_CHUNK_SIZE).await else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                break; // consumer is gone; stop reading
            }
        }
        // tx drops here, closing the channel
    }

    async fn receive_from_channel(&self, mut rx: ChunkReceiver) {
        while let Some(chunk) = rx.recv().await {
            let mut guard = self.stdin.lock().await;
            let Some(stdin) = guard.as_mut() else { break };
            if stdin.write_all(&chunk).await.is_err() {
                break; // process closed its end; stop feeding
            }
        }
        // Half-close: EOF on stdin, stdout/stderr untouched.
        self.stdin.lock().await.take();
    }

    async fn receive_some(&self, max_bytes: usize) -> Option<Vec<u8>> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }

        let mut want = max_bytes.min(READ_CHUNK_SIZE);
        let remaining = *lock(&self.remaining);
        if let Some(rem) = remaining {
            if rem == 0 {
                self.close_output().await;
                return None;
            }
            want = want.min(rem);
        }
        if want == 0 {
            return None;
        }

        let chunk = {
            let mut guard = self.stdout.lock().await;
            let stdout = guard.as_mut()?;
            let mut buf = vec![0u8; want];
            match stdout.read(&mut buf).await {
                Ok(0) => return None,
                Ok(n) => {
                    buf.truncate(n);
                    buf
                }
                // Pipe closed by the peer or by limit enforcement:
                // recovered here, never propagated.
                Err(_) => return None,
            }
        };

        // Byte limit first, then elapsed time.
        let spent = {
            let mut rem = lock(&self.remaining);
            match rem.as_mut() {
                Some(r) => {
                    *r = r.saturating_sub(chunk.len());
                    *r == 0
                }
                None => false,
            }
        };
        if spent {
            self.close_output().await;
        } else if let Some(timeout) = self.timeout {
            let expired = {
                let mut first = lock(&self.first_read);
                match *first {
                    None => {
                        *first = Some(Instant::now());
                        false
                    }
                    Some(t0) => t0.elapsed() >= timeout,
                }
            };
            if expired {
                // Deliberate truncation, not an error; the process keeps
                // running and its exit code is unaffected, but our ends
                // of stdout and stderr close just like on the byte cap.
                self.close_output().await;
            }
        }

        Some(chunk)
    }

    async fn stop(&self) {
        self.finished.store(true, Ordering::Release);
        let feeder = lock(&self.feeder).take();
        if let Some(handle) = feeder {
            handle.abort();
        }

        // Kill before touching the pipe mutexes: a boundary task blocked
        // in a read holds its pipe lock, and only the process dying will
        // make that read return. If another task is inside wait() it holds
        // the child lock, so the token hands the kill over to it.
        self.kill.cancel();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                // Killing an already-exited process is fine; so is
                // stopping a stage twice.
                let _ = child.start_kill();
                if let Ok(status) = child.wait().await {
                    *lock(&self.exit) = Some(status.code().unwrap_or(-1));
                }
                guard.take();
            }
        }

        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
        let drain = lock(&self.drain).take();
        if let Some(handle) = drain {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for ProcessStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStage")
            .field("argv", &self.argv)
            .field("limit", &self.limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Lock a bookkeeping mutex, recovering from poisoning (the guarded data
/// is plain values, valid regardless of where a holder panicked).
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
