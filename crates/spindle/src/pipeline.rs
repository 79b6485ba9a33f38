//! Pipeline composition and execution.
//!
//! A `Pipeline` is an ordered chain of stages plus the machinery to connect
//! and drive them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Pipeline                               │
//! │  ┌─────────┐  channel   ┌─────────┐  channel   ┌─────────┐      │
//! │  │ stage 0 │───────────▶│ stage 1 │───────────▶│ stage 2 │──▶ output
//! │  └─────────┘            └─────────┘            └─────────┘      │
//! │   every boundary: one send task + one receive task, all in one  │
//! │   JoinSet under one CancellationToken                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `run` starts every stage, wires each adjacent pair with a rendezvous
//! channel, accumulates the terminal stage's output, and (once the
//! terminal channel is exhausted) trips the cancellation token and joins
//! every boundary task. No task outlives its run.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::channel::chunk_channel;
use crate::error::PipelineError;
use crate::stage::Stage;

/// Where a pipeline is in its life. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built but not yet run.
    Idle,
    /// A run is in progress.
    Running,
    /// The run finished (or was stopped). A pipeline never runs twice.
    Done,
}

/// An ordered chain of stages driven to completion as one unit.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    /// Create an empty pipeline. Append stages before running; order is
    /// fixed once the run begins.
    pub fn new() -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            stages: Vec::new(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Append a stage to the end of the chain.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a shared stage. Keep your own clone of the `Arc` to inspect
    /// the stage (exit code, stderr) after the run.
    pub fn stage_shared(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if no stages have been appended.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The pipeline's current state.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Run the chain to completion and return the terminal stage's raw
    /// output bytes. `message` is fed to the first stage's input.
    ///
    /// Fails with [`PipelineError::Spawn`] if any stage fails to start (no
    /// partial output), and with [`PipelineError::AlreadyRan`] on a
    /// pipeline that is not idle.
    #[tracing::instrument(level = "debug", skip(self, message), fields(stages = self.stages.len()))]
    pub async fn run(&self, message: Option<Vec<u8>>) -> Result<Vec<u8>, PipelineError> {
        let Some(last) = self.stages.last().cloned() else {
            return Err(PipelineError::EmptyPipeline);
        };
        let started = self.state.send_if_modified(|s| {
            if *s == PipelineState::Idle {
                *s = PipelineState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PipelineError::AlreadyRan);
        }

        // Start every stage before any wiring; only the first gets the
        // initial message. A spawn failure tears down what already started.
        let mut message = message;
        for (idx, stage) in self.stages.iter().enumerate() {
            let initial = if idx == 0 { message.take() } else { None };
            if let Err(err) = stage.start(initial).await {
                for started_stage in &self.stages[..=idx] {
                    started_stage.stop().await;
                }
                self.finish();
                return Err(err);
            }
        }

        // One channel and two cooperating tasks per adjacent boundary.
        let mut tasks = JoinSet::new();
        for pair in self.stages.windows(2) {
            let (tx, rx) = chunk_channel();
            let src = pair[0].clone();
            let token = self.cancel.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = src.send_to_channel(tx) => {}
                }
            });
            let dst = pair[1].clone();
            let token = self.cancel.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = dst.receive_from_channel(rx) => {}
                }
            });
        }

        // The terminal channel feeds the pipeline's own accumulator.
        let (tx, mut rx) = chunk_channel();
        let token = self.cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = last.send_to_channel(tx) => {}
            }
        });

        let mut output = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => output.extend_from_slice(&chunk),
                    None => break,
                },
            }
        }

        // Done before cancel: anyone woken by the token observes the
        // final state. shutdown() aborts and joins every boundary task.
        self.finish();
        tasks.shutdown().await;

        tracing::debug!(bytes = output.len(), "pipeline run complete");
        Ok(output)
    }

    /// Run and discard the output, for purely side-effecting chains.
    pub async fn play(&self) -> Result<(), PipelineError> {
        self.run(None).await.map(|_| ())
    }

    /// Run and decode the output as UTF-8 text, stripping exactly one
    /// trailing newline if present.
    pub async fn read_text(&self, message: Option<&str>) -> Result<String, PipelineError> {
        let raw = self.run(message.map(|m| m.as_bytes().to_vec())).await?;
        let mut text = String::from_utf8_lossy(&raw).into_owned();
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }

    /// Run and return the output split into lines. The empty element a
    /// trailing newline would produce is dropped.
    pub async fn read_lines(&self) -> Result<Vec<String>, PipelineError> {
        let raw = self.run(None).await?;
        let text = String::from_utf8_lossy(&raw);
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        Ok(lines)
    }

    /// Start the run as a background task and return a handle to it.
    pub fn run_in_background(self: &Arc<Self>, message: Option<Vec<u8>>) -> PipelineHandle {
        let pipeline = Arc::clone(self);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move { pipeline.run(message).await });
        PipelineHandle { task, cancel }
    }

    /// Best-effort stop: terminate every stage (kill + wait for live
    /// processes), then force Running → Done and trip the cancellation
    /// token. Idempotent; a no-op on an idle pipeline, which stays fully
    /// runnable.
    pub async fn stop(&self) {
        if self.state() == PipelineState::Idle {
            return;
        }
        for stage in &self.stages {
            stage.stop().await;
        }
        self.state.send_if_modified(|s| {
            if *s == PipelineState::Running {
                *s = PipelineState::Done;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    /// Block until the pipeline is Done.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow_and_update() != PipelineState::Done {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn finish(&self) {
        self.state.send_if_modified(|s| {
            if *s != PipelineState::Done {
                *s = PipelineState::Done;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a pipeline running in the background.
pub struct PipelineHandle {
    task: JoinHandle<Result<Vec<u8>, PipelineError>>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Wait for the background run and return its output.
    pub async fn wait(self) -> Result<Vec<u8>, PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(PipelineError::Aborted(err.to_string())),
        }
    }

    /// Trip the run's cancellation token. Cooperative: boundary tasks
    /// unblock, but live processes are only killed by `Pipeline::stop`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the run's cancellation token.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
