//! The stage contract every pipeline member implements.
//!
//! A stage is one unit of a pipeline: typically one subprocess
//! ([`ProcessStage`](crate::ProcessStage)), or a pure byte transform
//! ([`FnStage`](crate::FnStage)). The pipeline drives every stage through
//! this trait and never branches on the concrete type.
//!
//! Methods take `&self`: one stage can be serviced by two boundary tasks
//! at once (feeding its input while draining its output), so runtime state
//! lives behind interior mutability inside each implementation.

use async_trait::async_trait;

use crate::channel::{ChunkReceiver, ChunkSender};
use crate::error::PipelineError;

/// One unit of a pipeline: something that can stream bytes in and out.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Prepare the stage to run, allocating whatever resources it needs
    /// (a `ProcessStage` spawns its OS process here). `input` is the
    /// pipeline's initial message, passed only to the first stage of a
    /// chain.
    ///
    /// Only spawn failures surface; everything later in a stage's life is
    /// recovered locally.
    async fn start(&self, input: Option<Vec<u8>>) -> Result<(), PipelineError>;

    /// Drain this stage's output into `tx`, then close both the output
    /// and the channel (the channel closes when `tx` is dropped).
    async fn send_to_channel(&self, tx: ChunkSender);

    /// Consume `rx` into this stage's input, in receipt order. When the
    /// channel ends, half-close the input (for a process: EOF on stdin)
    /// while leaving the output side untouched.
    async fn receive_from_channel(&self, rx: ChunkReceiver);

    /// Pull the next chunk of output, at most `max_bytes` long. `None`
    /// means end of stream.
    async fn receive_some(&self, max_bytes: usize) -> Option<Vec<u8>>;

    /// Best-effort termination. Idempotent; must not fail for a stage
    /// that never started or already exited.
    async fn stop(&self);
}
