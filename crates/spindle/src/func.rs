//! Function-backed pipeline stage.
//!
//! `FnStage` applies a pure byte transform to its whole input and emits
//! exactly one output chunk. It exists to show the stage contract is not
//! subprocess-specific: filters and encoders slot into a chain without any
//! special-casing in the pipeline.
//!
//! Input reaches the output side over a oneshot: either the pipeline's
//! initial message at `start` (chain position 0), or the accumulated
//! contents of the upstream channel.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::channel::{ChunkReceiver, ChunkSender};
use crate::error::PipelineError;
use crate::stage::Stage;

type TransformFn = Box<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// A pipeline stage that applies one pure transform to one input.
pub struct FnStage {
    func: TransformFn,
    input_tx: StdMutex<Option<oneshot::Sender<Vec<u8>>>>,
    input_rx: AsyncMutex<Option<oneshot::Receiver<Vec<u8>>>>,
    emitted: AtomicBool,
}

impl FnStage {
    /// Wrap a transform in a stage.
    pub fn new(func: impl Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            func: Box::new(func),
            input_tx: StdMutex::new(Some(tx)),
            input_rx: AsyncMutex::new(Some(rx)),
            emitted: AtomicBool::new(false),
        }
    }

    fn take_input_sender(&self) -> Option<oneshot::Sender<Vec<u8>>> {
        self.input_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[async_trait]
impl Stage for FnStage {
    async fn start(&self, input: Option<Vec<u8>>) -> Result<(), PipelineError> {
        if let Some(bytes) = input {
            if let Some(tx) = self.take_input_sender() {
                let _ = tx.send(bytes);
            }
        }
        Ok(())
    }

    async fn send_to_channel(&self, tx: ChunkSender) {
        if let Some(chunk) = self.receive_some(usize::MAX).await {
            let _ = tx.send(chunk).await;
        }
    }

    async fn receive_from_channel(&self, mut rx: ChunkReceiver) {
        let mut input = Vec::new();
        while let Some(chunk) = rx.recv().await {
            input.extend_from_slice(&chunk);
        }
        if let Some(tx) = self.take_input_sender() {
            let _ = tx.send(input);
        }
    }

    /// The single output chunk on the first call, end of stream after.
    /// `max_bytes` is not honored: the transform's result is one chunk by
    /// contract.
    async fn receive_some(&self, _max_bytes: usize) -> Option<Vec<u8>> {
        if self.emitted.swap(true, Ordering::AcqRel) {
            return None;
        }
        let rx = self.input_rx.lock().await.take()?;
        // A dropped sender (stop, or an upstream that never delivered)
        // ends the stream quietly.
        let input = rx.await.ok()?;
        Some((self.func)(input))
    }

    async fn stop(&self) {
        // Dropping a pending sender unblocks a waiting output task.
        self.take_input_sender();
    }
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("emitted", &self.emitted.load(Ordering::Acquire))
            .finish()
    }
}
