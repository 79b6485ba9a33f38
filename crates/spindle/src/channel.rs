//! Chunk handoff between adjacent pipeline stages.
//!
//! Each adjacent stage pair is connected by exactly one channel carrying
//! byte chunks. The channel has capacity 1 (tokio's minimum), so a send
//! blocks until the consumer has taken the previous chunk: the producer
//! can be at most one chunk ahead. That blocking is the pipeline's sole
//! backpressure mechanism, the same role the kernel's ~64KB buffer plays
//! for a real OS pipe.
//!
//! ```text
//!   stage[i] ──send_to_channel──▶ [cap 1] ──receive_from_channel──▶ stage[i+1]
//! ```
//!
//! Dropping the sender closes the channel (the receiver sees end of
//! stream); dropping the receiver makes further sends fail, which the
//! producer treats as a quiet stop.

use tokio::sync::mpsc;

/// Default read size for a single chunk pulled from a stage's output.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// One unit of data flowing between stages.
pub type Chunk = Vec<u8>;

/// Sending half of a stage boundary channel.
pub type ChunkSender = mpsc::Sender<Chunk>;

/// Receiving half of a stage boundary channel.
pub type ChunkReceiver = mpsc::Receiver<Chunk>;

/// Create a rendezvous chunk channel for one adjacent stage pair.
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(1)
}
