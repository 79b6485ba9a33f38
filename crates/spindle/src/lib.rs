//! spindle: an async subprocess pipeline engine.
//!
//! Chains OS processes the way a shell pipe (`a | b | c`) does, but under
//! explicit asynchronous control. This crate provides:
//!
//! - **Stage**: The contract every pipeline stage implements (start,
//!   stream-out, stream-in, pull-chunk, stop)
//! - **ProcessStage**: A stage backed by one OS subprocess, with per-stage
//!   byte limits, timeouts, and stderr capture
//! - **FnStage**: A stage backed by a pure byte transform, proving the
//!   contract is not subprocess-specific
//! - **Pipeline**: Wires adjacent stages with rendezvous channels, drives
//!   the chain to completion under one cancellation scope, and accumulates
//!   the terminal stage's output
//!
//! # Example
//!
//! ```no_run
//! use spindle::{Pipeline, ProcessStage};
//!
//! # async fn demo() -> Result<(), spindle::PipelineError> {
//! let sorted = Pipeline::new()
//!     .stage(ProcessStage::new("cat")?)
//!     .stage(ProcessStage::new("sort")?)
//!     .read_text(Some("cherry\napple\nbanana"))
//!     .await?;
//! assert_eq!(sorted, "apple\nbanana\ncherry");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod func;
pub mod pipeline;
pub mod process;
pub mod stage;

pub use channel::{chunk_channel, Chunk, ChunkReceiver, ChunkSender, READ_CHUNK_SIZE};
pub use error::PipelineError;
pub use func::FnStage;
pub use pipeline::{Pipeline, PipelineHandle, PipelineState};
pub use process::ProcessStage;
pub use stage::Stage;
