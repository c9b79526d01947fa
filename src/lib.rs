//! Cantus — lyrics-conditioned music generation in pure Rust.
//!
//! A candle-based autoregressive music generator: lyrics and style tags
//! condition a hierarchical language model over discrete audio codebooks,
//! whose token frames are decoded through a flow-matching model and a
//! scalar-quantization codec into a stereo waveform.
//!
//! ## Architecture
//!
//! ```text
//! lyrics + tags → conditioning encoder (tokenizer + embeddings)
//!                        ↓
//!       music LM (causal transformer, CFG, top-k sampling)
//!                        ↓  one codebook tuple per frame
//!       flow-matching decoder (Euler ODE → continuous latent)
//!                        ↓
//!       scalar-quantization codec (latent → waveform chunk)
//!                        ↓
//!       crossfaded assembly → interleaved stereo samples
//! ```
//!
//! ## Modules
//!
//! - [`conditioner`] — text normalization, tag parsing, prompt embedding
//! - [`model`] — transformer blocks, music LM, sampler, flow decoder
//! - [`codec`] — scalar-quantized neural codec (latent ↔ waveform)
//! - [`pipeline`] — end-to-end frame loop with progress and cancellation
//! - [`manager`] — resident pipeline with a sequential job queue
//! - [`audio`] — WAV I/O and equal-power crossfading

pub mod audio;
pub mod codec;
pub mod conditioner;
pub mod config;
pub mod generation;
pub mod manager;
pub mod model;
pub mod pipeline;

mod error;

pub use config::CantusConfig;
pub use error::{Error, Result};
pub use generation::{
    CancelHandle, GenerationStatus, ProgressSender, ProgressUpdate, SamplingParams,
    TerminationReason,
};
pub use pipeline::{CantusPipeline, GeneratedAudio, GenerationRequest};
