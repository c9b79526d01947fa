//! Model components.
//!
//! ## Components
//!
//! - [`transformer`] — shared causal transformer building blocks (RoPE,
//!   grouped-query attention, KV cache)
//! - [`lm`] — the hierarchical music language model (sequence transformer +
//!   per-frame codebook decoder)
//! - [`sampler`] — classifier-free guidance and top-k/temperature sampling
//! - [`flow`] — flow-matching decoder (token frame → continuous latent)

pub mod flow;
pub mod lm;
pub mod sampler;
pub mod transformer;
