//! Shared transformer building blocks for the music LM.
//!
//! Pre-norm decoder-only layers: RMSNorm → causal self-attention (GQA,
//! RoPE) → RMSNorm → SiLU-gated MLP, with residuals around both halves.
//! Attention scores are computed in f32 regardless of the model dtype.
//!
//! The KV cache is a plain concat cache owned by the caller, so the model
//! weights stay immutable and shareable across concurrent runs.

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{linear_no_bias, ops, rms_norm, Linear, Module, RmsNorm, VarBuilder};

use crate::Result;

/// Per-layer concat KV cache.
///
/// `append` returns the full key/value tensors including all previously
/// cached positions. `reset` starts a fresh sequence.
#[derive(Debug, Default, Clone)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.k.as_ref().and_then(|k| k.dim(2).ok()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `[B, H_kv, S, D]` keys/values, returning the concatenation
    /// with everything cached so far.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = match self.k.take() {
            Some(prev) => Tensor::cat(&[&prev, k], 2)?,
            None => k.clone(),
        };
        let v = match self.v.take() {
            Some(prev) => Tensor::cat(&[&prev, v], 2)?,
            None => v.clone(),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }
}

/// Pre-computed rotary embedding tables up to a fixed maximum context.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor, // [max_context, head_dim]
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64, max_context: usize, device: &Device) -> Result<Self> {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;
        let positions: Vec<f32> = (0..max_context).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (max_context, 1), device)?;
        let freqs = positions.matmul(&inv_freq)?; // [max_context, half_dim]
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?; // [max_context, head_dim]
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Apply RoPE to `x` of shape `[B, H, S, D]` for absolute positions
    /// `offset .. offset + S`.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let seq_len = x.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;

        let x = x.to_dtype(DType::F32)?;
        // rotate_half: [-x[..., D/2:], x[..., :D/2]]
        let half = x.dim(D::Minus1)? / 2;
        let x_first = x.narrow(D::Minus1, 0, half)?;
        let x_second = x.narrow(D::Minus1, half, half)?;
        let x_rotated = Tensor::cat(&[&x_second.neg()?, &x_first], D::Minus1)?;

        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
        let out = (x.broadcast_mul(&cos)? + x_rotated.broadcast_mul(&sin)?)?;
        Ok(out.to_dtype(x_dtype)?)
    }
}

/// Build a causal attention mask `[1, 1, S, S + offset]`.
///
/// The `offset` prefix (already-cached positions) is fully visible; within
/// the new block, position `i` sees positions `<= i`.
pub fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0f32; seq_len * (seq_len + offset)];
    for i in 0..seq_len {
        for j in 0..seq_len {
            if j > i {
                mask[i * (seq_len + offset) + offset + j] = f32::NEG_INFINITY;
            }
        }
    }
    let mask = Tensor::from_vec(mask, (seq_len, seq_len + offset), device)?;
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

/// Repeat KV heads for grouped-query attention: `[B, H_kv, S, D]` →
/// `[B, H_kv * groups, S, D]`.
fn repeat_kv(x: Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(x);
    }
    let (b, h_kv, s, d) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, h_kv, groups, s, d))?
        .reshape((b, h_kv * groups, s, d))?;
    Ok(x)
}

/// Causal self-attention with grouped KV heads.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, S, hidden]`
    /// - `mask`: optional `[1, 1, S, S_total]` additive mask
    /// - `rope` applied at absolute positions `offset..offset+S`
    /// - `cache`: pass `Some` to extend a sequence incrementally
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = rope.apply(&q, offset)?;
        let k = rope.apply(&k, offset)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k.contiguous()?, &v.contiguous()?)?,
            None => (k, v),
        };

        let groups = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, groups)?;
        let v = repeat_kv(v, groups)?;

        // Scores in f32 for stability.
        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?.contiguous()?;
        let k = k.to_dtype(DType::F32)?.contiguous()?;
        let v = v.to_dtype(DType::F32)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v)?.to_dtype(in_dtype)?;

        let out = out
            .transpose(1, 2)?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// SiLU-gated feed-forward: `down(silu(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct SiluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl SiluMlp {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gated = (ops::silu(&self.gate_proj.forward(x)?)? * self.up_proj.forward(x)?)?;
        Ok(self.down_proj.forward(&gated)?)
    }
}

/// Pre-norm decoder layer: attention and MLP, each with a residual.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    self_attn: Attention,
    mlp: SiluMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl TransformerLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        rms_norm_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(
                hidden_size,
                num_heads,
                num_kv_heads,
                head_dim,
                vb.pp("self_attn"),
            )?,
            mlp: SiluMlp::new(hidden_size, intermediate_size, vb.pp("mlp"))?,
            input_layernorm: rms_norm(hidden_size, rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                hidden_size,
                rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, mask, rope, offset, cache)?;
        let h = (residual + h)?;

        let residual = &h;
        let m = self.post_attention_layernorm.forward(&h)?;
        let m = self.mlp.forward(&m)?;
        Ok((residual + m)?)
    }
}

/// Return the last position's hidden state: `[B, S, H]` → `[B, H]`.
pub fn last_hidden(x: &Tensor) -> Result<Tensor> {
    let s = x.dim(1)?;
    Ok(x.i((.., s - 1, ..))?.contiguous()?)
}
