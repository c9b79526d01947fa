//! Scalar-quantization neural codec: continuous latents ↔ waveform.
//!
//! The decoder is a DAC-style conv stack: an input conv lifts the latent
//! to the widest channel count, then one upsampling block per ratio in
//! [`CodecConfig::upsample_ratios`] (Snake → ConvTranspose1d → three
//! dilated residual units), then a final Snake + conv down to the audio
//! channel count with a tanh output clamp. One latent frame decodes to
//! exactly `hop_length` samples per channel.
//!
//! Before decoding, latents are snapped onto the scalar quantizer's uniform
//! grid so the decoder only ever sees representable values, keeping
//! encode/decode on the same discrete lattice.

use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{
    conv1d, conv_transpose1d, Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig,
    VarBuilder,
};

use crate::config::CodecConfig;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Snake1d activation: x + sin(exp(alpha) * x)^2 / exp(alpha)
// ---------------------------------------------------------------------------

/// Snake activation with a learnable per-channel alpha.
#[derive(Debug, Clone)]
struct Snake1d {
    alpha: Tensor, // [1, channels, 1]
}

impl Snake1d {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let alpha = vb.get((1, channels, 1), "alpha")?;
        Ok(Self { alpha })
    }
}

impl Module for Snake1d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let alpha_exp = self.alpha.exp()?;
        let sin_term = alpha_exp.broadcast_mul(xs)?.sin()?;
        let sin_sq = (&sin_term * &sin_term)?;
        xs + sin_sq.broadcast_div(&alpha_exp)?
    }
}

// ---------------------------------------------------------------------------
// Residual unit: Snake → Conv1d(dilated) → Snake → Conv1d(1x1) + residual
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ResidualUnit {
    snake1: Snake1d,
    conv1: Conv1d,
    snake2: Snake1d,
    conv2: Conv1d,
}

impl ResidualUnit {
    fn new(dim: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        // Padding keeps the sequence length exact for kernel 7.
        let pad = ((7 - 1) * dilation) / 2;
        let cfg1 = Conv1dConfig {
            dilation,
            padding: pad,
            ..Default::default()
        };
        Ok(Self {
            snake1: Snake1d::new(dim, vb.pp("snake1"))?,
            conv1: conv1d(dim, dim, 7, cfg1, vb.pp("conv1"))?,
            snake2: Snake1d::new(dim, vb.pp("snake2"))?,
            conv2: conv1d(dim, dim, 1, Default::default(), vb.pp("conv2"))?,
        })
    }
}

impl Module for ResidualUnit {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs
            .apply(&self.snake1)?
            .apply(&self.conv1)?
            .apply(&self.snake2)?
            .apply(&self.conv2)?;
        ys + xs
    }
}

// ---------------------------------------------------------------------------
// Decoder block: Snake → ConvTranspose1d(upsample) → 3x ResidualUnit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DecoderBlock {
    snake: Snake1d,
    conv_t: ConvTranspose1d,
    res_units: Vec<ResidualUnit>,
}

impl DecoderBlock {
    fn new(in_dim: usize, out_dim: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = ConvTranspose1dConfig {
            stride,
            padding: stride.div_ceil(2),
            ..Default::default()
        };
        let conv_t = conv_transpose1d(in_dim, out_dim, 2 * stride, cfg, vb.pp("conv_t"))?;
        let res_units = [1usize, 3, 9]
            .iter()
            .enumerate()
            .map(|(i, &dilation)| {
                ResidualUnit::new(out_dim, dilation, vb.pp(format!("res_units.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            snake: Snake1d::new(in_dim, vb.pp("snake"))?,
            conv_t,
            res_units,
        })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = xs.apply(&self.snake)?.apply(&self.conv_t)?;
        for unit in &self.res_units {
            h = h.apply(unit)?;
        }
        Ok(h)
    }
}

// ---------------------------------------------------------------------------
// Encoder block: 3x ResidualUnit → Snake → strided Conv1d (downsample)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct EncoderBlock {
    res_units: Vec<ResidualUnit>,
    snake: Snake1d,
    conv: Conv1d,
}

impl EncoderBlock {
    fn new(in_dim: usize, out_dim: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let res_units = [1usize, 3, 9]
            .iter()
            .enumerate()
            .map(|(i, &dilation)| {
                ResidualUnit::new(in_dim, dilation, vb.pp(format!("res_units.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let cfg = Conv1dConfig {
            stride,
            padding: stride.div_ceil(2),
            ..Default::default()
        };
        Ok(Self {
            res_units,
            snake: Snake1d::new(in_dim, vb.pp("snake"))?,
            conv: conv1d(in_dim, out_dim, 2 * stride, cfg, vb.pp("conv"))?,
        })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for unit in &self.res_units {
            h = h.apply(unit)?;
        }
        h.apply(&self.snake)?.apply(&self.conv)
    }
}

// ---------------------------------------------------------------------------
// Scalar quantizer
// ---------------------------------------------------------------------------

/// Uniform scalar quantizer over `[-quant_range, quant_range]` with
/// `quant_levels` levels per latent dimension.
#[derive(Debug, Clone)]
pub struct ScalarQuantizer {
    levels: usize,
    range: f32,
}

impl ScalarQuantizer {
    pub fn new(cfg: &CodecConfig) -> Result<Self> {
        if cfg.quant_levels < 2 {
            return Err(Error::InvalidInput(format!(
                "quant_levels must be >= 2, got {}",
                cfg.quant_levels
            )));
        }
        if !(cfg.quant_range > 0.0) {
            return Err(Error::InvalidInput(format!(
                "quant_range must be positive, got {}",
                cfg.quant_range
            )));
        }
        Ok(Self {
            levels: cfg.quant_levels,
            range: cfg.quant_range,
        })
    }

    /// Grid spacing between adjacent levels.
    pub fn step(&self) -> f32 {
        2.0 * self.range / (self.levels - 1) as f32
    }

    /// Clamp to the representable range and round onto the grid.
    pub fn quantize(&self, values: &[f32]) -> Vec<u32> {
        let step = self.step();
        values
            .iter()
            .map(|&v| {
                let v = v.clamp(-self.range, self.range);
                (((v + self.range) / step).round() as u32).min(self.levels as u32 - 1)
            })
            .collect()
    }

    /// Map grid indices back to latent values.
    pub fn dequantize(&self, indices: &[u32]) -> Vec<f32> {
        let step = self.step();
        indices
            .iter()
            .map(|&i| i.min(self.levels as u32 - 1) as f32 * step - self.range)
            .collect()
    }

    /// Round-trip: the nearest representable value for each input.
    pub fn snap(&self, values: &[f32]) -> Vec<f32> {
        self.dequantize(&self.quantize(values))
    }
}

// ---------------------------------------------------------------------------
// Full codec
// ---------------------------------------------------------------------------

/// Neural codec with a scalar-quantized latent bottleneck.
#[derive(Debug, Clone)]
pub struct ScalarCodec {
    quantizer: ScalarQuantizer,
    enc_conv_in: Conv1d,
    enc_blocks: Vec<EncoderBlock>,
    enc_snake: Snake1d,
    enc_conv_out: Conv1d,
    dec_conv_in: Conv1d,
    dec_blocks: Vec<DecoderBlock>,
    dec_snake: Snake1d,
    dec_conv_out: Conv1d,
    cfg: CodecConfig,
    device: Device,
}

impl ScalarCodec {
    pub fn new(cfg: &CodecConfig, device: &Device, vb: VarBuilder) -> Result<Self> {
        let quantizer = ScalarQuantizer::new(cfg)?;
        // The transposed convs use kernel 2s with padding s/2; odd ratios
        // would break the exact T → T*s length relation.
        if let Some(&ratio) = cfg.upsample_ratios.iter().find(|r| *r % 2 != 0) {
            return Err(Error::InvalidInput(format!(
                "upsample ratios must be even, got {ratio}"
            )));
        }
        let n_blocks = cfg.upsample_ratios.len();
        let channels = cfg.decoder_channels;
        let audio_channels = cfg.audio_channels as usize;
        // Channel widths double towards the latent end of the stack.
        let width = |i: usize| channels * (1 << i);

        let conv_io_cfg = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };

        // Encoder: audio → (progressively narrower in time, wider in
        // channels) → latent. Strides run innermost-first.
        let enc_vb = vb.pp("encoder");
        let enc_conv_in = conv1d(
            audio_channels,
            channels,
            7,
            conv_io_cfg,
            enc_vb.pp("conv_in"),
        )?;
        let mut enc_blocks = Vec::with_capacity(n_blocks);
        for (i, &stride) in cfg.upsample_ratios.iter().rev().enumerate() {
            enc_blocks.push(EncoderBlock::new(
                width(i),
                width(i + 1),
                stride,
                enc_vb.pp(format!("blocks.{i}")),
            )?);
        }
        let enc_snake = Snake1d::new(width(n_blocks), enc_vb.pp("snake"))?;
        let enc_conv_out = conv1d(
            width(n_blocks),
            cfg.latent_dim,
            7,
            conv_io_cfg,
            enc_vb.pp("conv_out"),
        )?;

        // Decoder: mirror image, outermost ratio last.
        let dec_vb = vb.pp("decoder");
        let dec_conv_in = conv1d(
            cfg.latent_dim,
            width(n_blocks),
            7,
            conv_io_cfg,
            dec_vb.pp("conv_in"),
        )?;
        let mut dec_blocks = Vec::with_capacity(n_blocks);
        for (i, &stride) in cfg.upsample_ratios.iter().enumerate() {
            dec_blocks.push(DecoderBlock::new(
                width(n_blocks - i),
                width(n_blocks - i - 1),
                stride,
                dec_vb.pp(format!("blocks.{i}")),
            )?);
        }
        let dec_snake = Snake1d::new(channels, dec_vb.pp("snake"))?;
        let dec_conv_out = conv1d(
            channels,
            audio_channels,
            7,
            conv_io_cfg,
            dec_vb.pp("conv_out"),
        )?;

        Ok(Self {
            quantizer,
            enc_conv_in,
            enc_blocks,
            enc_snake,
            enc_conv_out,
            dec_conv_in,
            dec_blocks,
            dec_snake,
            dec_conv_out,
            cfg: cfg.clone(),
            device: device.clone(),
        })
    }

    pub fn quantizer(&self) -> &ScalarQuantizer {
        &self.quantizer
    }

    pub fn config(&self) -> &CodecConfig {
        &self.cfg
    }

    /// Encode a waveform `[B, channels, samples]` to quantized latents
    /// `[B, latent_dim, samples / hop_length]`. The sample count must be a
    /// whole number of frames.
    pub fn encode(&self, audio: &Tensor) -> Result<Tensor> {
        let (_b, _c, samples) = audio.dims3()?;
        let hop = self.cfg.hop_length();
        if samples % hop != 0 {
            return Err(Error::InvalidInput(format!(
                "audio length {samples} is not a multiple of the hop length {hop}"
            )));
        }
        let mut h = audio.apply(&self.enc_conv_in)?;
        for block in &self.enc_blocks {
            h = h.apply(block)?;
        }
        let latents = h.apply(&self.enc_snake)?.apply(&self.enc_conv_out)?;
        self.snap_tensor(&latents)
    }

    /// Decode latents `[B, latent_dim, T]` to a waveform
    /// `[B, channels, T * hop_length]`. Latents are snapped onto the
    /// quantizer grid first. The upsampling stack needs at least two frames
    /// of input; a lone frame goes through [`Self::decode_frame`].
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_b, _d, t) = latents.dims3()?;
        if t < 2 {
            return Err(Error::InvalidInput(format!(
                "decoding needs at least 2 latent frames, got {t}"
            )));
        }
        let mut h = self.snap_tensor(latents)?.apply(&self.dec_conv_in)?;
        for block in &self.dec_blocks {
            h = h.apply(block)?;
        }
        Ok(h.apply(&self.dec_snake)?
            .apply(&self.dec_conv_out)?
            .tanh()?)
    }

    /// Decode a single latent frame `[1, latent_dim]` to interleaved samples
    /// (`hop_length * audio_channels` values, channel-interleaved).
    ///
    /// The conv stack needs at least two frames of input, so the frame is
    /// decoded in a two-frame window: `prev` (the previous frame's latent,
    /// or the frame itself at the start of a run) supplies the left context
    /// and only the trailing hop of samples is returned.
    pub fn decode_frame(&self, latent: &Tensor, prev: Option<&Tensor>) -> Result<Vec<f32>> {
        let (_b, dim) = latent.dims2()?;
        if dim != self.cfg.latent_dim {
            return Err(Error::InvalidInput(format!(
                "latent width {dim} does not match codec latent_dim {}",
                self.cfg.latent_dim
            )));
        }
        let left = prev.unwrap_or(latent);
        if left.dims() != latent.dims() {
            return Err(Error::InvalidInput(format!(
                "context latent shape {:?} does not match frame shape {:?}",
                left.dims(),
                latent.dims()
            )));
        }
        let window = Tensor::cat(
            &[&left.unsqueeze(D::Minus1)?, &latent.unsqueeze(D::Minus1)?],
            D::Minus1,
        )?; // [1, latent_dim, 2]
        let hop = self.cfg.hop_length();
        let audio = self.decode(&window)?; // [1, channels, 2 * hop]
        let audio = audio.narrow(D::Minus1, hop, hop)?.contiguous()?;
        let (_b, channels, samples) = audio.dims3()?;
        let mut interleaved = Vec::with_capacity(channels * samples);
        let planar: Vec<Vec<f32>> = (0..channels)
            .map(|c| audio.i((0, c))?.to_vec1::<f32>())
            .collect::<candle_core::Result<_>>()?;
        for s in 0..samples {
            for plane in &planar {
                interleaved.push(plane[s]);
            }
        }
        Ok(interleaved)
    }

    /// Snap a latent tensor onto the quantizer grid.
    fn snap_tensor(&self, latents: &Tensor) -> Result<Tensor> {
        let shape = latents.dims().to_vec();
        let flat: Vec<f32> = latents
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let snapped = self.quantizer.snap(&flat);
        Ok(Tensor::from_vec(snapped, shape, &self.device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg() -> CodecConfig {
        CodecConfig {
            latent_dim: 4,
            decoder_channels: 4,
            audio_channels: 2,
            upsample_ratios: vec![2, 4],
            sample_rate: 100,
            quant_levels: 16,
            quant_range: 4.0,
        }
    }

    fn tiny_codec() -> ScalarCodec {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        ScalarCodec::new(&tiny_cfg(), &Device::Cpu, vb).unwrap()
    }

    #[test]
    fn test_quantizer_round_trip_error_is_bounded() {
        let q = ScalarQuantizer::new(&tiny_cfg()).unwrap();
        let half_step = q.step() / 2.0;
        let values: Vec<f32> = (0..1000).map(|i| (i as f32 / 999.0) * 8.0 - 4.0).collect();
        for (orig, snapped) in values.iter().zip(q.snap(&values).iter()) {
            assert!(
                (orig - snapped).abs() <= half_step + 1e-6,
                "round-trip error for {orig} was {}",
                (orig - snapped).abs()
            );
        }
    }

    #[test]
    fn test_quantizer_clamps_out_of_range() {
        let q = ScalarQuantizer::new(&tiny_cfg()).unwrap();
        let snapped = q.snap(&[100.0, -100.0]);
        assert!((snapped[0] - 4.0).abs() < 1e-6);
        assert!((snapped[1] - -4.0).abs() < 1e-6);
    }

    #[test]
    fn test_quantizer_is_idempotent() {
        let q = ScalarQuantizer::new(&tiny_cfg()).unwrap();
        let values = vec![0.13, -2.7, 3.99, -0.01];
        let once = q.snap(&values);
        let twice = q.snap(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_quantizer_rejects_degenerate_config() {
        let mut cfg = tiny_cfg();
        cfg.quant_levels = 1;
        assert!(matches!(
            ScalarQuantizer::new(&cfg),
            Err(Error::InvalidInput(_))
        ));
        let mut cfg = tiny_cfg();
        cfg.quant_range = 0.0;
        assert!(matches!(
            ScalarQuantizer::new(&cfg),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_decode_frame_yields_one_hop_of_interleaved_audio() {
        let codec = tiny_codec();
        // A lone first frame (no history) must decode cleanly.
        let latent = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let samples = codec.decode_frame(&latent, None).unwrap();
        // hop = 2 * 4 = 8 samples per channel, stereo interleaved.
        assert_eq!(samples.len(), 8 * 2);
        assert!(samples.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }

    #[test]
    fn test_decode_frame_accepts_previous_frame_context() {
        let codec = tiny_codec();
        let prev = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let latent = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let samples = codec.decode_frame(&latent, Some(&prev)).unwrap();
        assert_eq!(samples.len(), 8 * 2);
        assert!(samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_decode_rejects_single_frame_batches() {
        let codec = tiny_codec();
        let latents = Tensor::zeros((1, 4, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(codec.decode(&latents), Err(Error::InvalidInput(_))));
        let latents = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let audio = codec.decode(&latents).unwrap();
        assert_eq!(audio.dims(), &[1, 2, 16]);
    }

    #[test]
    fn test_decode_frame_rejects_wrong_latent_width() {
        let codec = tiny_codec();
        let latent = Tensor::zeros((1, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            codec.decode_frame(&latent, None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_odd_upsample_ratios_are_rejected() {
        let mut cfg = tiny_cfg();
        cfg.upsample_ratios = vec![2, 3];
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            ScalarCodec::new(&cfg, &Device::Cpu, vb),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_encode_requires_whole_frames() {
        let codec = tiny_codec();
        let audio = Tensor::zeros((1, 2, 13), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(codec.encode(&audio), Err(Error::InvalidInput(_))));
        let audio = Tensor::zeros((1, 2, 16), DType::F32, &Device::Cpu).unwrap();
        let latents = codec.encode(&audio).unwrap();
        assert_eq!(latents.dims(), &[1, 4, 2]);
    }
}
