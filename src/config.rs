//! Configuration for the cantus generation pipeline.
//!
//! [`CantusConfig`] is deserialized from the checkpoint's root `config.json`
//! and fixes everything the pipeline needs to know up front: transformer
//! shapes, codebook layout, flow integration steps, and the codec's frame
//! rate (which determines the wall-clock duration of one generated frame).

use serde::{Deserialize, Serialize};

/// Top-level pipeline configuration, read from `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CantusConfig {
    /// Checkpoint layout version (directory convention).
    #[serde(default = "default_version")]
    pub version: String,

    pub lm: LmConfig,
    pub flow: FlowConfig,
    pub codec: CodecConfig,
}

fn default_version() -> String {
    "v1".to_string()
}

impl Default for CantusConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            lm: LmConfig::default(),
            flow: FlowConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl CantusConfig {
    /// Duration of one generated frame in milliseconds.
    ///
    /// Fixed by the codec's frame rate: one LM frame maps to one latent
    /// frame which decodes to `hop_length` audio samples.
    pub fn frame_duration_ms(&self) -> f64 {
        self.codec.frame_duration_ms()
    }

    /// Frame budget for a run: `ceil(max_audio_length_ms / frame_duration_ms)`.
    ///
    /// Ceil, not floor — a trailing partial frame is generated in full.
    pub fn max_frames(&self, max_audio_length_ms: u64) -> usize {
        (max_audio_length_ms as f64 / self.frame_duration_ms()).ceil() as usize
    }
}

/// Music language model configuration (sequence transformer + codebook decoder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    // --- Sequence-level transformer ---
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    /// Maximum sequence length (conditioning prefix + generated frames).
    pub max_context: usize,

    // --- Text side ---
    /// Size of the text token vocabulary. Must match the tokenizer resource
    /// shipped in the checkpoint; validated at load time.
    pub text_vocab_size: usize,

    // --- Audio token layout ---
    /// Number of parallel codebooks per frame.
    pub num_codebooks: usize,
    /// Number of ordinary audio tokens per codebook.
    pub codebook_size: usize,

    // --- Per-frame codebook decoder ---
    pub decoder_hidden_size: usize,
    pub decoder_intermediate_size: usize,
    pub decoder_num_layers: usize,
    pub decoder_num_heads: usize,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            hidden_size: 2048,
            intermediate_size: 5632,
            num_layers: 16,
            num_heads: 16,
            num_kv_heads: 8,
            head_dim: 128,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            max_context: 8192,
            text_vocab_size: 32768,
            num_codebooks: 8,
            codebook_size: 2048,
            decoder_hidden_size: 1024,
            decoder_intermediate_size: 2816,
            decoder_num_layers: 4,
            decoder_num_heads: 8,
        }
    }
}

impl LmConfig {
    /// End-of-audio token id (shared across codebooks).
    pub fn audio_eos_id(&self) -> u32 {
        self.codebook_size as u32
    }

    /// Padding token id used when feeding frames back into the model.
    pub fn empty_id(&self) -> u32 {
        self.codebook_size as u32 + 1
    }

    /// Per-codebook vocabulary size including the EOS and padding tokens.
    pub fn audio_vocab_size(&self) -> usize {
        self.codebook_size + 2
    }

    /// Number of GQA groups (num_heads / num_kv_heads).
    pub fn num_kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

/// Flow-matching decoder configuration (token frame → continuous latent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Per-codebook token embedding width.
    pub embed_dim: usize,
    /// Velocity-field MLP width.
    pub hidden_size: usize,
    /// Number of residual blocks in the velocity field.
    pub num_blocks: usize,
    /// Euler integration step count. Fixed per configuration — this is the
    /// quality/latency trade-off point and is never resampled per call.
    pub num_steps: usize,
    /// Sigma schedule shift factor.
    pub shift: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            embed_dim: 512,
            hidden_size: 1024,
            num_blocks: 6,
            num_steps: 10,
            shift: 3.0,
        }
    }
}

impl FlowConfig {
    /// Shifted sigma schedule from 1.0 down to (exclusive) 0.0.
    ///
    /// Raw sigmas are linearly spaced; each is warped by
    /// `σ' = shift * σ / (1 + (shift - 1) * σ)` which concentrates steps
    /// near the data end of the trajectory.
    pub fn sigma_schedule(&self) -> Vec<f64> {
        (0..self.num_steps)
            .map(|i| {
                let sigma = 1.0 - i as f64 / self.num_steps as f64;
                self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
            })
            .collect()
    }
}

/// Scalar quantization codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Continuous latent width per frame.
    pub latent_dim: usize,
    /// Base channel count of the decoder conv stack.
    pub decoder_channels: usize,
    /// Output channels (2 = stereo).
    pub audio_channels: u16,
    /// Upsampling factors, outermost first. Product = samples per frame.
    pub upsample_ratios: Vec<usize>,
    pub sample_rate: u32,
    /// Number of uniform quantization levels per latent dimension.
    pub quant_levels: usize,
    /// Half-width of the quantizer's input range: values are clamped to
    /// `[-quant_range, quant_range]` before rounding onto the grid.
    pub quant_range: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            latent_dim: 64,
            decoder_channels: 96,
            audio_channels: 2,
            upsample_ratios: vec![4, 4, 4, 6, 10],
            sample_rate: 48000,
            quant_levels: 256,
            quant_range: 8.0,
        }
    }
}

impl CodecConfig {
    /// Audio samples per latent frame = product of all upsampling ratios.
    pub fn hop_length(&self) -> usize {
        self.upsample_ratios.iter().product()
    }

    /// Latent frames per second of audio.
    pub fn frame_rate_hz(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length() as f64
    }

    /// Wall-clock duration of one frame in milliseconds.
    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.frame_rate_hz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_rate() {
        let cfg = CantusConfig::default();
        assert_eq!(cfg.codec.hop_length(), 3840); // 4*4*4*6*10
        assert!((cfg.codec.frame_rate_hz() - 12.5).abs() < 1e-9);
        assert!((cfg.frame_duration_ms() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_frames_is_ceil() {
        let cfg = CantusConfig::default(); // 80 ms frames
        assert_eq!(cfg.max_frames(240_000), 3000);
        assert_eq!(cfg.max_frames(80), 1);
        // 81 ms needs a second (partial) frame
        assert_eq!(cfg.max_frames(81), 2);
        assert_eq!(cfg.max_frames(10_000), 125);
    }

    #[test]
    fn test_audio_token_layout() {
        let lm = LmConfig::default();
        assert_eq!(lm.audio_eos_id(), 2048);
        assert_eq!(lm.empty_id(), 2049);
        assert_eq!(lm.audio_vocab_size(), 2050);
        assert_eq!(lm.num_kv_groups(), 2);
    }

    #[test]
    fn test_sigma_schedule_shape() {
        let flow = FlowConfig::default();
        let sigmas = flow.sigma_schedule();
        assert_eq!(sigmas.len(), flow.num_steps);
        assert!((sigmas[0] - 1.0).abs() < 1e-12); // shift is identity at σ=1
        for w in sigmas.windows(2) {
            assert!(w[0] > w[1], "schedule must be strictly decreasing");
        }
        assert!(sigmas[sigmas.len() - 1] > 0.0);
    }

    #[test]
    fn test_sigma_schedule_shift_identity_at_1() {
        let flow = FlowConfig {
            shift: 1.0,
            num_steps: 4,
            ..Default::default()
        };
        let sigmas = flow.sigma_schedule();
        let expected = [1.0, 0.75, 0.5, 0.25];
        for (s, e) in sigmas.iter().zip(expected.iter()) {
            assert!((s - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let cfg = CantusConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CantusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lm.num_codebooks, cfg.lm.num_codebooks);
        assert_eq!(back.codec.upsample_ratios, cfg.codec.upsample_ratios);
        assert_eq!(back.version, "v1");
    }
}
