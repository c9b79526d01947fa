//! End-to-end generation pipeline.
//!
//! Orchestrates the full lyrics-to-music run:
//! 1. Validate sampling parameters and encode lyrics + tags into the
//!    conditioning prefix
//! 2. Autoregressive frame loop over the music LM (with classifier-free
//!    guidance and top-k sampling)
//! 3. Per frame: flow-matching decode to a continuous latent, codec decode
//!    to audio samples, crossfaded append to the output buffer
//! 4. Cooperative cancellation and best-effort progress at every frame
//!    boundary
//!
//! The pipeline itself is immutable after load; every run owns its own KV
//! cache, RNG, and [`GenerationState`], so one pipeline handle can serve
//! sequential runs (or concurrent runs behind the manager) without
//! cross-talk.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::audio::{append_with_crossfade, DEFAULT_CROSSFADE_SAMPLES};
use crate::codec::ScalarCodec;
use crate::conditioner::ConditioningEncoder;
use crate::config::CantusConfig;
use crate::generation::{
    CancelHandle, GenerationState, GenerationStatus, ProgressSender, ProgressUpdate,
    SamplingParams, TerminationReason,
};
use crate::model::flow::FlowDecoder;
use crate::model::lm::MusicLm;
use crate::{Error, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const LM_WEIGHTS: &str = "lm/model.safetensors";
const FLOW_WEIGHTS: &str = "flow/model.safetensors";
const CODEC_WEIGHTS: &str = "codec/model.safetensors";

/// One generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub lyrics: String,
    /// Comma-separated style tags.
    pub tags: String,
    pub params: SamplingParams,
}

/// Finished audio plus the run's bookkeeping.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Interleaved f32 samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames actually generated (excludes the EOS frame, if any).
    pub frames: usize,
    /// The seed the run used; echoing it back makes any run reproducible.
    pub seed: u64,
    pub termination: TerminationReason,
}

fn checkpoint_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(Error::Checkpoint(format!(
            "missing {name} in checkpoint directory {}",
            dir.display()
        )));
    }
    Ok(path)
}

/// The loaded model stack.
pub struct CantusPipeline {
    config: CantusConfig,
    conditioner: ConditioningEncoder,
    lm: MusicLm,
    flow: FlowDecoder,
    codec: ScalarCodec,
    /// Crossfade window at chunk joins, in sample frames.
    crossfade: usize,
}

impl std::fmt::Debug for CantusPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CantusPipeline")
            .field("version", &self.config.version)
            .field("codebooks", &self.config.lm.num_codebooks)
            .field("frame_ms", &self.config.frame_duration_ms())
            .finish_non_exhaustive()
    }
}

/// Report a failed run to the observer, then hand the error back.
fn report_failure(
    progress: &ProgressSender,
    current_frame: usize,
    total_frames: usize,
    error: Error,
) -> Error {
    let mut update =
        ProgressUpdate::terminal(GenerationStatus::Failed, current_frame, total_frames);
    update.error = Some(error.to_string());
    progress.push(update);
    error
}

impl CantusPipeline {
    /// Load a checkpoint directory.
    ///
    /// Expected layout:
    /// ```text
    /// checkpoint/
    ///   config.json
    ///   tokenizer.json
    ///   lm/model.safetensors
    ///   flow/model.safetensors
    ///   codec/model.safetensors
    /// ```
    /// Any missing piece is a [`Error::Checkpoint`] naming the file.
    pub fn load(dir: impl AsRef<Path>, device: &Device, dtype: DType) -> Result<Self> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "loading checkpoint");

        let config_json = std::fs::read_to_string(checkpoint_file(dir, CONFIG_FILE)?)?;
        let config: CantusConfig = serde_json::from_str(&config_json)?;
        let tokenizer = Tokenizer::from_file(checkpoint_file(dir, TOKENIZER_FILE)?)?;

        let lm_path = checkpoint_file(dir, LM_WEIGHTS)?;
        let lm_vb = unsafe { VarBuilder::from_mmaped_safetensors(&[lm_path], dtype, device)? };
        let conditioner =
            ConditioningEncoder::new(tokenizer, &config.lm, device, lm_vb.pp("conditioner"))?;
        let lm = MusicLm::new(&config.lm, device, lm_vb.pp("lm"))?;

        let flow_path = checkpoint_file(dir, FLOW_WEIGHTS)?;
        let flow_vb = unsafe { VarBuilder::from_mmaped_safetensors(&[flow_path], dtype, device)? };
        let flow = FlowDecoder::new(
            &config.lm,
            &config.flow,
            config.codec.latent_dim,
            device,
            flow_vb,
        )?;

        let codec_path = checkpoint_file(dir, CODEC_WEIGHTS)?;
        let codec_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[codec_path], dtype, device)? };
        let codec = ScalarCodec::new(&config.codec, device, codec_vb)?;

        info!(
            frame_ms = config.frame_duration_ms(),
            codebooks = config.lm.num_codebooks,
            "checkpoint loaded"
        );
        Ok(Self::from_parts(config, conditioner, lm, flow, codec))
    }

    /// Assemble a pipeline from already-built parts.
    pub fn from_parts(
        config: CantusConfig,
        conditioner: ConditioningEncoder,
        lm: MusicLm,
        flow: FlowDecoder,
        codec: ScalarCodec,
    ) -> Self {
        Self {
            config,
            conditioner,
            lm,
            flow,
            codec,
            crossfade: DEFAULT_CROSSFADE_SAMPLES,
        }
    }

    pub fn config(&self) -> &CantusConfig {
        &self.config
    }

    /// Run one generation to completion.
    ///
    /// Pushes a progress observation at every frame boundary and polls
    /// `cancel` there too; a cancelled run returns [`Error::Cancelled`]
    /// after at most one more frame of work. Terminal `Cancelled` and
    /// `Failed` observations carry the frame count the run reached.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSender,
        cancel: &CancelHandle,
    ) -> Result<GeneratedAudio> {
        if let Err(error) = request.params.validate() {
            return Err(report_failure(progress, 0, 0, error));
        }
        let params = &request.params;

        let conditioning = match self.conditioner.encode(&request.lyrics, &request.tags) {
            Ok(conditioning) => conditioning,
            Err(error) => return Err(report_failure(progress, 0, 0, error)),
        };
        let prefix_len = conditioning.dim(1)?;
        let max_frames = self.config.max_frames(params.max_audio_length_ms);
        if prefix_len + max_frames > self.config.lm.max_context {
            let error = Error::InvalidInput(format!(
                "conditioning ({prefix_len} tokens) plus frame budget ({max_frames}) exceeds \
                 the model context of {}",
                self.config.lm.max_context
            ));
            return Err(report_failure(progress, 0, max_frames, error));
        }

        let seed = match params.seed {
            Some(seed) => seed,
            None => rand::rng().random(),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let use_cfg = params.uses_guidance();
        let batch = if use_cfg { 2 } else { 1 };

        info!(
            seed,
            max_frames,
            prefix_len,
            cfg = use_cfg,
            "starting generation"
        );

        let channels = self.config.codec.audio_channels;
        let hop = self.config.codec.hop_length();
        let mut samples: Vec<f32> = Vec::with_capacity(max_frames * hop * channels as usize);
        let mut cache = self.lm.new_cache();
        let mut state = GenerationState::new(max_frames);
        let mut prev_latent: Option<Tensor> = None;

        let mut run = || -> Result<()> {
            let mut input = self.lm.build_prefix(&conditioning, use_cfg)?;
            progress.push(ProgressUpdate::generating(0, max_frames));
            loop {
                if cancel.is_cancelled() {
                    state.terminate(TerminationReason::Cancelled);
                    return Ok(());
                }
                if state.budget_exhausted() {
                    state.terminate(TerminationReason::MaxLength);
                    return Ok(());
                }

                let frame = self.lm.generate_frame(&input, &mut cache, params, &mut rng)?;
                if self.lm.frame_is_eos(&frame) {
                    state.terminate(TerminationReason::EndToken);
                    return Ok(());
                }

                let latent = self.flow.decode(&frame, state.cursor(), seed)?;
                let chunk = self.codec.decode_frame(&latent, prev_latent.as_ref())?;
                append_with_crossfade(&mut samples, &chunk, channels, self.crossfade);
                prev_latent = Some(latent);

                input = self.lm.embed_frame(&frame, batch)?;
                debug!(frame = state.cursor(), "frame decoded");
                state.push_frame(frame);
                progress.push(ProgressUpdate::generating(state.cursor(), max_frames));
            }
        };
        if let Err(error) = run() {
            return Err(report_failure(progress, state.cursor(), max_frames, error));
        }

        let termination = state
            .terminated()
            .unwrap_or(TerminationReason::MaxLength);
        if termination == TerminationReason::Cancelled {
            progress.push(ProgressUpdate::terminal(
                GenerationStatus::Cancelled,
                state.cursor(),
                max_frames,
            ));
            info!(frames = state.cursor(), "generation cancelled");
            return Err(Error::Cancelled);
        }

        info!(
            frames = state.cursor(),
            samples = samples.len(),
            ?termination,
            "generation finished"
        );
        Ok(GeneratedAudio {
            samples,
            sample_rate: self.config.codec.sample_rate,
            channels,
            frames: state.cursor(),
            seed,
            termination,
        })
    }
}
