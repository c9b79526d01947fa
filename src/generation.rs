//! Per-run generation state and the observer-facing progress contract.
//!
//! One generation run owns exactly one [`GenerationState`]; nothing here is
//! shared between concurrent runs. Progress reporting is a best-effort,
//! one-directional push over a bounded channel — a slow or disconnected
//! observer can lose updates but can never stall the frame loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{Error, Result};

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
/// Default top-k cutoff.
pub const DEFAULT_TOP_K: usize = 50;
/// Default classifier-free guidance scale.
pub const DEFAULT_CFG_SCALE: f32 = 1.5;
/// Default maximum audio length (4 minutes).
pub const DEFAULT_MAX_AUDIO_LENGTH_MS: u64 = 240_000;

/// Immutable per-run sampling configuration.
///
/// Frozen for the duration of one generation; no mid-run mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Softmax temperature. Must be > 0; values approaching 0 degenerate
    /// smoothly to arg-max selection among the top-k candidates.
    pub temperature: f32,
    /// Number of highest-logit candidates kept per draw. Must be >= 1.
    pub top_k: usize,
    /// Classifier-free guidance scale. Must be >= 0; at exactly 1.0 the
    /// unconditional pass is skipped entirely.
    pub cfg_scale: f32,
    /// Upper bound on the generated audio duration.
    pub max_audio_length_ms: u64,
    /// Random seed for the sampler and the flow decoder's initial latents.
    /// `None` draws a fresh seed at run start.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            cfg_scale: DEFAULT_CFG_SCALE,
            max_audio_length_ms: DEFAULT_MAX_AUDIO_LENGTH_MS,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Validate ranges. Called before any model invocation.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(Error::InvalidInput(format!(
                "temperature must be a finite value > 0, got {}",
                self.temperature
            )));
        }
        if self.top_k < 1 {
            return Err(Error::InvalidInput("top_k must be >= 1".into()));
        }
        if !(self.cfg_scale >= 0.0) || !self.cfg_scale.is_finite() {
            return Err(Error::InvalidInput(format!(
                "cfg_scale must be a finite value >= 0, got {}",
                self.cfg_scale
            )));
        }
        if self.max_audio_length_ms == 0 {
            return Err(Error::InvalidInput("max_audio_length_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Whether the unconditional pass is needed at all.
    ///
    /// At `cfg_scale == 1.0` guidance reduces exactly to the conditional
    /// logits, so the second batch row is skipped.
    pub fn uses_guidance(&self) -> bool {
        (self.cfg_scale - 1.0).abs() > f32::EPSILON
    }
}

/// Codebook indices for one frame, in hierarchy order.
pub type FrameTokens = Vec<u32>;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Frame budget exhausted (`cursor >= max_frames`).
    MaxLength,
    /// The model emitted an end-of-audio token.
    EndToken,
    /// The caller cancelled the run.
    Cancelled,
}

/// Mutable, single-owner record of one generation run.
#[derive(Debug)]
pub struct GenerationState {
    cursor: usize,
    max_frames: usize,
    history: Vec<FrameTokens>,
    terminated: Option<TerminationReason>,
}

impl GenerationState {
    pub fn new(max_frames: usize) -> Self {
        Self {
            cursor: 0,
            max_frames,
            history: Vec::with_capacity(max_frames),
            terminated: None,
        }
    }

    /// Frames emitted so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Append-only autoregressive context.
    pub fn history(&self) -> &[FrameTokens] {
        &self.history
    }

    /// Most recently emitted frame, if any.
    pub fn last_frame(&self) -> Option<&FrameTokens> {
        self.history.last()
    }

    /// Record a completed frame and advance the cursor.
    ///
    /// Panics if called after termination — the frame loop must check
    /// [`GenerationState::terminated`] first.
    pub fn push_frame(&mut self, tokens: FrameTokens) {
        assert!(self.terminated.is_none(), "push_frame after termination");
        self.history.push(tokens);
        self.cursor += 1;
    }

    /// Whether the frame budget is exhausted.
    pub fn budget_exhausted(&self) -> bool {
        self.cursor >= self.max_frames
    }

    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.terminated.is_none() {
            self.terminated = Some(reason);
        }
    }

    pub fn terminated(&self) -> Option<TerminationReason> {
        self.terminated
    }
}

/// Cooperative cancellation flag, polled once per frame boundary.
///
/// Cancellation is not preemptive: worst-case latency is one full frame's
/// model + decode cost.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; safe from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Run status as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Queued,
    Loading,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Queued => "queued",
            GenerationStatus::Loading => "loading",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Cancelled => "cancelled",
        }
    }
}

/// One progress observation pushed to the observer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub status: GenerationStatus,
    /// Completion fraction in `[0, 1]`.
    pub progress: f32,
    pub current_frame: usize,
    pub total_frames: usize,
    /// Set only on the final `Completed` update.
    pub output_path: Option<PathBuf>,
    /// Set only on the final `Failed` update.
    pub error: Option<String>,
}

impl ProgressUpdate {
    /// A bare status observation, before any frame counts exist
    /// (`Queued`, `Loading`).
    pub fn status_only(status: GenerationStatus) -> Self {
        Self {
            status,
            progress: 0.0,
            current_frame: 0,
            total_frames: 0,
            output_path: None,
            error: None,
        }
    }

    /// A mid-run `Generating` observation.
    pub fn generating(current_frame: usize, total_frames: usize) -> Self {
        let progress = if total_frames == 0 {
            0.0
        } else {
            current_frame as f32 / total_frames as f32
        };
        Self {
            status: GenerationStatus::Generating,
            progress,
            current_frame,
            total_frames,
            output_path: None,
            error: None,
        }
    }

    pub fn terminal(status: GenerationStatus, current_frame: usize, total_frames: usize) -> Self {
        Self {
            status,
            progress: if status == GenerationStatus::Completed {
                1.0
            } else if total_frames == 0 {
                0.0
            } else {
                current_frame as f32 / total_frames as f32
            },
            current_frame,
            total_frames,
            output_path: None,
            error: None,
        }
    }
}

/// Best-effort progress push from the frame loop to an observer.
///
/// Backed by a bounded channel; `push` uses `try_send` and drops the
/// *newest* update when the observer lags (every update supersedes the
/// previous one, so the observer only sees a slightly stale view). A
/// disconnected observer is equally harmless — the run continues to its own
/// termination condition.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressUpdate>>,
}

impl ProgressSender {
    /// Create a bounded progress channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything (no observer).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Push one update without ever blocking.
    pub fn push(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            match tx.try_send(update) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(update)) => {
                    tracing::trace!(
                        frame = update.current_frame,
                        "progress observer lagging, dropping update"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Observer went away; keep generating regardless.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_match_interface_defaults() {
        let p = SamplingParams::default();
        assert_eq!(p.temperature, 1.0);
        assert_eq!(p.top_k, 50);
        assert_eq!(p.cfg_scale, 1.5);
        assert_eq!(p.max_audio_length_ms, 240_000);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_param_validation_rejects_out_of_range() {
        let bad = |f: fn(&mut SamplingParams)| {
            let mut p = SamplingParams::default();
            f(&mut p);
            p.validate()
        };
        assert!(matches!(
            bad(|p| p.temperature = 0.0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            bad(|p| p.temperature = f32::NAN),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(bad(|p| p.top_k = 0), Err(Error::InvalidInput(_))));
        assert!(matches!(
            bad(|p| p.cfg_scale = -0.5),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            bad(|p| p.max_audio_length_ms = 0),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_guidance_skipped_at_scale_one() {
        let p = SamplingParams {
            cfg_scale: 1.0,
            ..Default::default()
        };
        assert!(!p.uses_guidance());
        assert!(SamplingParams::default().uses_guidance());
    }

    #[test]
    fn test_state_advances_and_terminates_once() {
        let mut state = GenerationState::new(3);
        assert!(!state.budget_exhausted());
        state.push_frame(vec![1, 2]);
        state.push_frame(vec![3, 4]);
        state.push_frame(vec![5, 6]);
        assert!(state.budget_exhausted());
        assert_eq!(state.cursor(), 3);
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.last_frame(), Some(&vec![5, 6]));

        state.terminate(TerminationReason::MaxLength);
        // A later terminate call does not overwrite the first reason.
        state.terminate(TerminationReason::Cancelled);
        assert_eq!(state.terminated(), Some(TerminationReason::MaxLength));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_progress_push_never_blocks_on_full_channel() {
        let (sender, mut rx) = ProgressSender::channel(1);
        for i in 0..10 {
            sender.push(ProgressUpdate::generating(i, 10));
        }
        // Only the first update fit; the rest were dropped, not queued.
        let first = rx.try_recv().expect("one update should be buffered");
        assert_eq!(first.current_frame, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_progress_push_survives_dropped_receiver() {
        let (sender, rx) = ProgressSender::channel(1);
        drop(rx);
        sender.push(ProgressUpdate::generating(1, 2)); // must not panic
        ProgressSender::disabled().push(ProgressUpdate::generating(0, 1));
    }

    #[test]
    fn test_progress_fraction() {
        let u = ProgressUpdate::generating(25, 100);
        assert!((u.progress - 0.25).abs() < 1e-6);
        let done = ProgressUpdate::terminal(GenerationStatus::Completed, 100, 100);
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.status.as_str(), "completed");
        let queued = ProgressUpdate::status_only(GenerationStatus::Queued);
        assert_eq!(queued.progress, 0.0);
        assert_eq!(queued.total_frames, 0);
    }
}
