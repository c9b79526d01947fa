//! Generation manager — keeps the pipeline resident and queues requests.
//!
//! The manager owns one [`CantusPipeline`] and processes submitted jobs
//! sequentially on a dedicated blocking thread. Each job gets its own
//! progress channel and cancellation handle via the returned [`JobHandle`];
//! finished audio is written to the configured output directory as WAV.
//!
//! # Example
//!
//! ```no_run
//! use cantus::manager::{GenerationManager, ManagerConfig};
//! use cantus::pipeline::GenerationRequest;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = GenerationManager::start(ManagerConfig::default()).await.unwrap();
//!     let request = GenerationRequest {
//!         lyrics: "[verse]\nhello world".into(),
//!         tags: "synthwave, 80s".into(),
//!         ..Default::default()
//!     };
//!     let output = manager.generate(request).await.unwrap();
//!     println!("wrote {}", output.output_path.display());
//! }
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device};
use tokio::sync::{mpsc, oneshot};

use crate::audio::{peak_normalize, write_wav};
use crate::generation::{CancelHandle, GenerationStatus, ProgressSender, ProgressUpdate};
use crate::pipeline::{CantusPipeline, GeneratedAudio, GenerationRequest};
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Checkpoint directory passed to [`CantusPipeline::load`].
    pub checkpoint_dir: PathBuf,

    /// Directory WAV outputs are written into; created if missing.
    pub output_dir: PathBuf,

    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,

    /// Data type for model weights and activations.
    pub dtype: DType,

    /// Capacity of each job's bounded progress channel.
    pub progress_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            output_dir: PathBuf::from("outputs"),
            cuda_device: 0,
            dtype: DType::F32,
            progress_capacity: 32,
        }
    }
}

/// A finished job: the audio plus where it was written.
#[derive(Debug)]
pub struct JobOutput {
    pub audio: GeneratedAudio,
    pub output_path: PathBuf,
}

struct PendingJob {
    request: GenerationRequest,
    progress: ProgressSender,
    cancel: CancelHandle,
    reply: oneshot::Sender<Result<JobOutput>>,
}

/// Caller-side handle to one submitted job.
pub struct JobHandle {
    progress: mpsc::Receiver<ProgressUpdate>,
    cancel: CancelHandle,
    reply: oneshot::Receiver<Result<JobOutput>>,
}

impl JobHandle {
    /// Request cancellation. Takes effect at the next frame boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next progress observation, or `None` once the job's sender is gone.
    pub async fn next_progress(&mut self) -> Option<ProgressUpdate> {
        self.progress.recv().await
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<JobOutput> {
        self.reply
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

/// Handle for submitting generation jobs to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingJob>,
    progress_capacity: usize,
}

impl GenerationManager {
    /// Load the checkpoint and start the worker thread.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        // Loading does synchronous I/O and heavy compute, so it runs on the
        // blocking pool rather than an async worker.
        let load_config = config.clone();
        let pipeline = tokio::task::spawn_blocking(move || -> Result<CantusPipeline> {
            let device = preferred_device(load_config.cuda_device);
            tracing::info!(device = ?device, "loading pipeline");
            CantusPipeline::load(&load_config.checkpoint_dir, &device, load_config.dtype)
        })
        .await
        .map_err(|join_error| Error::Manager(format!("pipeline load task panicked: {join_error}")))??;

        Self::with_pipeline(pipeline, config)
    }

    /// Start the worker around an already-loaded pipeline.
    pub fn with_pipeline(pipeline: CantusPipeline, config: ManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let progress_capacity = config.progress_capacity;
        let (tx, rx) = mpsc::channel::<PendingJob>(64);
        tokio::task::spawn_blocking(move || run_worker(pipeline, config, rx));
        Ok(Self {
            tx,
            progress_capacity,
        })
    }

    /// Submit a job and return its handle.
    pub async fn submit(&self, request: GenerationRequest) -> Result<JobHandle> {
        let (progress, progress_rx) = ProgressSender::channel(self.progress_capacity);
        progress.push(ProgressUpdate::status_only(GenerationStatus::Queued));
        let cancel = CancelHandle::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingJob {
                request,
                progress,
                cancel: cancel.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;
        Ok(JobHandle {
            progress: progress_rx,
            cancel,
            reply: reply_rx,
        })
    }

    /// Submit a job and wait for the result, ignoring progress.
    pub async fn generate(&self, request: GenerationRequest) -> Result<JobOutput> {
        self.submit(request).await?.wait().await
    }
}

/// The worker loop — runs in a dedicated blocking thread, one job at a time.
fn run_worker(
    pipeline: CantusPipeline,
    config: ManagerConfig,
    mut rx: mpsc::Receiver<PendingJob>,
) {
    let mut job_id: u64 = 0;
    while let Some(job) = rx.blocking_recv() {
        let result = run_job(&pipeline, &config, job_id, &job);
        // Ignore send errors: the caller may have dropped the handle.
        let _ = job.reply.send(result);
        job_id += 1;
    }
    tracing::info!("generation manager shut down");
}

fn run_job(
    pipeline: &CantusPipeline,
    config: &ManagerConfig,
    job_id: u64,
    job: &PendingJob,
) -> Result<JobOutput> {
    job.progress
        .push(ProgressUpdate::status_only(GenerationStatus::Loading));
    match pipeline.generate(&job.request, &job.progress, &job.cancel) {
        Ok(mut audio) => {
            peak_normalize(&mut audio.samples);
            let output_path = config
                .output_dir
                .join(format!("cantus-{job_id:04}-{}.wav", audio.seed));
            if let Err(error) =
                write_wav(&output_path, &audio.samples, audio.sample_rate, audio.channels)
            {
                tracing::warn!(job_id, %error, "failed to write output");
                let mut update =
                    ProgressUpdate::terminal(GenerationStatus::Failed, audio.frames, audio.frames);
                update.error = Some(error.to_string());
                job.progress.push(update);
                return Err(error);
            }
            tracing::info!(job_id, path = %output_path.display(), "job completed");

            let mut update =
                ProgressUpdate::terminal(GenerationStatus::Completed, audio.frames, audio.frames);
            update.output_path = Some(output_path.clone());
            job.progress.push(update);
            Ok(JobOutput { audio, output_path })
        }
        // The pipeline pushed the terminal Cancelled/Failed observation,
        // with the frame counts the run reached.
        Err(error) if error.is_cancelled() => {
            tracing::info!(job_id, "job cancelled");
            Err(error)
        }
        Err(error) => {
            tracing::warn!(job_id, %error, "job failed");
            Err(error)
        }
    }
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}
