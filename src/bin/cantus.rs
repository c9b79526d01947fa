//! Cantus CLI — lyrics-to-music generation.
//!
//! Generates audio from lyrics and comma-separated style tags using a local
//! checkpoint directory.
//!
//! # Output
//!
//! Writes a WAV file to the path given by --output and prints a one-line
//! JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/music.wav","duration_s":30.0,"sample_rate":48000,"channels":2,"frames":375,"seed":42}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use cantus::audio::{peak_normalize, write_wav};
use cantus::generation::{CancelHandle, ProgressSender, SamplingParams};
use cantus::manager::preferred_device;
use cantus::pipeline::{CantusPipeline, GenerationRequest};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "cantus",
    about = "Lyrics-to-music generation",
    long_about = "Generate music from lyrics and style tags.\n\
                  Weights are loaded from a local checkpoint directory.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Lyrics text. Use [verse], [chorus], [bridge] markers.
    #[arg(
        long,
        short = 'l',
        conflicts_with = "lyrics_file",
        required_unless_present = "lyrics_file"
    )]
    lyrics: Option<String>,

    /// Read lyrics from a file instead of the command line.
    #[arg(long)]
    lyrics_file: Option<PathBuf>,

    /// Comma-separated style tags: "synthwave, 80s, female vocals".
    #[arg(long, short = 't')]
    tags: String,

    /// Sampling temperature (> 0).
    #[arg(long, default_value_t = cantus::generation::DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Top-k sampling cutoff (>= 1).
    #[arg(long, default_value_t = cantus::generation::DEFAULT_TOP_K)]
    top_k: usize,

    /// Classifier-free guidance scale. 1.0 disables guidance.
    #[arg(long, default_value_t = cantus::generation::DEFAULT_CFG_SCALE)]
    cfg_scale: f32,

    /// Maximum audio duration in seconds. The model may stop earlier.
    #[arg(long, short = 'd', default_value_t = 240.0)]
    max_duration: f64,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Checkpoint directory (config.json, tokenizer.json, lm/, flow/, codec/).
    #[arg(long, default_value = "checkpoints")]
    checkpoint: PathBuf,

    /// Output WAV path.
    #[arg(long, short = 'o')]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.max_duration < 1.0 || args.max_duration > 600.0 {
        anyhow::bail!(
            "max duration must be between 1 and 600 seconds, got {}",
            args.max_duration
        );
    }
    let ext = args.output.extension().and_then(|e| e.to_str());
    if ext != Some("wav") {
        anyhow::bail!("output must be a .wav path");
    }
    if let Some(parent) = args.output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let lyrics = match &args.lyrics_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => args.lyrics.clone().unwrap_or_default(),
    };

    let device = preferred_device(0);
    tracing::info!(?device, "loading pipeline");
    let pipeline = CantusPipeline::load(&args.checkpoint, &device, candle_core::DType::F32)
        .map_err(|e| anyhow::anyhow!("failed to load pipeline: {e}"))?;

    let request = GenerationRequest {
        lyrics,
        tags: args.tags,
        params: SamplingParams {
            temperature: args.temperature,
            top_k: args.top_k,
            cfg_scale: args.cfg_scale,
            max_audio_length_ms: (args.max_duration * 1000.0) as u64,
            seed: args.seed,
        },
    };

    // Progress printer on its own thread; the frame loop never blocks on it.
    let (progress, mut rx) = ProgressSender::channel(64);
    let printer = std::thread::spawn(move || {
        while let Some(update) = rx.blocking_recv() {
            tracing::info!(
                frame = update.current_frame,
                total = update.total_frames,
                "progress {:.0}%",
                update.progress * 100.0
            );
        }
    });

    let result = pipeline.generate(&request, &progress, &CancelHandle::new());
    drop(progress);
    let _ = printer.join();
    let mut audio = result.map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    peak_normalize(&mut audio.samples);
    write_wav(&args.output, &audio.samples, audio.sample_rate, audio.channels)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;

    let duration_s =
        audio.samples.len() as f64 / (audio.sample_rate as f64 * audio.channels as f64);
    println!(
        r#"{{"path":"{path}","duration_s":{duration_s:.1},"sample_rate":{sr},"channels":{ch},"frames":{frames},"seed":{seed}}}"#,
        path = args.output.display(),
        sr = audio.sample_rate,
        ch = audio.channels,
        frames = audio.frames,
        seed = audio.seed,
    );

    Ok(())
}
