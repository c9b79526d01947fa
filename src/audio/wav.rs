//! WAV read/write for interleaved f32 sample buffers.

use std::path::Path;

use crate::{Error, Result};

/// Read a WAV file, returning `(samples, sample_rate, num_channels)` with
/// interleaved f32 samples in [-1, 1]. Integer formats are rescaled.
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32, u16)> {
    let reader = hound::WavReader::open(&path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(Error::Audio(format!(
                    "unsupported bit depth {}",
                    spec.bits_per_sample
                )));
            }
            let max_val = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok((samples, spec.sample_rate, spec.channels))
}

/// Write interleaved f32 samples as a 32-bit float WAV file.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    if num_channels == 0 {
        return Err(Error::Audio("channel count must be nonzero".into()));
    }
    if samples.len() % num_channels as usize != 0 {
        return Err(Error::Audio(format!(
            "sample count {} is not a multiple of {} channels",
            samples.len(),
            num_channels
        )));
    }
    let spec = hound::WavSpec {
        channels: num_channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Peak-normalize samples to [-1, 1] in place. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = 1.0 / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}
