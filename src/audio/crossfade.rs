//! Equal-power crossfading at chunk joins.
//!
//! Generated audio arrives one decoded chunk at a time; butting chunks
//! together directly can leave an audible click at every joint. The joiner
//! overlaps each new chunk with the tail of the accumulated buffer over a
//! short fade window and blends with an equal-power (sin/cos) curve, so the
//! summed power across the joint stays constant. The overlap consumes the
//! fade window: each joint shortens the total output by `fade` sample
//! frames.

/// Default fade window in sample frames (per channel).
pub const DEFAULT_CROSSFADE_SAMPLES: usize = 128;

/// Append an interleaved `chunk` to `out`, blending the first `fade` sample
/// frames of the chunk with the last `fade` sample frames of `out`.
///
/// Falls back to a plain append when either side is shorter than the fade
/// window (including the very first chunk) or when `fade` is zero.
pub fn append_with_crossfade(out: &mut Vec<f32>, chunk: &[f32], channels: u16, fade: usize) {
    let channels = channels.max(1) as usize;
    let fade_len = fade * channels;
    if fade_len == 0 || out.len() < fade_len || chunk.len() < fade_len {
        out.extend_from_slice(chunk);
        return;
    }

    let tail_start = out.len() - fade_len;
    for i in 0..fade_len {
        let frame = i / channels;
        // Midpoint sampling keeps the two weights strictly inside (0, 1).
        let t = (frame as f32 + 0.5) / fade as f32;
        let theta = t * std::f32::consts::FRAC_PI_2;
        out[tail_start + i] = out[tail_start + i] * theta.cos() + chunk[i] * theta.sin();
    }
    out.extend_from_slice(&chunk[fade_len..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_appends_verbatim() {
        let mut out = Vec::new();
        let chunk = vec![0.1, 0.2, 0.3, 0.4];
        append_with_crossfade(&mut out, &chunk, 2, 4);
        assert_eq!(out, chunk);
    }

    #[test]
    fn test_joint_consumes_fade_window() {
        let mut out = vec![0.5f32; 20]; // 10 stereo frames
        append_with_crossfade(&mut out, &vec![0.5f32; 20], 2, 4);
        // 10 + 10 frames minus a 4-frame overlap.
        assert_eq!(out.len(), (10 + 10 - 4) * 2);
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut out = vec![0.0f32; 16];
        append_with_crossfade(&mut out, &vec![0.0f32; 16], 2, 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_equal_power_weights() {
        // Fading white-ish content: for every overlap position the two
        // blend weights must satisfy sin^2 + cos^2 = 1.
        let fade = 8usize;
        for frame in 0..fade {
            let t = (frame as f32 + 0.5) / fade as f32;
            let theta = t * std::f32::consts::FRAC_PI_2;
            let power = theta.sin().powi(2) + theta.cos().powi(2);
            assert!((power - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blend_is_monotone_handoff() {
        // Old buffer holds 1.0, new chunk holds 0.0: the blended overlap
        // must decay monotonically from near 1 to near 0.
        let fade = 8usize;
        let mut out = vec![1.0f32; 16];
        append_with_crossfade(&mut out, &vec![0.0f32; 16], 1, fade);
        let overlap = &out[8..16];
        for w in overlap.windows(2) {
            assert!(w[0] > w[1], "expected decay, got {:?}", overlap);
        }
        assert!(overlap[0] < 1.0 && overlap[fade - 1] > 0.0);
    }

    #[test]
    fn test_short_chunk_falls_back_to_append() {
        let mut out = vec![0.7f32; 16];
        append_with_crossfade(&mut out, &[0.2, 0.2], 2, 4);
        assert_eq!(out.len(), 18);
        assert_eq!(&out[16..], &[0.2, 0.2]);
    }
}
