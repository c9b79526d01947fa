//! Classifier-free guidance and top-k/temperature sampling.
//!
//! Operates on plain `f32` logit slices pulled to the CPU — one call per
//! codebook, driven in hierarchy order by the language model. All math runs
//! in a guaranteed-finite domain: softmax is max-subtracted, so the scaled
//! exponentials can underflow to zero but never overflow.
//!
//! `temperature -> 0` is not special-cased: after max-subtraction the
//! highest-logit candidate sits at exactly 0 while every other candidate's
//! scaled logit diverges to -∞, so the distribution collapses to arg-max
//! through the ordinary code path.

use rand::rngs::StdRng;
use rand::Rng;

use crate::generation::SamplingParams;
use crate::{Error, Result};

/// Blend conditional and unconditional logits.
///
/// `guided = uncond + cfg_scale * (cond - uncond)`
///
/// With `uncond == None` (guidance disabled) the conditional logits pass
/// through untouched — the exact `cfg_scale == 1` identity.
pub fn guided_logits(cond: &[f32], uncond: Option<&[f32]>, cfg_scale: f32) -> Vec<f32> {
    match uncond {
        None => cond.to_vec(),
        Some(uncond) => {
            debug_assert_eq!(cond.len(), uncond.len());
            cond.iter()
                .zip(uncond.iter())
                .map(|(&c, &u)| u + cfg_scale * (c - u))
                .collect()
        }
    }
}

/// Sample one token id from guided logits.
///
/// 1. Reject non-finite logits (`Numerical` — a model bug, never retried).
/// 2. Keep the `top_k` highest logits, ties broken by lowest token id.
/// 3. Scale by `1/temperature`, max-subtracted softmax.
/// 4. One multinomial draw from `rng`, walking candidates in their
///    deterministic (logit-desc, id-asc) order.
pub fn sample_token(logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Result<u32> {
    if logits.is_empty() {
        return Err(Error::InvalidInput("empty logit vector".into()));
    }
    if let Some(idx) = logits.iter().position(|v| !v.is_finite()) {
        return Err(Error::Numerical(format!(
            "non-finite logit {} at token id {idx}",
            logits[idx]
        )));
    }

    let candidates = top_k_candidates(logits, params.top_k);

    // Max-subtract before the temperature divide so the largest scaled
    // logit is exactly 0 (exp = 1) and everything else is <= 0.
    let max_logit = candidates[0].1;
    let weights: Vec<f64> = candidates
        .iter()
        .map(|&(_, logit)| (((logit - max_logit) / params.temperature) as f64).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    // total >= 1 always (the max candidate contributes exp(0) = 1).
    let draw: f64 = rng.random::<f64>() * total;
    let mut cumulative = 0.0f64;
    for (&(id, _), &w) in candidates.iter().zip(weights.iter()) {
        cumulative += w;
        if draw < cumulative {
            return Ok(id);
        }
    }
    // Floating-point rounding fallback: last candidate.
    Ok(candidates[candidates.len() - 1].0)
}

/// Top-`k` `(token_id, logit)` pairs sorted by logit descending, token id
/// ascending among equal logits.
fn top_k_candidates(logits: &[f32], top_k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, v))
        .collect();
    indexed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    indexed.truncate(top_k.min(logits.len()));
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params(temperature: f32, top_k: usize) -> SamplingParams {
        SamplingParams {
            temperature,
            top_k,
            ..Default::default()
        }
    }

    #[test]
    fn test_guidance_identity_at_scale_one() {
        let cond = vec![0.4, -1.2, 3.3, 0.0];
        let uncond = vec![9.0, -9.0, 1.0, 2.0];
        let guided = guided_logits(&cond, Some(&uncond), 1.0);
        for (g, c) in guided.iter().zip(cond.iter()) {
            assert!((g - c).abs() < 1e-6);
        }
        // And with the unconditional pass skipped entirely:
        assert_eq!(guided_logits(&cond, None, 1.0), cond);
    }

    #[test]
    fn test_guidance_extrapolates_past_conditional() {
        let cond = vec![2.0, 0.0];
        let uncond = vec![1.0, 0.0];
        let guided = guided_logits(&cond, Some(&uncond), 3.0);
        // 1 + 3 * (2 - 1) = 4
        assert!((guided[0] - 4.0).abs() < 1e-6);
        assert!((guided[1] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_scale_returns_unconditional() {
        let cond = vec![5.0, -5.0];
        let uncond = vec![-1.0, 1.0];
        let guided = guided_logits(&cond, Some(&uncond), 0.0);
        assert!((guided[0] - -1.0).abs() < 1e-6);
        assert!((guided[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_low_temperature_degenerates_to_argmax() {
        // Unique maximum at id 2; temperature near zero must always pick it.
        let logits = vec![1.0, 2.5, 7.0, 2.4, -3.0];
        let p = params(1e-6, 3);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(sample_token(&logits, &p, &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn test_top_k_excludes_low_logits() {
        // With top_k = 2 only ids 0 and 3 are candidates.
        let logits = vec![10.0, -50.0, -50.0, 9.9];
        let p = params(1.0, 2);
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let id = sample_token(&logits, &p, &mut rng).unwrap();
            assert!(id == 0 || id == 3, "sampled excluded token {id}");
        }
    }

    #[test]
    fn test_tie_break_prefers_lowest_id() {
        // All logits equal; top_k = 1 must deterministically keep id 0.
        let logits = vec![0.5; 8];
        let p = params(1.0, 1);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(sample_token(&logits, &p, &mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let logits: Vec<f32> = (0..32).map(|i| ((i * 7) % 13) as f32 * 0.3).collect();
        let p = params(0.8, 16);
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..100)
                .map(|_| sample_token(&logits, &p, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_non_finite_logits_are_fatal() {
        let logits = vec![0.0, f32::NAN, 1.0];
        let p = params(1.0, 2);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sample_token(&logits, &p, &mut rng),
            Err(Error::Numerical(_))
        ));
        let logits = vec![0.0, f32::INFINITY];
        assert!(matches!(
            sample_token(&logits, &p, &mut rng),
            Err(Error::Numerical(_))
        ));
    }

    #[test]
    fn test_top_k_larger_than_vocab_is_clamped() {
        let logits = vec![0.1, 0.2];
        let p = params(1.0, 50);
        let mut rng = StdRng::seed_from_u64(7);
        let id = sample_token(&logits, &p, &mut rng).unwrap();
        assert!(id < 2);
    }
}
