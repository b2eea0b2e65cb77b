//! Training loop around the velocity objective.
//!
//! - [`trainer`] — optimizer steps, gradient accumulation, checkpoint cadence
//! - [`ema`] — exponential moving average shadow weights
//! - [`demo`] — periodic sampling from the EMA model
//!
//! ## Objective
//!
//! For clean signals `x_0`, one crash-warped timestep per example and fresh
//! noise `ε`:
//!
//! ```text
//! noised = x_0·alpha + ε·sigma
//! target = ε·alpha - x_0·sigma
//! loss   = mse(model(noised, t), target)
//! ```

pub mod demo;
pub mod ema;
pub mod trainer;

pub use trainer::{DiffusionTrainer, StepOutput};

use candle_core::Tensor;

use crate::diffusion::schedule::{alphas_sigmas, crash_schedule};
use crate::{Error, Result};

/// Inputs and regression target for one batch.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// Warped timesteps fed to the model, `[B]`.
    pub t: Tensor,
    /// `reals·alpha + noise·sigma`, `[B, C, L]`.
    pub noised: Tensor,
    /// `noise·alpha - reals·sigma`, `[B, C, L]`.
    pub target: Tensor,
}

/// Warp uniform draws `u ∈ [0, 1)` onto the crash schedule.
pub fn warp_timesteps(uniform: &[f64]) -> Vec<f64> {
    uniform.iter().map(|&u| crash_schedule(u)).collect()
}

/// Build noised inputs and velocity targets for already-warped timesteps.
pub fn training_targets(reals: &Tensor, t: &[f64], noise: &Tensor) -> Result<TrainingBatch> {
    let batch = reals.dim(0)?;
    if t.len() != batch {
        return Err(Error::invalid(format!(
            "{} timesteps for a batch of {batch}",
            t.len()
        )));
    }
    if noise.shape() != reals.shape() {
        return Err(Error::invalid(format!(
            "noise shape {:?} does not match signal shape {:?}",
            noise.dims(),
            reals.dims()
        )));
    }

    let (alphas, sigmas): (Vec<f32>, Vec<f32>) = t
        .iter()
        .map(|&ti| {
            let (a, s) = alphas_sigmas(ti);
            (a as f32, s as f32)
        })
        .unzip();

    let device = reals.device();
    let dtype = reals.dtype();
    let alphas = Tensor::from_vec(alphas, (batch, 1, 1), device)?.to_dtype(dtype)?;
    let sigmas = Tensor::from_vec(sigmas, (batch, 1, 1), device)?.to_dtype(dtype)?;

    let noised = (reals.broadcast_mul(&alphas)? + noise.broadcast_mul(&sigmas)?)?;
    let target = (noise.broadcast_mul(&alphas)? - reals.broadcast_mul(&sigmas)?)?;

    let t: Vec<f32> = t.iter().map(|&ti| ti as f32).collect();
    let t = Tensor::from_vec(t, batch, device)?.to_dtype(dtype)?;

    Ok(TrainingBatch { t, noised, target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn true_velocity_recovers_clean_signal() {
        let device = Device::Cpu;
        let reals = Tensor::randn(0f32, 1.0, (3, 2, 16), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (3, 2, 16), &device).unwrap();
        let t = warp_timesteps(&[0.1, 0.5, 0.9]);
        let batch = training_targets(&reals, &t, &noise).unwrap();

        // The sampler's estimates applied to the exact target give back the data.
        for (i, &ti) in t.iter().enumerate() {
            let (alpha, sigma) = alphas_sigmas(ti);
            let x = batch.noised.get(i).unwrap();
            let v = batch.target.get(i).unwrap();
            let pred = ((&x * alpha).unwrap() - (&v * sigma).unwrap()).unwrap();
            let eps = ((&x * sigma).unwrap() + (&v * alpha).unwrap()).unwrap();
            for (p, r) in values(&pred).iter().zip(values(&reals.get(i).unwrap())) {
                assert!((p - r).abs() < 1e-5);
            }
            for (e, n) in values(&eps).iter().zip(values(&noise.get(i).unwrap())) {
                assert!((e - n).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn clean_timestep_keeps_signal() {
        let device = Device::Cpu;
        let reals = Tensor::ones((1, 1, 4), DType::F32, &device).unwrap();
        let noise = Tensor::full(5f32, (1, 1, 4), &device).unwrap();
        let batch = training_targets(&reals, &[0.0], &noise).unwrap();
        assert_eq!(values(&batch.noised), vec![1.0; 4]);
        assert_eq!(values(&batch.target), vec![5.0; 4]);
        assert_eq!(batch.t.dims(), &[1]);
    }

    #[test]
    fn timestep_count_must_match_batch() {
        let device = Device::Cpu;
        let reals = Tensor::zeros((2, 1, 4), DType::F32, &device).unwrap();
        let noise = reals.clone();
        assert!(training_targets(&reals, &[0.5], &noise).is_err());
    }

    #[test]
    fn warp_is_crash_schedule() {
        let warped = warp_timesteps(&[0.0, 0.5]);
        assert!(warped[0].abs() < 1e-12);
        assert!((warped[1] - 1.0 / 3.0).abs() < 1e-12);
    }
}
