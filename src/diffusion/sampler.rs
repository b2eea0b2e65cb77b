//! Reverse diffusion loop (DDIM with optional ancestral noise).
//!
//! Walks the crash schedule from `t = 1` toward `t = 0` in `steps` equal
//! increments. At step `i` the model velocity `v` is split into
//!
//! ```text
//! pred = x·alpha_i - v·sigma_i     // clean-signal estimate
//! eps  = x·sigma_i + v·alpha_i     // noise estimate
//! ```
//!
//! and the next state is rebuilt on the schedule line for step `i + 1`:
//!
//! ```text
//! ddim_sigma     = eta · sqrt(sigma_{i+1}² / sigma_i²) · sqrt(1 - alpha_i² / alpha_{i+1}²)
//! adjusted_sigma = sqrt(sigma_{i+1}² - ddim_sigma²)
//! x              = pred·alpha_{i+1} + eps·adjusted_sigma + ddim_sigma·ε
//! ```
//!
//! `eta = 0` is deterministic DDIM. The last step returns `pred`, not `x`.

use candle_core::Tensor;
use rand::Rng;

use super::noise::randn_like;
use super::schedule::{alphas_sigmas, crash_schedule};
use crate::{Error, Result};

/// A velocity predictor: `(x [B, C, L], t [B]) → v [B, C, L]`.
///
/// Implemented for [`crate::model::DiffusionNet1d`] and for any closure with
/// the same signature.
pub trait Denoiser {
    fn denoise(&self, x: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn denoise(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        self(x, t)
    }
}

/// One entry of the sampling schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleStep {
    /// Warped timestep fed to the model.
    pub t: f64,
    pub alpha: f64,
    pub sigma: f64,
}

/// The `steps` warped timesteps used by [`sample`], from `t = 1` down to `1/steps`.
pub fn sampling_schedule(steps: usize) -> Result<Vec<ScheduleStep>> {
    if steps < 1 {
        return Err(Error::invalid("steps must be at least 1"));
    }
    Ok((0..steps)
        .map(|i| {
            let t = crash_schedule(1.0 - i as f64 / steps as f64);
            let (alpha, sigma) = alphas_sigmas(t);
            ScheduleStep { t, alpha, sigma }
        })
        .collect())
}

/// Noise split for moving from `cur` to `next`: `(ddim_sigma, adjusted_sigma)`.
///
/// `adjusted_sigma` is clamped at zero for `eta > 1`, where the stochastic
/// share would otherwise exceed the whole noise budget.
pub fn ddim_sigmas(cur: &ScheduleStep, next: &ScheduleStep, eta: f64) -> (f64, f64) {
    let ddim_sigma = eta
        * (next.sigma.powi(2) / cur.sigma.powi(2)).sqrt()
        * (1.0 - cur.alpha.powi(2) / next.alpha.powi(2)).max(0.0).sqrt();
    let adjusted_sigma = (next.sigma.powi(2) - ddim_sigma.powi(2)).max(0.0).sqrt();
    (ddim_sigma, adjusted_sigma)
}

/// Draw samples from `denoiser` starting at `x` (normally standard noise).
///
/// Calls the denoiser exactly `steps` times. Fresh noise for `eta > 0` comes
/// from `rng`; with `eta = 0` the generator is never touched. Denoiser errors
/// are returned unchanged.
pub fn sample<D, R>(denoiser: &D, x: &Tensor, steps: usize, eta: f64, rng: &mut R) -> Result<Tensor>
where
    D: Denoiser + ?Sized,
    R: Rng + ?Sized,
{
    if !eta.is_finite() || eta < 0.0 {
        return Err(Error::invalid(format!(
            "eta must be a non-negative finite number, got {eta}"
        )));
    }
    let schedule = sampling_schedule(steps)?;
    let batch = x.dim(0)?;
    let device = x.device();

    let mut x = x.clone();
    let mut pred = None;
    for (i, cur) in schedule.iter().enumerate() {
        let ts = Tensor::full(cur.t, (batch,), device)?.to_dtype(x.dtype())?;
        let v = denoiser.denoise(&x, &ts)?;
        if v.shape() != x.shape() {
            return Err(Error::invalid(format!(
                "denoiser returned shape {:?} for input {:?}",
                v.dims(),
                x.dims()
            )));
        }
        let v = v.to_dtype(x.dtype())?;

        let denoised = ((&x * cur.alpha)? - (&v * cur.sigma)?)?;

        if let Some(next) = schedule.get(i + 1) {
            let eps = ((&x * cur.sigma)? + (&v * cur.alpha)?)?;
            let (ddim_sigma, adjusted_sigma) = ddim_sigmas(cur, next, eta);

            let mut x_next = ((&denoised * next.alpha)? + (eps * adjusted_sigma)?)?;
            if eta != 0.0 {
                let fresh = randn_like(&x_next, rng)?;
                x_next = (x_next + (fresh * ddim_sigma)?)?;
            }
            x = x_next;
        }

        tracing::debug!(step = i, t = cur.t, "sampling step");
        pred = Some(denoised);
    }

    // `sampling_schedule` guarantees at least one step.
    pred.ok_or_else(|| Error::invalid("steps must be at least 1"))
}
