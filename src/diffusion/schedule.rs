//! Cosine noise schedule and the crash timestep warp.
//!
//! A timestep `t ∈ [0, 1]` is an angle on the quarter circle:
//!
//! ```text
//! alpha = cos(t·π/2)      // weight of the clean signal
//! sigma = sin(t·π/2)      // weight of the noise
//! ```
//!
//! so `alpha² + sigma² = 1` everywhere. The crash warp squares the sine before
//! mapping back to an angle, which makes sigma grow faster near `t = 0`:
//!
//! ```text
//! sigma' = sin(t·π/2)²
//! alpha' = sqrt(1 - sigma'²)
//! t'     = atan2(sigma', alpha') / (π/2)
//! ```
//!
//! Every function here comes in a scalar (`f64`) form and an elementwise
//! tensor form. The tensor forms keep the input dtype and device.

use std::f64::consts::FRAC_PI_2;

use candle_core::{DType, Tensor};

use crate::Result;

/// Scaling factors `(alpha, sigma)` for the clean signal and the noise at `t`.
pub fn alphas_sigmas(t: f64) -> (f64, f64) {
    let angle = t * FRAC_PI_2;
    (angle.cos(), angle.sin())
}

/// Timestep recovered from a pair of scaling factors.
///
/// Only the direction of `(alpha, sigma)` matters, not its norm. `(0, 0)` has
/// no direction and never comes out of [`alphas_sigmas`].
pub fn alpha_sigma_to_t(alpha: f64, sigma: f64) -> f64 {
    sigma.atan2(alpha) / FRAC_PI_2
}

/// Warp a linear timestep onto the crash schedule.
///
/// Fixes both endpoints and is non-decreasing on `[0, 1]`.
pub fn crash_schedule(t: f64) -> f64 {
    let sigma = (t * FRAC_PI_2).sin().powi(2);
    let alpha = (1.0 - sigma * sigma).max(0.0).sqrt();
    alpha_sigma_to_t(alpha, sigma)
}

/// Elementwise [`alphas_sigmas`] over a tensor of timesteps.
pub fn alphas_sigmas_tensor(t: &Tensor) -> Result<(Tensor, Tensor)> {
    let angle = (t * FRAC_PI_2)?;
    Ok((angle.cos()?, angle.sin()?))
}

/// Elementwise [`crash_schedule`] over a tensor of timesteps.
///
/// candle has no `atan2`, so the warp runs on the host in f64 and the result
/// is moved back to the input's device and dtype.
pub fn crash_schedule_tensor(t: &Tensor) -> Result<Tensor> {
    map_host(t, crash_schedule)
}

/// Elementwise [`alpha_sigma_to_t`] over two tensors of the same shape.
pub fn alpha_sigma_to_t_tensor(alpha: &Tensor, sigma: &Tensor) -> Result<Tensor> {
    if alpha.shape() != sigma.shape() {
        return Err(crate::Error::invalid(format!(
            "alpha shape {:?} does not match sigma shape {:?}",
            alpha.dims(),
            sigma.dims()
        )));
    }
    let alphas = alpha.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let sigmas = sigma.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let ts: Vec<f64> = alphas
        .iter()
        .zip(&sigmas)
        .map(|(&a, &s)| alpha_sigma_to_t(a, s))
        .collect();
    let out = Tensor::from_vec(ts, alpha.shape(), alpha.device())?;
    Ok(out.to_dtype(alpha.dtype())?)
}

fn map_host(t: &Tensor, f: impl Fn(f64) -> f64) -> Result<Tensor> {
    let values: Vec<f64> = t
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?
        .into_iter()
        .map(f)
        .collect();
    let out = Tensor::from_vec(values, t.shape(), t.device())?;
    Ok(out.to_dtype(t.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grid(n: usize) -> impl Iterator<Item = f64> {
        (0..=n).map(move |i| i as f64 / n as f64)
    }

    #[test]
    fn unit_circle() {
        for t in grid(100) {
            let (alpha, sigma) = alphas_sigmas(t);
            assert!(
                (alpha * alpha + sigma * sigma - 1.0).abs() < 1e-12,
                "alpha² + sigma² != 1 at t={t}"
            );
        }
    }

    #[test]
    fn alpha_decreases_sigma_increases() {
        let mut prev = alphas_sigmas(0.0);
        for t in grid(100).skip(1) {
            let cur = alphas_sigmas(t);
            assert!(cur.0 < prev.0, "alpha not decreasing at t={t}");
            assert!(cur.1 > prev.1, "sigma not increasing at t={t}");
            prev = cur;
        }
    }

    #[test]
    fn round_trip_through_angle() {
        for t in grid(100) {
            let (alpha, sigma) = alphas_sigmas(t);
            let back = alpha_sigma_to_t(alpha, sigma);
            assert!((back - t).abs() < 1e-12, "t={t} came back as {back}");
        }
        // atan2(0, 1) is exactly zero.
        assert_eq!(alpha_sigma_to_t(1.0, 0.0), 0.0);
    }

    #[test]
    fn direction_only_matters() {
        let t = alpha_sigma_to_t(3.0, 3.0);
        assert!((t - 0.5).abs() < 1e-12);
    }

    #[test]
    fn crash_preserves_endpoints() {
        assert!(crash_schedule(0.0).abs() < 1e-12);
        assert!((crash_schedule(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn crash_is_monotone() {
        let mut prev = crash_schedule(0.0);
        for t in grid(1000).skip(1) {
            let cur = crash_schedule(t);
            assert!(cur >= prev, "crash schedule decreased at t={t}: {prev} -> {cur}");
            prev = cur;
        }
    }

    #[test]
    fn crash_matches_closed_form_midpoint() {
        // t = 0.5: sigma' = sin(π/4)² = 0.5, alpha' = sqrt(0.75)
        let expected = 0.5_f64.atan2(0.75_f64.sqrt()) / FRAC_PI_2;
        assert!((crash_schedule(0.5) - expected).abs() < 1e-12);
        // atan(1/sqrt(3)) = π/6 → t' = 1/3
        assert!((crash_schedule(0.5) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn tensor_forms_match_scalars() {
        let device = Device::Cpu;
        let ts = [0.0_f64, 0.1, 0.25, 0.5, 0.8, 1.0];
        let t = Tensor::new(&ts, &device).unwrap();

        let (alpha, sigma) = alphas_sigmas_tensor(&t).unwrap();
        let alpha = alpha.to_vec1::<f64>().unwrap();
        let sigma = sigma.to_vec1::<f64>().unwrap();
        let warped = crash_schedule_tensor(&t).unwrap().to_vec1::<f64>().unwrap();

        for (i, &ti) in ts.iter().enumerate() {
            let (a, s) = alphas_sigmas(ti);
            assert!((alpha[i] - a).abs() < 1e-12);
            assert!((sigma[i] - s).abs() < 1e-12);
            assert!((warped[i] - crash_schedule(ti)).abs() < 1e-12);
        }
    }

    #[test]
    fn tensor_round_trip_keeps_dtype() {
        let device = Device::Cpu;
        let t = Tensor::new(&[0.2_f32, 0.6, 0.9], &device).unwrap();
        let (alpha, sigma) = alphas_sigmas_tensor(&t).unwrap();
        let back = alpha_sigma_to_t_tensor(&alpha, &sigma).unwrap();
        assert_eq!(back.dtype(), DType::F32);
        let back = back.to_vec1::<f32>().unwrap();
        for (b, e) in back.iter().zip([0.2_f32, 0.6, 0.9]) {
            assert!((b - e).abs() < 1e-5, "{b} vs {e}");
        }
    }
}
