//! v-diffusion on the quarter circle.
//!
//! - [`schedule`] — timestep ↔ `(alpha, sigma)` and the crash warp
//! - [`sampler`] — DDIM / ancestral sampling loop over a [`Denoiser`]
//! - [`noise`] — seeded Gaussian noise
//!
//! ## Velocity formulation
//!
//! The forward process mixes signal and noise on the unit circle:
//! `x_t = alpha·x_0 + sigma·ε`. The model predicts the velocity
//! `v = alpha·ε - sigma·x_0`, from which both estimates are linear:
//! `x_0 = alpha·x_t - sigma·v` and `ε = sigma·x_t + alpha·v`.

pub mod noise;
pub mod sampler;
pub mod schedule;

pub use sampler::{Denoiser, sample};
pub use schedule::{alpha_sigma_to_t, alphas_sigmas, crash_schedule};
