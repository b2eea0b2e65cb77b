//! Unconditional v-diffusion over 1-D signals in pure Rust.
//!
//! A candle-based trainer and sampler for fixed-length waveform segments,
//! using the crash noise schedule and velocity parameterization.
//!
//! ## Architecture
//!
//! ```text
//! .npy segments ─→ SampleDataset ─→ [B, C, L] batches
//!                                        ↓
//!            Sobol t ─→ crash warp ─→ noised + velocity target
//!                                        ↓
//!                       DiffusionNet1d (1-D U-Net) ─ MSE ─ AdamW
//!                                        ↓
//!                                  EMA shadow weights
//!                                        ↓
//!          noise ─→ sampler (DDIM, eta) ─→ demo samples / checkpoints
//! ```
//!
//! ## Modules
//!
//! - [`diffusion`] — noise schedule, crash warp, sampling loop
//! - [`model`] — timestep embedding and the U-Net denoiser
//! - [`training`] — targets, trainer, EMA, demo callback
//! - [`sobol`] — scrambled low-discrepancy timestep source
//! - [`dataset`] — fixed-length segments from `.npy`
//! - [`checkpoint`] — safetensors checkpoints
//! - [`config`] — JSON configuration

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod diffusion;
pub mod model;
pub mod sobol;
pub mod training;

mod error;

pub use error::{Error, Result};
