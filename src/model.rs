//! Velocity-predicting network.
//!
//! - [`timestep`] — sinusoidal timestep embedding
//! - [`unet`] — 1-D convolutional U-Net implementing [`crate::diffusion::Denoiser`]

pub mod timestep;
pub mod unet;

pub use unet::{DiffusionNet1d, UNetConfig};
