//! Periodic demo sampling during training.
//!
//! Every `demo_every` optimizer steps (at steps 1, 1 + demo_every, ...) the
//! EMA model generates `num_demos` signals from fresh noise. The samples are
//! written as a raw `[num_demos, channels, sample_size]` `.npy` dump for
//! external listening or logging. A failed demo is logged and skipped; it
//! never interrupts training.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::Result;
use crate::config::DiffusionConfig;
use crate::diffusion::noise::randn;
use crate::diffusion::{Denoiser, sample};

/// Samples produced by one demo run.
#[derive(Debug, Clone)]
pub struct DemoOutput {
    pub step: usize,
    pub samples: Tensor,
    pub path: PathBuf,
}

/// Demo state carried across training steps.
#[derive(Debug, Clone)]
pub struct DemoCallback {
    demo_every: usize,
    num_demos: usize,
    channels: usize,
    sample_size: usize,
    demo_steps: usize,
    eta: f64,
    out_dir: PathBuf,
    last_demo_step: Option<usize>,
}

impl DemoCallback {
    pub fn from_config(config: &DiffusionConfig) -> Self {
        Self {
            demo_every: config.demo_every,
            num_demos: config.num_demos,
            channels: config.channels,
            sample_size: config.sample_size,
            demo_steps: config.demo_steps,
            eta: config.eta,
            out_dir: config.save_path.clone(),
            last_demo_step: None,
        }
    }

    /// Whether a demo is due after optimizer step `step` (1-based).
    pub fn is_due(&self, step: usize) -> bool {
        if self.demo_every == 0 || step == 0 {
            return false;
        }
        (step - 1) % self.demo_every == 0 && self.last_demo_step != Some(step)
    }

    /// Run a demo if one is due. Errors are logged, not returned.
    pub fn on_step<D, R>(
        &mut self,
        denoiser: &D,
        step: usize,
        device: &Device,
        rng: &mut R,
    ) -> Option<DemoOutput>
    where
        D: Denoiser + ?Sized,
        R: Rng + ?Sized,
    {
        if !self.is_due(step) {
            return None;
        }
        self.last_demo_step = Some(step);

        match self.generate(denoiser, step, device, rng) {
            Ok(output) => {
                tracing::info!(
                    step,
                    shape = ?output.samples.dims(),
                    path = %output.path.display(),
                    "wrote demo samples"
                );
                Some(output)
            }
            Err(error) => {
                tracing::warn!(step, %error, "demo sampling failed");
                None
            }
        }
    }

    fn generate<D, R>(&self, denoiser: &D, step: usize, device: &Device, rng: &mut R) -> Result<DemoOutput>
    where
        D: Denoiser + ?Sized,
        R: Rng + ?Sized,
    {
        let noise = randn(
            (self.num_demos, self.channels, self.sample_size),
            DType::F32,
            device,
            rng,
        )?;
        let samples = sample(denoiser, &noise, self.demo_steps, self.eta, rng)?;

        std::fs::create_dir_all(&self.out_dir)?;
        let path = self.out_dir.join(format!("demo_{step:08}.npy"));
        samples.write_npy(&path)?;

        Ok(DemoOutput {
            step,
            samples,
            path,
        })
    }
}
