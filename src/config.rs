//! Training and sampling configuration.
//!
//! Loaded from a JSON file; every field has a default, so a file only needs
//! the values it changes:
//!
//! ```json
//! {"training_dir": "data/drums.npy", "sample_size": 32768, "batch_size": 4}
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::UNetConfig;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    // --- Reproducibility ---
    pub seed: u64,

    // --- Data shape ---
    pub batch_size: usize,
    pub channels: usize,
    /// Samples per segment (signal length).
    pub sample_size: usize,
    /// `.npy` array of shape (N, sample_size).
    pub training_dir: PathBuf,

    // --- Model ---
    pub base_channels: usize,
    pub levels: usize,

    // --- Optimization ---
    pub learning_rate: f64,
    pub accum_batches: usize,
    pub max_epochs: usize,

    // --- EMA ---
    pub ema_decay: f64,
    pub ema_warmup_decay: f64,
    pub ema_warmup_epochs: usize,

    // --- Demos ---
    pub demo_every: usize,
    pub num_demos: usize,
    pub demo_steps: usize,
    pub eta: f64,

    // --- Checkpoints ---
    pub checkpoint_every: usize,
    pub save_path: PathBuf,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            batch_size: 8,
            channels: 2,
            sample_size: 65536,
            training_dir: PathBuf::from("data/train.npy"),
            base_channels: 32,
            levels: 3,
            learning_rate: 4e-5,
            accum_batches: 1,
            max_epochs: 100,
            ema_decay: 0.995,
            ema_warmup_decay: 0.95,
            ema_warmup_epochs: 25,
            demo_every: 1000,
            num_demos: 4,
            demo_steps: 100,
            eta: 0.0,
            checkpoint_every: 10000,
            save_path: PathBuf::from("checkpoints"),
        }
    }
}

impl DiffusionConfig {
    /// Read and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("channels", self.channels),
            ("sample_size", self.sample_size),
            ("base_channels", self.base_channels),
            ("accum_batches", self.accum_batches),
            ("demo_steps", self.demo_steps),
            ("num_demos", self.num_demos),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        let multiple = self.unet_config().length_multiple();
        if self.sample_size % multiple != 0 {
            return Err(Error::Config(format!(
                "sample_size {} must be a multiple of {multiple} for {} U-Net levels",
                self.sample_size, self.levels
            )));
        }
        for (name, decay) in [
            ("ema_decay", self.ema_decay),
            ("ema_warmup_decay", self.ema_warmup_decay),
        ] {
            if !(0.0..=1.0).contains(&decay) {
                return Err(Error::Config(format!("{name} must lie in [0, 1], got {decay}")));
            }
        }
        if !self.eta.is_finite() || self.eta < 0.0 {
            return Err(Error::Config(format!("eta must be non-negative, got {}", self.eta)));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(Error::Config("learning_rate must be positive".into()));
        }
        Ok(())
    }

    /// Network shape derived from the data shape.
    pub fn unet_config(&self) -> UNetConfig {
        UNetConfig {
            io_channels: self.channels,
            base_channels: self.base_channels,
            levels: self.levels,
            ..Default::default()
        }
    }
}
