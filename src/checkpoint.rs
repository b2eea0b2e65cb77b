//! Parameter checkpoints.
//!
//! Every checkpoint writes two safetensors files and a small progress record
//! into the save directory:
//!
//! ```text
//! step_00010000.safetensors       live weights
//! step_00010000_ema.safetensors   EMA weights (used for sampling)
//! step_00010000_state.json        optimizer step and epoch to resume at
//! config.json                     training config, written once
//! ```
//!
//! Checkpoints are never pruned.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use serde::{Deserialize, Serialize};

use crate::config::DiffusionConfig;
use crate::model::{DiffusionNet1d, UNetConfig};
use crate::Result;

/// File name of the config snapshot inside a save directory.
pub const CONFIG_FILE: &str = "config.json";

/// Paths written for one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub live: PathBuf,
    pub ema: PathBuf,
    pub state: PathBuf,
}

/// Training progress stored next to a checkpoint's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps taken when the weights were written.
    pub step: usize,
    /// Epoch a resumed run starts in.
    pub epoch: usize,
}

impl CheckpointPaths {
    pub fn for_step(dir: impl AsRef<Path>, step: usize) -> Self {
        let dir = dir.as_ref();
        Self {
            live: dir.join(format!("step_{step:08}.safetensors")),
            ema: dir.join(format!("step_{step:08}_ema.safetensors")),
            state: dir.join(format!("step_{step:08}_state.json")),
        }
    }
}

/// Write the live and EMA parameters and the progress record for `state.step`.
pub fn save(
    dir: impl AsRef<Path>,
    state: &TrainingState,
    live: &VarMap,
    ema: &VarMap,
) -> Result<CheckpointPaths> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let paths = CheckpointPaths::for_step(dir, state.step);
    live.save(&paths.live)?;
    ema.save(&paths.ema)?;
    save_state(dir, state)?;
    tracing::info!(step = state.step, epoch = state.epoch, path = %paths.ema.display(), "saved checkpoint");
    Ok(paths)
}

/// Rewrite only the progress record of the checkpoint at `state.step`.
pub fn save_state(dir: impl AsRef<Path>, state: &TrainingState) -> Result<PathBuf> {
    let path = CheckpointPaths::for_step(dir, state.step).state;
    std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
    Ok(path)
}

/// Read a progress record written by [`save`].
pub fn load_state(path: impl AsRef<Path>) -> Result<TrainingState> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Snapshot the config next to the checkpoints so sampling can rebuild the model.
pub fn save_config(dir: impl AsRef<Path>, config: &DiffusionConfig) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let path = dir.join(CONFIG_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}

/// Build a network and fill it from a safetensors file.
pub fn load_model(
    path: impl AsRef<Path>,
    config: &UNetConfig,
    device: &Device,
) -> Result<(VarMap, DiffusionNet1d)> {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = DiffusionNet1d::new(config, vb)?;
    varmap.load(path.as_ref())?;
    tracing::info!(path = %path.as_ref().display(), "loaded model weights");
    Ok((varmap, model))
}
