//! 1-D convolutional U-Net velocity predictor.
//!
//! ```text
//! x [B, C, L] ─ Conv1d(k=5) ─ ResBlock ─┬─ pool/2, Conv1d(k=1) ─ ResBlock ─┬─ ... ─ mid
//!                                       │                                  │
//!   out Conv1d(k=1) ← ResBlock ← cat ───┘ ← ×2, Conv1d(k=3) ← ResBlock ← cat ┘ ← ...
//! ```
//!
//! Resampling is done with reshapes (pairwise mean down, sample repetition
//! up) so every op on the training path has a candle backward pass.
//!
//! Every residual block receives the timestep embedding as a per-channel
//! bias after its first convolution. `L` must be divisible by `2^levels`.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, GroupNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use super::timestep::TimestepEmbedding;
use crate::diffusion::Denoiser;
use crate::{Error, Result};

/// Shape of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Signal channels in and out.
    pub io_channels: usize,
    /// Channels at full resolution; doubled at every level.
    pub base_channels: usize,
    /// Number of down/up-sampling levels.
    pub levels: usize,
    /// Sinusoidal feature width fed to the timestep MLP.
    pub time_features: usize,
    /// Width of the timestep embedding.
    pub time_embed_dim: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            io_channels: 2,
            base_channels: 32,
            levels: 3,
            time_features: 32,
            time_embed_dim: 128,
        }
    }
}

impl UNetConfig {
    fn channels_at(&self, level: usize) -> usize {
        self.base_channels << level
    }

    /// Signal lengths must be a multiple of this.
    pub fn length_multiple(&self) -> usize {
        1 << self.levels
    }
}

/// Largest group count in {8, 4, 2, 1} dividing `channels`.
fn norm_groups(channels: usize) -> usize {
    [8, 4, 2, 1]
        .into_iter()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

/// Average adjacent samples: [B, C, L] → [B, C, L/2].
fn downsample(xs: &Tensor) -> Result<Tensor> {
    let (b, c, l) = xs.dims3()?;
    Ok(xs.reshape((b, c, l / 2, 2))?.mean(3)?)
}

/// Repeat every sample: [B, C, L] → [B, C, 2L].
fn upsample(xs: &Tensor) -> Result<Tensor> {
    let (b, c, l) = xs.dims3()?;
    Ok(xs.unsqueeze(3)?.repeat((1, 1, 1, 2))?.reshape((b, c, 2 * l))?)
}

/// Conv → GroupNorm → GELU (+ time bias) → Conv → GroupNorm → GELU, plus skip.
#[derive(Debug, Clone)]
struct ResConvBlock {
    conv1: Conv1d,
    norm1: GroupNorm,
    time_proj: Linear,
    conv2: Conv1d,
    norm2: GroupNorm,
    skip: Option<Conv1d>,
}

impl ResConvBlock {
    fn new(in_ch: usize, out_ch: usize, temb_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: 2,
            ..Default::default()
        };
        let conv1 = candle_nn::conv1d(in_ch, out_ch, 5, cfg, vb.pp("conv1"))?;
        let norm1 = candle_nn::group_norm(norm_groups(out_ch), out_ch, 1e-5, vb.pp("norm1"))?;
        let time_proj = candle_nn::linear(temb_dim, out_ch, vb.pp("time_proj"))?;
        let conv2 = candle_nn::conv1d(out_ch, out_ch, 5, cfg, vb.pp("conv2"))?;
        let norm2 = candle_nn::group_norm(norm_groups(out_ch), out_ch, 1e-5, vb.pp("norm2"))?;
        let skip = if in_ch == out_ch {
            None
        } else {
            Some(candle_nn::conv1d_no_bias(
                in_ch,
                out_ch,
                1,
                Default::default(),
                vb.pp("skip"),
            )?)
        };
        Ok(Self {
            conv1,
            norm1,
            time_proj,
            conv2,
            norm2,
            skip,
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let bias = temb.apply(&self.time_proj)?.unsqueeze(2)?;
        let h = xs
            .apply(&self.conv1)?
            .apply(&self.norm1)?
            .gelu()?
            .broadcast_add(&bias)?;
        let h = h.apply(&self.conv2)?.apply(&self.norm2)?.gelu()?;
        let residual = match &self.skip {
            Some(skip) => skip.forward(xs)?,
            None => xs.clone(),
        };
        Ok((h + residual)?)
    }
}

#[derive(Debug, Clone)]
struct DownLevel {
    block: ResConvBlock,
    down: Conv1d,
}

#[derive(Debug, Clone)]
struct UpLevel {
    up: Conv1d,
    block: ResConvBlock,
}

/// The denoiser network: `(x [B, C, L], t [B]) → v [B, C, L]`.
#[derive(Debug, Clone)]
pub struct DiffusionNet1d {
    config: UNetConfig,
    time_embed: TimestepEmbedding,
    conv_in: Conv1d,
    down: Vec<DownLevel>,
    mid: ResConvBlock,
    up: Vec<UpLevel>,
    conv_out: Conv1d,
}

impl DiffusionNet1d {
    pub fn new(config: &UNetConfig, vb: VarBuilder) -> Result<Self> {
        if config.time_features == 0 || config.time_features % 2 != 0 {
            return Err(Error::Config(format!(
                "time_features must be a positive even number, got {}",
                config.time_features
            )));
        }
        if config.io_channels == 0 || config.base_channels == 0 {
            return Err(Error::Config("channel counts must be positive".into()));
        }

        let temb_dim = config.time_embed_dim;
        let time_embed = TimestepEmbedding::new(config.time_features, temb_dim, vb.pp("time_embed"))?;

        let base = config.channels_at(0);
        let conv_in = candle_nn::conv1d(
            config.io_channels,
            base,
            5,
            Conv1dConfig {
                padding: 2,
                ..Default::default()
            },
            vb.pp("conv_in"),
        )?;

        let mut down = Vec::with_capacity(config.levels);
        for level in 0..config.levels {
            let vb = vb.pp(format!("down.{level}"));
            let ch = config.channels_at(level);
            let block = ResConvBlock::new(ch, ch, temb_dim, vb.pp("block"))?;
            let next = config.channels_at(level + 1);
            let down_conv = candle_nn::conv1d(ch, next, 1, Default::default(), vb.pp("down"))?;
            down.push(DownLevel {
                block,
                down: down_conv,
            });
        }

        let deepest = config.channels_at(config.levels);
        let mid = ResConvBlock::new(deepest, deepest, temb_dim, vb.pp("mid"))?;

        let up_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut up = Vec::with_capacity(config.levels);
        for level in (0..config.levels).rev() {
            let vb = vb.pp(format!("up.{level}"));
            let ch = config.channels_at(level);
            let up_conv = candle_nn::conv1d(config.channels_at(level + 1), ch, 3, up_cfg, vb.pp("up"))?;
            let block = ResConvBlock::new(2 * ch, ch, temb_dim, vb.pp("block"))?;
            up.push(UpLevel { up: up_conv, block });
        }

        let conv_out = candle_nn::conv1d(base, config.io_channels, 1, Default::default(), vb.pp("conv_out"))?;

        Ok(Self {
            config: config.clone(),
            time_embed,
            conv_in,
            down,
            mid,
            up,
            conv_out,
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    /// Predict the velocity for `x` [B, C, L] at timesteps `t` [B].
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        let (batch, channels, length) = x.dims3()?;
        if channels != self.config.io_channels {
            return Err(Error::invalid(format!(
                "expected {} channels, got {channels}",
                self.config.io_channels
            )));
        }
        if length % self.config.length_multiple() != 0 {
            return Err(Error::invalid(format!(
                "signal length {length} is not a multiple of {}",
                self.config.length_multiple()
            )));
        }
        if t.dims() != &[batch] {
            return Err(Error::invalid(format!(
                "expected timesteps of shape [{batch}], got {:?}",
                t.dims()
            )));
        }

        let temb = self.time_embed.forward(&t.to_dtype(x.dtype())?)?;

        let mut h = x.apply(&self.conv_in)?;
        let mut skips = Vec::with_capacity(self.down.len());
        for level in &self.down {
            h = level.block.forward(&h, &temb)?;
            skips.push(h.clone());
            h = downsample(&h)?.apply(&level.down)?;
        }

        h = self.mid.forward(&h, &temb)?;

        for level in &self.up {
            let skip = skips
                .pop()
                .ok_or_else(|| Error::invalid("unbalanced U-Net levels"))?;
            h = upsample(&h)?.apply(&level.up)?;
            h = Tensor::cat(&[&h, &skip], 1)?;
            h = level.block.forward(&h, &temb)?;
        }

        Ok(h.apply(&self.conv_out)?)
    }
}

impl Denoiser for DiffusionNet1d {
    fn denoise(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        self.forward(x, t)
    }
}
