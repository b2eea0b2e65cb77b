//! Sinusoidal timestep embedding for diffusion conditioning.
//!
//! Converts scalar timesteps in `[0, 1]` to a learned embedding:
//! sinusoidal features → Linear → SiLU → Linear.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

/// Timestep embedding module.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    in_channels: usize,
    scale: f64,
}

impl TimestepEmbedding {
    /// - `in_channels`: dimension of the sinusoidal features (even)
    /// - `time_embed_dim`: output dimension
    pub fn new(in_channels: usize, time_embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(in_channels, time_embed_dim, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(time_embed_dim, time_embed_dim, vb.pp("linear_2"))?;
        Ok(Self {
            linear_1,
            linear_2,
            in_channels,
            scale: 1000.0,
        })
    }

    /// `t`: [B] → [B, in_channels] as `cat[cos(t·f), sin(t·f)]`.
    fn timestep_embedding(&self, t: &Tensor, dev: &Device) -> Result<Tensor> {
        let t = (t.to_dtype(DType::F32)? * self.scale)?;
        let half = self.in_channels / 2;
        let max_period: f64 = 10000.0;

        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::new(freqs.as_slice(), dev)?;

        let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
        Tensor::cat(&[&args.cos()?, &args.sin()?], 1)
    }

    /// Forward pass: t [B] → temb [B, time_embed_dim].
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let dtype = t.dtype();
        self.timestep_embedding(t, t.device())?
            .to_dtype(dtype)?
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn embedding_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let te = TimestepEmbedding::new(16, 24, vb.pp("te")).unwrap();
        let t = Tensor::new(&[0.5f32, 0.8, 0.1], &dev).unwrap();
        assert_eq!(te.forward(&t).unwrap().dims(), &[3, 24]);
    }

    #[test]
    fn sinusoidal_varies_with_timestep() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(32, 8, vb.pp("te")).unwrap();

        let t1 = Tensor::new(&[0.1f32], &dev).unwrap();
        let t2 = Tensor::new(&[0.9f32], &dev).unwrap();
        let emb1 = te.timestep_embedding(&t1, &dev).unwrap();
        let emb2 = te.timestep_embedding(&t2, &dev).unwrap();

        let diff: f32 = (emb1 - emb2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.1);
    }
}
