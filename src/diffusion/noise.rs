//! Reproducible Gaussian noise.
//!
//! candle's CPU device cannot be seeded, so noise is drawn on the host from
//! the caller's generator and uploaded. One generator threaded through a
//! whole sampling or training call gives run-to-run reproducibility.

use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::Result;

/// Standard normal tensor of the given shape, drawn from `rng`.
pub fn randn<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    let noise = Tensor::from_vec(values, shape, device)?;
    Ok(noise.to_dtype(dtype)?)
}

/// Standard normal tensor with the shape, dtype and device of `like`.
pub fn randn_like<R: Rng + ?Sized>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    randn(like.shape(), like.dtype(), like.device(), rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn same_seed_same_noise() {
        let device = Device::Cpu;
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let x = randn((2, 3, 8), DType::F32, &device, &mut a).unwrap();
        let y = randn((2, 3, 8), DType::F32, &device, &mut b).unwrap();
        assert_eq!(
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn roughly_standard() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = randn(20_000, DType::F32, &device, &mut rng).unwrap();
        let mean: f32 = x.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = x.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.05, "var = {var}");
    }

    #[test]
    fn like_keeps_shape_and_dtype() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let template = Tensor::zeros((3, 2, 5), DType::F64, &device).unwrap();
        let noise = randn_like(&template, &mut rng).unwrap();
        assert_eq!(noise.dims(), &[3, 2, 5]);
        assert_eq!(noise.dtype(), DType::F64);
    }
}
