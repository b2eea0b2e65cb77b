//! Fixed-length training segments.
//!
//! The training set is a single `.npy` array of shape (N, L): N mono
//! segments of L samples. Each item is repeated across `channels` so the
//! model sees `[channels, L]` signals. Batches are drawn in a shuffled order
//! from the caller's generator; a trailing partial batch is dropped so every
//! batch has the same shape.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::{Error, Result};

/// In-memory set of mono segments.
#[derive(Debug, Clone)]
pub struct SampleDataset {
    data: Tensor, // [N, L], f32
    channels: usize,
}

impl SampleDataset {
    /// Load an (N, L) `.npy` array onto `device`.
    pub fn from_npy(path: impl AsRef<Path>, channels: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = Tensor::read_npy(path)
            .map_err(|e| Error::Dataset(format!("failed to read {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), shape = ?data.dims(), "loaded training data");
        Self::from_tensor(data.to_device(device)?, channels)
    }

    /// Wrap an existing (N, L) tensor.
    pub fn from_tensor(data: Tensor, channels: usize) -> Result<Self> {
        if data.rank() != 2 {
            return Err(Error::Dataset(format!(
                "expected a 2-D array of segments, got shape {:?}",
                data.dims()
            )));
        }
        if channels == 0 {
            return Err(Error::Dataset("channels must be positive".into()));
        }
        Ok(Self {
            data: data.to_dtype(DType::F32)?,
            channels,
        })
    }

    pub fn len(&self) -> usize {
        self.data.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples per segment.
    pub fn segment_len(&self) -> usize {
        self.data.dims()[1]
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Item `idx` as `[channels, L]`.
    pub fn get(&self, idx: usize) -> Result<Tensor> {
        if idx >= self.len() {
            return Err(Error::Dataset(format!(
                "index {idx} out of range for {} segments",
                self.len()
            )));
        }
        let row = self.data.narrow(0, idx, 1)?;
        Ok(row.repeat((self.channels, 1))?)
    }

    /// Stack the given items into `[B, channels, L]`.
    pub fn batch(&self, indices: &[usize]) -> Result<Tensor> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(Error::Dataset(format!(
                "index {bad} out of range for {} segments",
                self.len()
            )));
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.data.device())?;
        let rows = self.data.index_select(&ids, 0)?.unsqueeze(1)?;
        Ok(rows.repeat((1, self.channels, 1))?)
    }

    /// One epoch of shuffled index batches of exactly `batch_size` items.
    pub fn epoch_order<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
        if batch_size == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
            .chunks_exact(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}
