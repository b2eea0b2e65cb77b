//! Diffusion trainer: optimizer, EMA shadow, checkpoints and demos.
//!
//! One [`DiffusionTrainer::training_step`] call consumes one micro-batch.
//! Every `accum_batches` micro-batches the accumulated loss is
//! back-propagated, AdamW takes a step and the EMA weights follow. A
//! partial group left at the end of an epoch is applied as its own step.
//! "Step" in logs, checkpoints and demos always means an optimizer step.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::demo::DemoCallback;
use super::ema::{EmaSchedule, copy_into, ema_update};
use super::{training_targets, warp_timesteps};
use crate::checkpoint::{self, CheckpointPaths, TrainingState};
use crate::config::DiffusionConfig;
use crate::dataset::SampleDataset;
use crate::diffusion::noise::randn_like;
use crate::model::DiffusionNet1d;
use crate::sobol::SobolSampler;
use crate::{Error, Result};

/// Result of feeding one micro-batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// MSE of this micro-batch.
    pub loss: f32,
    /// Set when this micro-batch completed an optimizer step.
    pub optimizer_step: Option<usize>,
}

/// Owns the live model, its EMA shadow and all training randomness.
pub struct DiffusionTrainer {
    config: DiffusionConfig,
    device: Device,
    live_vars: VarMap,
    ema_vars: VarMap,
    model: DiffusionNet1d,
    ema_model: DiffusionNet1d,
    optimizer: AdamW,
    ema_schedule: EmaSchedule,
    sobol: SobolSampler,
    rng: ChaCha8Rng,
    demo: DemoCallback,
    pending: Vec<Tensor>,
    global_step: usize,
    epoch: usize,
}

impl DiffusionTrainer {
    /// Fresh model and optimizer, seeded from `config.seed`.
    pub fn new(config: DiffusionConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let unet = config.unet_config();

        let live_vars = VarMap::new();
        let model = DiffusionNet1d::new(
            &unet,
            VarBuilder::from_varmap(&live_vars, DType::F32, device),
        )?;
        let ema_vars = VarMap::new();
        let ema_model = DiffusionNet1d::new(
            &unet,
            VarBuilder::from_varmap(&ema_vars, DType::F32, device),
        )?;
        copy_into(&live_vars, &ema_vars)?;

        let optimizer = AdamW::new(
            live_vars.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let ema_schedule = EmaSchedule {
            decay: config.ema_decay,
            warmup_decay: config.ema_warmup_decay,
            warmup_epochs: config.ema_warmup_epochs,
        };

        tracing::info!(
            parameters = live_vars.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            seed = config.seed,
            "initialized diffusion model"
        );

        Ok(Self {
            sobol: SobolSampler::scrambled(config.seed),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            demo: DemoCallback::from_config(&config),
            device: device.clone(),
            config,
            live_vars,
            ema_vars,
            model,
            ema_model,
            optimizer,
            ema_schedule,
            pending: Vec::new(),
            global_step: 0,
            epoch: 0,
        })
    }

    /// Restore live and EMA weights from a checkpoint written at `step`.
    ///
    /// Step and epoch come from the checkpoint's progress record. Without
    /// one, training restarts at epoch 0. Optimizer moments are not part of a
    /// checkpoint and start fresh.
    pub fn resume(&mut self, paths: &CheckpointPaths, step: usize) -> Result<()> {
        self.live_vars.load(&paths.live)?;
        self.ema_vars.load(&paths.ema)?;

        let state = if paths.state.exists() {
            checkpoint::load_state(&paths.state)?
        } else {
            tracing::warn!(path = %paths.state.display(), "no training state, restarting at epoch 0");
            TrainingState { step, epoch: 0 }
        };
        self.global_step = state.step;
        self.epoch = state.epoch;
        self.pending.clear();
        tracing::info!(
            step = state.step,
            epoch = state.epoch,
            path = %paths.live.display(),
            "resumed from checkpoint"
        );
        Ok(())
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn model(&self) -> &DiffusionNet1d {
        &self.model
    }

    /// The EMA model, used for sampling.
    pub fn ema_model(&self) -> &DiffusionNet1d {
        &self.ema_model
    }

    pub fn live_vars(&self) -> &VarMap {
        &self.live_vars
    }

    pub fn ema_vars(&self) -> &VarMap {
        &self.ema_vars
    }

    /// Optimizer steps taken so far.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// EMA decay applied in the current epoch.
    pub fn ema_decay(&self) -> f64 {
        self.ema_schedule.decay_at(self.epoch)
    }

    /// Feed one micro-batch `[B, channels, sample_size]`.
    pub fn training_step(&mut self, reals: &Tensor) -> Result<StepOutput> {
        let (batch, channels, length) = reals.dims3()?;
        if channels != self.config.channels || length != self.config.sample_size {
            return Err(Error::invalid(format!(
                "expected batches of [_, {}, {}], got {:?}",
                self.config.channels,
                self.config.sample_size,
                reals.dims()
            )));
        }
        let reals = reals.to_dtype(DType::F32)?;

        let t = warp_timesteps(&self.sobol.draw(batch));
        let noise = randn_like(&reals, &mut self.rng)?;
        let inputs = training_targets(&reals, &t, &noise)?;

        let v = self.model.forward(&inputs.noised, &inputs.t)?;
        let loss = candle_nn::loss::mse(&v, &inputs.target)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        self.pending.push((loss / self.config.accum_batches as f64)?);
        let optimizer_step = if self.pending.len() < self.config.accum_batches {
            None
        } else {
            self.apply_pending()?
        };

        Ok(StepOutput {
            loss: loss_value,
            optimizer_step,
        })
    }

    /// Back-propagate the accumulated micro-batch losses and update the EMA.
    ///
    /// A partial group is rescaled to the mean over the micro-batches it
    /// holds. Returns the new optimizer step, or `None` when nothing is pending.
    fn apply_pending(&mut self) -> Result<Option<usize>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let scale = self.config.accum_batches as f64 / self.pending.len() as f64;
        let total = (Tensor::stack(&self.pending, 0)?.sum_all()? * scale)?;
        self.pending.clear();
        self.optimizer.backward_step(&total)?;
        self.global_step += 1;

        let decay = self.ema_schedule.decay_at(self.epoch);
        ema_update(&self.live_vars, &self.ema_vars, decay)?;
        Ok(Some(self.global_step))
    }

    /// Checkpoint and demo hooks after optimizer step `step`.
    fn after_step(&mut self, step: usize) -> Result<()> {
        let every = self.config.checkpoint_every;
        if every > 0 && step % every == 0 {
            let state = TrainingState {
                step,
                epoch: self.epoch,
            };
            checkpoint::save(&self.config.save_path, &state, &self.live_vars, &self.ema_vars)?;
        }
        self.demo
            .on_step(&self.ema_model, step, &self.device, &mut self.rng);
        Ok(())
    }

    /// Train for `config.max_epochs` epochs over `dataset`.
    pub fn fit(&mut self, dataset: &SampleDataset) -> Result<()> {
        if dataset.segment_len() != self.config.sample_size {
            return Err(Error::Dataset(format!(
                "segments have {} samples, config expects {}",
                dataset.segment_len(),
                self.config.sample_size
            )));
        }
        if dataset.channels() != self.config.channels {
            return Err(Error::Dataset(format!(
                "dataset yields {} channels, config expects {}",
                dataset.channels(),
                self.config.channels
            )));
        }
        if dataset.len() < self.config.batch_size {
            return Err(Error::Dataset(format!(
                "{} segments cannot fill a batch of {}",
                dataset.len(),
                self.config.batch_size
            )));
        }

        checkpoint::save_config(&self.config.save_path, &self.config)?;

        for epoch in self.epoch..self.config.max_epochs {
            self.epoch = epoch;
            let batches = dataset.epoch_order(self.config.batch_size, &mut self.rng);
            let mut epoch_loss = 0.0f64;
            let mut last_step = None;

            for indices in &batches {
                let reals = dataset.batch(indices)?;
                let out = self.training_step(&reals)?;
                epoch_loss += out.loss as f64;

                if let Some(step) = out.optimizer_step {
                    tracing::debug!(step, epoch, loss = out.loss, "train step");
                    self.after_step(step)?;
                    last_step = Some(step);
                }
            }

            if let Some(step) = self.apply_pending()? {
                tracing::debug!(step, epoch, "train step (partial accumulation)");
                self.after_step(step)?;
                last_step = Some(step);
            }

            // A checkpoint taken on the epoch's last step resumes in the next epoch.
            let every = self.config.checkpoint_every;
            if let Some(step) = last_step
                && every > 0
                && step % every == 0
            {
                let state = TrainingState {
                    step,
                    epoch: epoch + 1,
                };
                checkpoint::save_state(&self.config.save_path, &state)?;
            }

            tracing::info!(
                epoch,
                step = self.global_step,
                mean_loss = epoch_loss / batches.len().max(1) as f64,
                "epoch finished"
            );
        }
        self.epoch = self.config.max_epochs;
        Ok(())
    }
}
