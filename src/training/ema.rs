//! Exponential moving average of model parameters.
//!
//! `shadow ← decay·shadow + (1 - decay)·live`, applied per named variable.
//! The decay is lower during a warmup period so the shadow catches up with
//! the fast-moving early weights.

use candle_nn::VarMap;

use crate::{Error, Result};

/// Decay rate as a function of the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaSchedule {
    pub decay: f64,
    pub warmup_decay: f64,
    pub warmup_epochs: usize,
}

impl EmaSchedule {
    pub fn decay_at(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            self.warmup_decay
        } else {
            self.decay
        }
    }
}

/// Copy every live variable into the shadow map, creating the shadow's
/// variables if needed. The two maps end up with identical contents.
pub fn copy_into(live: &VarMap, shadow: &VarMap) -> Result<()> {
    let live_vars = live.data().lock().map_err(poisoned)?;
    let mut shadow_vars = shadow.data().lock().map_err(poisoned)?;
    for (name, var) in live_vars.iter() {
        let value = var.as_tensor().detach().copy()?;
        match shadow_vars.get(name) {
            Some(existing) => existing.set(&value)?,
            None => {
                shadow_vars.insert(name.clone(), candle_core::Var::from_tensor(&value)?);
            }
        }
    }
    Ok(())
}

/// Move every shadow variable toward its live counterpart.
pub fn ema_update(live: &VarMap, shadow: &VarMap, decay: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&decay) {
        return Err(Error::invalid(format!("EMA decay must lie in [0, 1], got {decay}")));
    }
    let live_vars = live.data().lock().map_err(poisoned)?;
    let shadow_vars = shadow.data().lock().map_err(poisoned)?;
    for (name, var) in live_vars.iter() {
        let target = shadow_vars
            .get(name)
            .ok_or_else(|| Error::invalid(format!("shadow model has no variable {name}")))?;
        let live_value = var.as_tensor().detach();
        let blended = ((target.as_tensor().detach() * decay)? + (live_value * (1.0 - decay))?)?;
        target.set(&blended)?;
    }
    Ok(())
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::invalid("parameter map lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn map_with(value: f32, device: &Device) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "w", Init::Const(value as f64), DType::F32, device)
            .unwrap();
        varmap
    }

    fn read(varmap: &VarMap, name: &str) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        data[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn schedule_switches_after_warmup() {
        let schedule = EmaSchedule {
            decay: 0.999,
            warmup_decay: 0.95,
            warmup_epochs: 25,
        };
        assert_eq!(schedule.decay_at(0), 0.95);
        assert_eq!(schedule.decay_at(24), 0.95);
        assert_eq!(schedule.decay_at(25), 0.999);
    }

    #[test]
    fn update_interpolates() {
        let device = Device::Cpu;
        let live = map_with(1.0, &device);
        let shadow = map_with(0.0, &device);
        ema_update(&live, &shadow, 0.75).unwrap();
        for v in read(&shadow, "w") {
            assert!((v - 0.25).abs() < 1e-6);
        }
        // Live parameters are untouched.
        assert!(read(&live, "w").iter().all(|&v| v == 1.0));
    }

    #[test]
    fn decay_one_freezes_shadow() {
        let device = Device::Cpu;
        let live = map_with(3.0, &device);
        let shadow = map_with(-1.0, &device);
        ema_update(&live, &shadow, 1.0).unwrap();
        assert!(read(&shadow, "w").iter().all(|&v| v == -1.0));
    }

    #[test]
    fn copy_creates_independent_variables() {
        let device = Device::Cpu;
        let live = VarMap::new();
        let vb = VarBuilder::from_varmap(&live, DType::F32, &device);
        let _ = candle_nn::linear(4, 2, vb.pp("proj")).unwrap();

        let shadow = VarMap::new();
        copy_into(&live, &shadow).unwrap();
        assert_eq!(read(&live, "proj.weight"), read(&shadow, "proj.weight"));

        // Mutating the live map must not leak into the shadow.
        {
            let data = live.data().lock().unwrap();
            let w = &data["proj.weight"];
            w.set(&Tensor::zeros((2, 4), DType::F32, &device).unwrap()).unwrap();
        }
        assert_ne!(read(&live, "proj.weight"), read(&shadow, "proj.weight"));
    }

    #[test]
    fn missing_shadow_variable_is_an_error() {
        let device = Device::Cpu;
        let live = map_with(1.0, &device);
        let shadow = VarMap::new();
        assert!(ema_update(&live, &shadow, 0.9).is_err());
    }
}
