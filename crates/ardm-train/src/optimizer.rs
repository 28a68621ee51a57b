//! Optimizer and learning-rate schedule

use anyhow::Result;
use aprender::nn::optim::{AdamW, Optimizer};
use aprender::nn::Module;
use ardm_model::Ardm;

/// Optimizer hyperparameters
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Warmup steps; negative means "derive from warmup_ratio"
    pub warmup_steps: i64,
    /// Warmup ratio of the dataset length, used when warmup_steps < 0
    pub warmup_ratio: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            warmup_steps: -1,
            warmup_ratio: 0.1,
        }
    }
}

/// Resolve the effective warmup step count
///
/// A negative `warmup_steps` falls back to `warmup_ratio *
/// dataset_len`, mirroring the CLI contract.
pub fn resolve_warmup_steps(config: &OptimizerConfig, dataset_len: usize) -> usize {
    if config.warmup_steps < 0 {
        (config.warmup_ratio * dataset_len as f32) as usize
    } else {
        config.warmup_steps as usize
    }
}

/// Create the AdamW optimizer over the model's parameters
pub fn setup_optimizer(model: &mut Ardm, config: &OptimizerConfig) -> Result<AdamW> {
    let parameters = model.parameters_mut();
    if parameters.is_empty() {
        anyhow::bail!("Model has no parameters to optimize");
    }

    Ok(AdamW::new(parameters, config.learning_rate))
}

/// Linear warmup followed by linear decay
///
/// The multiplier ramps from 0 to 1 over `warmup_steps` optimizer
/// steps, then decays linearly to 0 at `total_steps`. Applied by
/// setting the optimizer's learning rate directly after each step.
#[derive(Debug, Clone)]
pub struct WarmupLinearSchedule {
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    step_count: usize,
}

impl WarmupLinearSchedule {
    /// Create a schedule over `total_steps` optimizer steps
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step_count: 0,
        }
    }

    /// Learning-rate multiplier at an optimizer step
    pub fn lr_multiplier(&self, step: usize) -> f32 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            step as f32 / self.warmup_steps as f32
        } else if step >= self.total_steps {
            0.0
        } else if self.total_steps > self.warmup_steps {
            (self.total_steps - step) as f32 / (self.total_steps - self.warmup_steps) as f32
        } else {
            1.0
        }
    }

    /// Learning rate the optimizer currently runs at
    pub fn current_lr(&self) -> f32 {
        self.base_lr * self.lr_multiplier(self.step_count)
    }

    /// Advance one optimizer step and push the new rate into AdamW
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.step_count += 1;
        optimizer.set_lr(self.base_lr * self.lr_multiplier(self.step_count));
    }

    /// Number of optimizer steps taken
    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

/// Current learning rate of the optimizer
pub fn get_learning_rate(optimizer: &AdamW) -> f32 {
    optimizer.lr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_ramps_up_during_warmup() {
        let schedule = WarmupLinearSchedule::new(1e-4, 10, 100);
        assert_eq!(schedule.lr_multiplier(0), 0.0);
        assert!((schedule.lr_multiplier(5) - 0.5).abs() < 1e-6);
        assert!((schedule.lr_multiplier(10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_multiplier_decays_to_zero() {
        let schedule = WarmupLinearSchedule::new(1e-4, 10, 100);
        assert!((schedule.lr_multiplier(55) - 0.5).abs() < 1e-6);
        assert_eq!(schedule.lr_multiplier(100), 0.0);
        assert_eq!(schedule.lr_multiplier(150), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_peak() {
        let schedule = WarmupLinearSchedule::new(1e-4, 0, 10);
        assert!((schedule.lr_multiplier(0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resolve_warmup_from_ratio() {
        let config = OptimizerConfig {
            learning_rate: 1e-5,
            warmup_steps: -1,
            warmup_ratio: 0.25,
        };
        assert_eq!(resolve_warmup_steps(&config, 200), 50);
    }

    #[test]
    fn test_resolve_warmup_explicit() {
        let config = OptimizerConfig {
            learning_rate: 1e-5,
            warmup_steps: 30,
            warmup_ratio: 0.25,
        };
        assert_eq!(resolve_warmup_steps(&config, 200), 30);
    }
}
