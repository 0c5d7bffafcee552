use crate::{config::TrainingConfig, TrainingError};

/// Learning rate at a global step for the linear-decay schedule.
///
/// Pure in `step`, so a resumed run evaluates the exact same value a
/// continuous run would.
pub fn learning_rate(step: u64, total_iters: u64, base_lr: f64) -> f64 {
    if total_iters == 0 || step > total_iters {
        return 0.0;
    }
    let progress = step as f64 / total_iters as f64;
    base_lr * (1.0 - progress).max(0.0)
}

/// Normalization momentum for the stabilization phase: `1 / k`, which turns
/// the running statistics into a cumulative average over the phase.
pub fn bn_momentum(phase_local_step: u64) -> f64 {
    1.0 / phase_local_step.max(1) as f64
}

pub trait LRScheduler: Send {
    fn learning_rate(&self, iteration: u64) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct LinearDecay {
    base_lr: f64,
    total_iters: u64,
}

impl LinearDecay {
    pub fn new(base_lr: f64, total_iters: u64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_iters == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_iters greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            total_iters,
        })
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        Self::new(config.optimizer.learning_rate, config.schedule.total_iters)
    }
}

impl LRScheduler for LinearDecay {
    fn learning_rate(&self, iteration: u64) -> f64 {
        learning_rate(iteration, self.total_iters, self.base_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_monotonically_to_zero() {
        let total = 100;
        let mut previous = f64::INFINITY;
        for step in 0..=total {
            let lr = learning_rate(step, total, 0.1);
            assert!(lr >= 0.0);
            assert!(lr <= previous, "lr increased at step {step}");
            previous = lr;
        }
        assert_eq!(learning_rate(0, total, 0.1), 0.1);
        assert_eq!(learning_rate(total, total, 0.1), 0.0);
        assert_eq!(learning_rate(total + 1, total, 0.1), 0.0);
        assert_eq!(learning_rate(total * 3, total, 0.1), 0.0);
    }

    #[test]
    fn resumed_schedule_matches_continuous_run() -> Result<(), TrainingError> {
        let continuous = LinearDecay::new(1e-4, 10_000)?;
        let continuous_lrs: Vec<f64> = (0..10_000)
            .map(|step| continuous.learning_rate(step))
            .collect();

        let resumed = LinearDecay::new(1e-4, 10_000)?;
        for step in 4_321..10_000u64 {
            let lr = resumed.learning_rate(step);
            assert_eq!(
                lr.to_bits(),
                continuous_lrs[step as usize].to_bits(),
                "step {step}"
            );
        }
        Ok(())
    }

    #[test]
    fn momentum_is_reciprocal_of_phase_step() {
        assert_eq!(bn_momentum(1), 1.0);
        assert_eq!(bn_momentum(0), 1.0);
        let mut previous = f64::INFINITY;
        for k in 1..=1000u64 {
            let momentum = bn_momentum(k);
            assert_eq!(momentum, 1.0 / k as f64);
            assert!(momentum < previous);
            previous = momentum;
        }
    }

    #[test]
    fn rejects_degenerate_schedules() {
        assert!(LinearDecay::new(0.0, 10).is_err());
        assert!(LinearDecay::new(0.1, 0).is_err());
    }
}
