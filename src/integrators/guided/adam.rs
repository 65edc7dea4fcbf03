//! Stochastic gradient descent for the BSDF sampling fraction.

use crate::core::pbrt::Float;

/// Hyperparameters of the optimizer.
#[derive(Copy, Clone)]
struct Hyperparameters {
    learning_rate: Float,
    batch_size: Float,
    epsilon: Float,
    beta1: Float,
    beta2: Float,
}

/// Mutable optimizer state.
#[derive(Copy, Clone, Default)]
struct State {
    iter: i32,
    first_moment: Float,
    second_moment: Float,
    variable: Float,
    batch_accumulation: Float,
    batch_gradient: Float,
}

/// Implements the stochastic-gradient-based Adam optimizer [Kingma and Ba 2014]
/// on a single scalar variable.
#[derive(Copy, Clone)]
pub struct AdamOptimizer {
    state: State,
    hparams: Hyperparameters,
}

impl AdamOptimizer {
    /// Create a new `AdamOptimizer`.
    ///
    /// * `learning_rate` - Step size scale.
    pub fn new(learning_rate: Float) -> Self {
        Self {
            state: State::default(),
            hparams: Hyperparameters {
                learning_rate,
                batch_size: 1.0,
                epsilon: 1e-08,
                beta1: 0.9,
                beta2: 0.999,
            },
        }
    }

    /// Accumulate a weighted gradient sample; once the accumulated statistical
    /// weight exceeds the batch size, a descent step is taken on the mean.
    ///
    /// * `gradient`           - The loss gradient sample.
    /// * `statistical_weight` - Weight of the sample.
    pub fn append(&mut self, gradient: Float, statistical_weight: Float) {
        self.state.batch_gradient += gradient * statistical_weight;
        self.state.batch_accumulation += statistical_weight;

        if self.state.batch_accumulation > self.hparams.batch_size {
            self.step(self.state.batch_gradient / self.state.batch_accumulation);

            self.state.batch_gradient = 0.0;
            self.state.batch_accumulation = 0.0;
        }
    }

    /// Take one descent step.
    ///
    /// * `gradient` - The loss gradient.
    pub fn step(&mut self, gradient: Float) {
        self.state.iter += 1;

        let actual_learning_rate = self.hparams.learning_rate
            * (1.0 - self.hparams.beta2.powi(self.state.iter)).sqrt()
            / (1.0 - self.hparams.beta1.powi(self.state.iter));
        self.state.first_moment =
            self.hparams.beta1 * self.state.first_moment + (1.0 - self.hparams.beta1) * gradient;
        self.state.second_moment = self.hparams.beta2 * self.state.second_moment
            + (1.0 - self.hparams.beta2) * gradient * gradient;
        self.state.variable -= actual_learning_rate * self.state.first_moment
            / (self.state.second_moment.sqrt() + self.hparams.epsilon);

        // Clamp the variable to the range [-20, 20] as a safeguard to avoid
        // numerical instability: since the sigmoid involves the exponential of
        // the variable, values of -20 or 20 already yield *extremely* small and
        // large results that are pretty much never necessary in practice.
        self.state.variable = self.state.variable.clamp(-20.0, 20.0);
    }

    /// Returns the optimized variable.
    pub fn variable(&self) -> Float {
        self.state.variable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_to_negative_clamp() {
        let mut opt = AdamOptimizer::new(0.01);
        for _ in 0..10_000 {
            opt.append(1e6, 1.0);
        }
        assert_eq!(opt.variable(), -20.0);
    }

    #[test]
    fn converges_to_positive_clamp() {
        let mut opt = AdamOptimizer::new(0.01);
        for _ in 0..10_000 {
            opt.append(-1e6, 1.0);
        }
        assert_eq!(opt.variable(), 20.0);
    }

    #[test]
    fn batching_waits_for_enough_weight() {
        let mut opt = AdamOptimizer::new(0.01);
        opt.append(1.0, 0.5);
        assert_eq!(opt.variable(), 0.0);
        opt.append(1.0, 1.0);
        assert!(opt.variable() < 0.0);
    }
}
