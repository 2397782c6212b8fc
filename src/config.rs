use clap::ValueEnum;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("invalid training configuration: {0}")]
pub struct ConfigError(pub String);

/// 2 psi in Pa, the nominal CMP down-force.
pub const APPLIED_PRESSURE_PA: f64 = 2.0 * 6894.76;

// Material and geometry of the wafer.
#[derive(Debug, Clone, Copy)]
pub struct PlateConstants {
    pub youngs_modulus: f64, // Pa
    pub thickness: f64,      // m
    pub poisson_ratio: f64,
}

impl Default for PlateConstants {
    fn default() -> Self {
        PlateConstants {
            youngs_modulus: 1.69e11,
            thickness: 5e-4,
            poisson_ratio: 0.27851,
        }
    }
}

impl PlateConstants {
    /// Flexural rigidity `K = E t^3 / (12 (1 - v^2))`.
    pub fn flexural_rigidity(&self) -> f64 {
        self.youngs_modulus * self.thickness.powi(3)
            / (12.0 * (1.0 - self.poisson_ratio * self.poisson_ratio))
    }
}

// Scales that take the raw profile to the unit range the networks see.
#[derive(Debug, Clone, Copy)]
pub struct Normalization {
    pub radius_scale: f64,
    pub radius_offset: f64,
    pub radius_cutoff: f64,
    pub applied_pressure: f64,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization {
            radius_scale: 0.1,
            radius_offset: 1e-3,
            radius_cutoff: 0.099,
            applied_pressure: APPLIED_PRESSURE_PA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Activation {
    Tanh,
    Swish,
}

// Hyper-parameters for one training run.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub layers: Vec<i64>,
    pub activation: Activation,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub epochs: usize,
    pub log_every: usize,
    pub validate_every: usize,
    pub num_points: usize,
    pub train_fraction: f64,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            layers: default_layers(12, 50),
            activation: Activation::Tanh,
            learning_rate: 1e-5,
            beta1: 0.9,
            beta2: 0.99,
            eps: 1e-15,
            epochs: 20_000,
            log_every: 20,
            validate_every: 100,
            num_points: 1500,
            train_fraction: 0.8,
            seed: None,
        }
    }
}

/// `[1, width, .., width, 1]` with `hidden` hidden layers.
pub fn default_layers(hidden: usize, width: i64) -> Vec<i64> {
    let mut layers = Vec::with_capacity(hidden + 2);
    layers.push(1);
    layers.extend(std::iter::repeat(width).take(hidden));
    layers.push(1);
    layers
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: &str| Err(ConfigError(msg.to_string()));

        // The residual differentiates four times, so a purely affine
        // network (no hidden layer) has no usable fourth derivative.
        if self.layers.len() < 3 {
            return bad("at least one hidden layer is required");
        }
        if self.layers[0] != 1 || self.layers[self.layers.len() - 1] != 1 {
            return bad("networks map a scalar radius to a scalar field");
        }
        if self.layers.iter().any(|&n| n <= 0) {
            return bad("layer widths must be positive");
        }
        if self.epochs == 0 {
            return bad("epochs must be non-zero");
        }
        if !(self.learning_rate > 0.0) {
            return bad("learning rate must be positive");
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return bad("train fraction must lie in (0, 1)");
        }
        if self.log_every == 0 || self.validate_every == 0 {
            return bad("logging intervals must be non-zero");
        }
        Ok(())
    }
}
