use std::path::Path;

use tch::nn::{self, Module, OptimizerConfig};
use tch::{Device, TchError, Tensor};

use crate::config::{Activation, TrainConfig};

/// Fully connected network with an activation after every layer but the last.
#[derive(Debug)]
pub struct Mlp {
    layers: nn::Sequential,
}

impl Mlp {
    pub fn new(path: &nn::Path, sizes: &[i64], activation: Activation) -> Self {
        let depth = sizes.len().saturating_sub(1);
        let mut layers = nn::seq();
        for (i, pair) in sizes.windows(2).enumerate() {
            layers = layers.add(nn::linear(
                path / format!("layer_{i}"),
                pair[0],
                pair[1],
                Default::default(),
            ));
            if i + 1 < depth {
                layers = match activation {
                    Activation::Tanh => layers.add_fn(|x| x.tanh()),
                    Activation::Swish => layers.add_fn(|x| x * x.sigmoid()),
                };
            }
        }
        Mlp { layers }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.layers.forward(xs)
    }
}

// One field head (W, Q or P): its own parameters and its own Adam state.
pub struct FieldNet {
    name: &'static str,
    vs: nn::VarStore,
    mlp: Mlp,
    opt: nn::Optimizer,
}

impl FieldNet {
    pub fn new(name: &'static str, config: &TrainConfig, device: Device) -> Result<Self, TchError> {
        let vs = nn::VarStore::new(device);
        let mlp = Mlp::new(&(vs.root() / name), &config.layers, config.activation);
        let opt = nn::Adam {
            beta1: config.beta1,
            beta2: config.beta2,
            wd: 0.0,
            eps: config.eps,
            amsgrad: false,
        }
        .build(&vs, config.learning_rate)?;
        Ok(FieldNet { name, vs, mlp, opt })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn forward(&self, r: &Tensor) -> Tensor {
        self.mlp.forward(r)
    }

    pub fn zero_grad(&mut self) {
        self.opt.zero_grad();
    }

    pub fn step(&mut self) {
        self.opt.step();
    }

    pub fn save(&self, dir: &Path) -> Result<(), TchError> {
        self.vs.save(dir.join(format!("{}.ot", self.name)))
    }

    pub fn load(&mut self, dir: &Path) -> Result<(), TchError> {
        self.vs.load(dir.join(format!("{}.ot", self.name)))
    }

    #[cfg(test)]
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.vs.trainable_variables()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn maps_a_column_of_radii_to_a_column() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mlp = Mlp::new(&vs.root(), &[1, 16, 16, 1], Activation::Tanh);
        let r = Tensor::linspace(0.0, 1.0, 32, (Kind::Float, Device::Cpu)).reshape([-1, 1]);
        assert_eq!(mlp.forward(&r).size(), vec![32, 1]);
        // Three linear layers, weight and bias each.
        assert_eq!(vs.trainable_variables().len(), 6);
    }

    #[test]
    fn swish_network_is_smooth_in_its_input() {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let mlp = Mlp::new(&vs.root(), &[1, 8, 1], Activation::Swish);
        let r = Tensor::from_slice(&[0.25f32, 0.5, 0.75])
            .reshape([-1, 1])
            .set_requires_grad(true);
        let out = mlp.forward(&r);
        let grad = Tensor::run_backward(&[out.sum(Kind::Float)], &[&r], true, true);
        assert_eq!(grad[0].size(), vec![3, 1]);
        assert!(grad[0].isfinite().all().int64_value(&[]) == 1);
    }

    #[test]
    fn field_nets_do_not_share_parameters() {
        tch::manual_seed(0);
        let config = TrainConfig {
            layers: vec![1, 4, 1],
            ..TrainConfig::default()
        };
        let w = FieldNet::new("w", &config, Device::Cpu).unwrap();
        let q = FieldNet::new("q", &config, Device::Cpu).unwrap();
        let r = Tensor::from_slice(&[0.5f32]).reshape([-1, 1]);
        let diff = (w.forward(&r) - q.forward(&r)).abs().double_value(&[]);
        assert!(diff > 0.0);
        assert_eq!(w.name(), "w");
    }
}
