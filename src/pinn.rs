use std::path::Path;

use ndarray::Array1;
use tch::{Device, Kind, Reduction, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, TrainConfig};
use crate::dataset::{Samples, Splits};
use crate::network::FieldNet;
use crate::residual::plate_residual;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("loss diverged at epoch {epoch} (data {data}, residual {residual})")]
    Diverged {
        epoch: usize,
        data: f64,
        residual: f64,
    },
    #[error("libtorch: {0}")]
    Torch(#[from] TchError),
    #[error("failed to record losses: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub data: f64,
    pub residual: f64,
}

impl StepLosses {
    pub fn total(&self) -> f64 {
        self.data + self.residual
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub epoch: usize,
    pub data: f64,
    pub residual: f64,
    pub val: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub points: Vec<HistoryPoint>,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.last()
    }

    pub fn last_val(&self) -> Option<f64> {
        self.points.iter().rev().find_map(|p| p.val)
    }
}

// Network outputs in normalized units, flattened to plain vectors.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub r: Vec<f64>,
    pub w: Vec<f64>,
    pub q: Vec<f64>,
    pub p: Vec<f64>,
}

// A sample set moved onto the device as `[N, 1]` float columns.
struct FieldTensors {
    r: Tensor,
    w: Tensor,
    q: Tensor,
    p: Tensor,
}

impl FieldTensors {
    fn new(samples: &Samples, device: Device) -> Self {
        FieldTensors {
            r: column(&samples.r, device),
            w: column(&samples.w, device),
            q: column(&samples.q, device),
            p: column(&samples.p, device),
        }
    }
}

fn column(values: &Array1<f64>, device: Device) -> Tensor {
    Tensor::from_slice(&values.to_vec())
        .to_kind(Kind::Float)
        .reshape([-1, 1])
        .to_device(device)
}

fn to_vec(t: &Tensor) -> Result<Vec<f64>, TchError> {
    Vec::<f64>::try_from(&t.to_kind(Kind::Double).to_device(Device::Cpu).reshape([-1]))
}

/// Three independent networks for deflection, shear and pressure, trained
/// jointly against the data and the plate bending residual.
pub struct WaferPinn {
    coll_r: Tensor,
    train: FieldTensors,
    val: FieldTensors,
    rigidity: f64,
    w_net: FieldNet,
    q_net: FieldNet,
    p_net: FieldNet,
    config: TrainConfig,
    device: Device,
}

impl WaferPinn {
    pub fn new(
        splits: &Splits,
        rigidity: f64,
        config: &TrainConfig,
        device: Device,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let coll_r = column(&splits.collocation.r, device).set_requires_grad(true);

        Ok(WaferPinn {
            coll_r,
            train: FieldTensors::new(&splits.train, device),
            val: FieldTensors::new(&splits.val, device),
            rigidity,
            w_net: FieldNet::new("w", config, device)?,
            q_net: FieldNet::new("q", config, device)?,
            p_net: FieldNet::new("p", config, device)?,
            config: config.clone(),
            device,
        })
    }

    pub fn net(&self, r: &Tensor) -> (Tensor, Tensor, Tensor) {
        (
            self.w_net.forward(r),
            self.q_net.forward(r),
            self.p_net.forward(r),
        )
    }

    /// Plate residual at `r`; `r` must require grad.
    pub fn net_eqn(&self, r: &Tensor) -> Result<Tensor, TchError> {
        let (w, q, p) = self.net(r);
        plate_residual(&w, &q, &p, r, self.rigidity)
    }

    fn data_loss(&self, fields: &FieldTensors) -> Tensor {
        let (w, q, p) = self.net(&fields.r);
        w.mse_loss(&fields.w, Reduction::Mean)
            + p.mse_loss(&fields.p, Reduction::Mean)
            + q.mse_loss(&fields.q, Reduction::Mean)
    }

    fn nets_mut(&mut self) -> [&mut FieldNet; 3] {
        [&mut self.w_net, &mut self.q_net, &mut self.p_net]
    }

    /// One joint gradient step of all three networks on data + residual loss.
    pub fn train_step(&mut self) -> Result<StepLosses, TrainError> {
        for net in self.nets_mut() {
            net.zero_grad();
        }

        let data_loss = self.data_loss(&self.train);
        let f = self.net_eqn(&self.coll_r)?;
        let res_loss = f.square().mean(Kind::Float);
        let loss = &data_loss + &res_loss;
        loss.backward();

        for net in self.nets_mut() {
            net.step();
        }

        Ok(StepLosses {
            data: data_loss.double_value(&[]),
            residual: res_loss.double_value(&[]),
        })
    }

    /// Data loss on the validation split.
    pub fn validate(&self) -> f64 {
        tch::no_grad(|| self.data_loss(&self.val).double_value(&[]))
    }

    /// Trains for `epochs` steps, appending every recorded point to `history`
    /// and handing it to `on_record`.
    ///
    /// Points are recorded every `log_every` epochs, every `validate_every`
    /// epochs (with a validation loss) and at the final epoch. On error,
    /// `history` keeps every point recorded before the failure.
    pub fn run<F>(
        &mut self,
        epochs: usize,
        history: &mut TrainingHistory,
        mut on_record: F,
    ) -> Result<(), TrainError>
    where
        F: FnMut(&HistoryPoint) -> std::io::Result<()>,
    {
        let log_every = self.config.log_every;
        let validate_every = self.config.validate_every;

        for epoch in 0..epochs {
            let losses = self.train_step()?;
            if !losses.total().is_finite() {
                return Err(TrainError::Diverged {
                    epoch,
                    data: losses.data,
                    residual: losses.residual,
                });
            }

            let last = epoch + 1 == epochs;
            let logged = epoch % log_every == 0;
            let validated = epoch % validate_every == 0 || last;
            if !(logged || validated) {
                continue;
            }

            if logged {
                info!(
                    "It: {}, Data Loss: {:.3e}, Residual Loss: {:.3e}",
                    epoch, losses.data, losses.residual
                );
            }
            let val = validated.then(|| self.validate());
            if let Some(val) = val {
                info!("It: {}, Val Data Loss: {:.3e}", epoch, val);
            }

            let point = HistoryPoint {
                epoch,
                data: losses.data,
                residual: losses.residual,
                val,
            };
            history.points.push(point);
            on_record(&point)?;
        }

        Ok(())
    }

    pub fn predict(&self, r: &Array1<f64>) -> Result<Prediction, TchError> {
        let r_t = column(r, self.device);
        let (w, q, p) = tch::no_grad(|| self.net(&r_t));
        Ok(Prediction {
            r: r.to_vec(),
            w: to_vec(&w)?,
            q: to_vec(&q)?,
            p: to_vec(&p)?,
        })
    }

    pub fn predict_collocation(&self) -> Result<Prediction, TchError> {
        let r = Array1::from(to_vec(&self.coll_r.detach())?);
        self.predict(&r)
    }

    /// Writes `w.ot`, `q.ot` and `p.ot` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), TchError> {
        for net in [&self.w_net, &self.q_net, &self.p_net] {
            net.save(dir)?;
            debug!(net = net.name(), dir = %dir.display(), "saved weights");
        }
        Ok(())
    }

    pub fn load(&mut self, dir: &Path) -> Result<(), TchError> {
        for net in self.nets_mut() {
            net.load(dir)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn parameters(&self) -> Vec<Tensor> {
        [&self.w_net, &self.q_net, &self.p_net]
            .iter()
            .flat_map(|net| net.trainable_variables())
            .collect()
    }
}
