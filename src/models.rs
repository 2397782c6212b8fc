use crate::pinn::{HistoryPoint, TrainError};
use crate::schema::{loss_records, prediction_points, training_runs};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use std::num::TryFromIntError;

/// Lifecycle of a ledger entry. New rows start as `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_outcome<T>(outcome: &Result<T, TrainError>) -> Self {
        match outcome {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        }
    }
}

#[derive(Queryable, Identifiable, Selectable, Debug)]
#[diesel(table_name = training_runs)]
pub struct TrainingRun {
    pub id: i32,
    pub description: String,
    pub data_path: String,
    pub epochs: i32,
    pub learning_rate: f64,
    pub num_points: i32,
    pub flexural_rigidity: f64,
    pub final_data_loss: Option<f64>,
    pub final_residual_loss: Option<f64>,
    pub final_val_loss: Option<f64>,
    pub status: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = training_runs)]
pub struct NewTrainingRun<'a> {
    pub description: &'a str,
    pub data_path: &'a str,
    pub epochs: i32,
    pub learning_rate: f64,
    pub num_points: i32,
    pub flexural_rigidity: f64,
}

#[derive(Queryable, Selectable, Debug, Clone, Copy, PartialEq)]
#[diesel(table_name = loss_records)]
pub struct LossRecord {
    pub epoch: i32,
    pub data_loss: f64,
    pub residual_loss: f64,
    pub val_loss: Option<f64>,
}

impl From<LossRecord> for HistoryPoint {
    fn from(rec: LossRecord) -> Self {
        HistoryPoint {
            epoch: rec.epoch.max(0) as usize,
            data: rec.data_loss,
            residual: rec.residual_loss,
            val: rec.val_loss,
        }
    }
}

#[derive(Insertable, Debug, PartialEq)]
#[diesel(table_name = loss_records)]
pub struct NewLossRecord {
    pub run_id: i32,
    pub epoch: i32,
    pub data_loss: f64,
    pub residual_loss: f64,
    pub val_loss: Option<f64>,
}

impl NewLossRecord {
    pub fn from_point(run_id: i32, point: &HistoryPoint) -> Result<Self, TryFromIntError> {
        Ok(NewLossRecord {
            run_id,
            epoch: i32::try_from(point.epoch)?,
            data_loss: point.data,
            residual_loss: point.residual,
            val_loss: point.val,
        })
    }
}

// One radial sample of the trained fields, in physical units.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = prediction_points)]
pub struct PredictionPoint {
    pub run_id: i32,
    pub r: f64,
    pub w: f64,
    #[diesel(column_name = q_)]
    pub q: f64,
    pub p: f64,
    pub p_target: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_records_round_trip_through_history_points() {
        let point = HistoryPoint {
            epoch: 100,
            data: 0.5,
            residual: 1e-3,
            val: Some(0.25),
        };
        let new = NewLossRecord::from_point(9, &point).unwrap();
        assert_eq!(new.run_id, 9);
        assert_eq!(new.epoch, 100);

        let stored = LossRecord {
            epoch: new.epoch,
            data_loss: new.data_loss,
            residual_loss: new.residual_loss,
            val_loss: new.val_loss,
        };
        assert_eq!(HistoryPoint::from(stored), point);
    }

    #[test]
    fn epochs_beyond_the_column_range_are_rejected() {
        let point = HistoryPoint {
            epoch: i32::MAX as usize + 1,
            data: 0.0,
            residual: 0.0,
            val: None,
        };
        assert!(NewLossRecord::from_point(1, &point).is_err());
    }

    #[test]
    fn failed_training_marks_the_run_failed() {
        let ok: Result<(), TrainError> = Ok(());
        assert_eq!(RunStatus::from_outcome(&ok), RunStatus::Completed);

        let diverged: Result<(), TrainError> = Err(TrainError::Diverged {
            epoch: 3,
            data: f64::NAN,
            residual: 0.0,
        });
        assert_eq!(RunStatus::from_outcome(&diverged), RunStatus::Failed);
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert_eq!(RunStatus::Running.as_str(), "running");
    }
}
