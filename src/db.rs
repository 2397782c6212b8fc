use anyhow::{Context, Result};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use dotenvy::dotenv;
use std::env;
use tracing::info;

use crate::models::{
    LossRecord, NewLossRecord, NewTrainingRun, PredictionPoint, RunStatus, TrainingRun,
};
use crate::pinn::{HistoryPoint, TrainingHistory};
use crate::schema::{loss_records, prediction_points, training_runs};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK: usize = 5000;

pub fn establish_connection_pool() -> Result<DbPool> {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    r2d2::Pool::builder()
        .build(manager)
        .context("Failed to create pool")
}

pub fn create_training_run(pool: &DbPool, new_run: &NewTrainingRun) -> Result<TrainingRun> {
    let mut conn = pool.get()?;
    let run = diesel::insert_into(training_runs::table)
        .values(new_run)
        .returning(TrainingRun::as_returning())
        .get_result(&mut conn)?;
    Ok(run)
}

/// Stores the loss history, stamps the run with its final losses and
/// moves it to `status`. A failed run keeps its partial history.
pub fn save_training_history(
    pool: &DbPool,
    run_id: i32,
    history: &TrainingHistory,
    status: RunStatus,
) -> Result<()> {
    let mut conn = pool.get()?;
    let records = history
        .points
        .iter()
        .map(|point| NewLossRecord::from_point(run_id, point))
        .collect::<Result<Vec<_>, _>>()?;

    conn.transaction(|conn| {
        for chunk in records.chunks(INSERT_CHUNK) {
            diesel::insert_into(loss_records::table)
                .values(chunk)
                .execute(conn)?;
        }

        let last = history.last();
        diesel::update(training_runs::table.find(run_id))
            .set((
                training_runs::final_data_loss.eq(last.map(|p| p.data)),
                training_runs::final_residual_loss.eq(last.map(|p| p.residual)),
                training_runs::final_val_loss.eq(history.last_val()),
                training_runs::status.eq(status.as_str()),
            ))
            .execute(conn)?;
        Ok::<_, diesel::result::Error>(())
    })?;

    info!(run_id, records = records.len(), status = status.as_str(), "saved loss history");
    Ok(())
}

pub fn save_predictions(pool: &DbPool, points: &[PredictionPoint]) -> Result<()> {
    let mut conn = pool.get()?;
    conn.transaction(|conn| {
        for chunk in points.chunks(INSERT_CHUNK) {
            diesel::insert_into(prediction_points::table)
                .values(chunk)
                .execute(conn)?;
        }
        Ok::<_, diesel::result::Error>(())
    })?;
    Ok(())
}

pub fn list_training_runs(pool: &DbPool) -> Result<()> {
    use crate::schema::training_runs::dsl::*;
    let mut conn = pool.get()?;
    let runs = training_runs
        .order(id.asc())
        .select(TrainingRun::as_select())
        .load(&mut conn)?;

    let fmt_loss = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3e}"));

    println!("--- Recorded Training Runs ---");
    println!(
        "{:<5} | {:<25} | {:<9} | {:<8} | {:<9} | {:<10} | {:<10} | {:<10} | {:<19}",
        "ID", "Description", "Status", "Epochs", "LR", "Data", "Residual", "Val", "Created"
    );
    println!("{}", "-".repeat(127));
    for run in runs {
        println!(
            "{:<5} | {:<25} | {:<9} | {:<8} | {:<9.1e} | {:<10} | {:<10} | {:<10} | {:<19}",
            run.id,
            run.description,
            run.status,
            run.epochs,
            run.learning_rate,
            fmt_loss(run.final_data_loss),
            fmt_loss(run.final_residual_loss),
            fmt_loss(run.final_val_loss),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub fn get_training_run(pool: &DbPool, run_id: i32) -> Result<TrainingRun> {
    let mut conn = pool.get()?;
    let run = training_runs::table
        .find(run_id)
        .select(TrainingRun::as_select())
        .first(&mut conn)
        .with_context(|| format!("no training run with id {run_id}"))?;
    Ok(run)
}

pub fn get_predictions(pool: &DbPool, run_id: i32) -> Result<Vec<PredictionPoint>> {
    let mut conn = pool.get()?;
    let points = prediction_points::table
        .filter(prediction_points::run_id.eq(run_id))
        .order(prediction_points::r.asc())
        .select(PredictionPoint::as_select())
        .load(&mut conn)?;
    Ok(points)
}

pub fn get_loss_history(pool: &DbPool, run_id: i32) -> Result<Vec<HistoryPoint>> {
    let mut conn = pool.get()?;
    let records = loss_records::table
        .filter(loss_records::run_id.eq(run_id))
        .order(loss_records::epoch.asc())
        .select(LossRecord::as_select())
        .load(&mut conn)?;
    Ok(records.into_iter().map(HistoryPoint::from).collect())
}
