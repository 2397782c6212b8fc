use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod dataset;
mod db;
mod models;
mod network;
mod pinn;
mod residual;
mod schema;
mod visualization;

use config::{default_layers, Activation, Normalization, PlateConstants, TrainConfig};
use dataset::{PreparedData, Splits};
use models::{NewTrainingRun, PredictionPoint, RunStatus};
use pinn::{HistoryPoint, Prediction, TrainingHistory, WaferPinn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DataArgs {
    /// NumPy file holding the CMP profiles
    #[arg(short, long, default_value = "data/cmp_Y.npy")]
    data: PathBuf,
    /// Profile index along the first axis of a 3-D file
    #[arg(long, default_value_t = 1)]
    sample: usize,
    #[arg(long, default_value_t = 1500)]
    num_points: usize,
    #[arg(long, default_value_t = 0.8)]
    train_fraction: f64,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct NetArgs {
    #[arg(long, default_value_t = 12)]
    hidden_layers: usize,
    #[arg(long, default_value_t = 50)]
    width: i64,
    #[arg(long, value_enum, default_value_t = Activation::Tanh)]
    activation: Activation,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the PINN and save losses, predictions and plots
    Train {
        #[arg(long, default_value = "Wafer PINN")]
        description: String,
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        net: NetArgs,
        #[arg(short, long, default_value_t = 20000)]
        epochs: usize,
        #[arg(long, default_value_t = 1e-5)]
        learning_rate: f64,
        #[arg(long, default_value_t = 20)]
        log_every: usize,
        #[arg(long, default_value_t = 100)]
        validate_every: usize,
        #[arg(short, long, default_value = "runs")]
        output_dir: PathBuf,
        /// Directory to write the trained weights into
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Skip the Postgres run ledger
        #[arg(long)]
        no_record: bool,
    },
    /// List all recorded training runs
    List,
    /// Regenerate the plots of a recorded run
    Query {
        #[arg(short, long)]
        id: i32,
        #[arg(short, long, default_value = "runs")]
        output_dir: PathBuf,
    },
    /// Evaluate saved weights against a profile without training
    Predict {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        net: NetArgs,
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(short, long, default_value = "runs")]
        output_dir: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            description,
            data,
            net,
            epochs,
            learning_rate,
            log_every,
            validate_every,
            output_dir,
            checkpoint,
            no_record,
        } => {
            let config = TrainConfig {
                layers: default_layers(net.hidden_layers, net.width),
                activation: net.activation,
                learning_rate,
                epochs,
                log_every,
                validate_every,
                num_points: data.num_points,
                train_fraction: data.train_fraction,
                seed: data.seed,
                ..TrainConfig::default()
            };
            train(&description, &data, &config, &output_dir, checkpoint.as_deref(), !no_record)?;
        }
        Commands::List => {
            let pool = db::establish_connection_pool()?;
            db::list_training_runs(&pool)?;
        }
        Commands::Query { id, output_dir } => {
            info!("Querying results for run ID: {}", id);
            let pool = db::establish_connection_pool()?;
            let run = db::get_training_run(&pool, id)?;
            info!(
                "Run {} ({}) trained {} epochs on {}",
                run.id, run.description, run.epochs, run.data_path
            );

            fs::create_dir_all(&output_dir)?;
            let points = db::get_predictions(&pool, id)?;
            let r: Vec<f64> = points.iter().map(|p| p.r).collect();
            let p: Vec<f64> = points.iter().map(|p| p.p).collect();
            let target: Vec<f64> = points.iter().map(|p| p.p_target).collect();
            let out = output_dir.join(format!("queried_run_{id}_pressure.png"));
            visualization::draw_pressure_comparison(&r, &p, &target, &path_str(&out)?)?;

            let history = db::get_loss_history(&pool, id)?;
            if history.is_empty() {
                warn!("Run {} has no recorded losses", id);
            } else {
                let out = output_dir.join(format!("queried_run_{id}_losses.png"));
                visualization::draw_loss_history(&history, &path_str(&out)?)?;
            }
        }
        Commands::Predict {
            data,
            net,
            checkpoint,
            output_dir,
        } => {
            let config = TrainConfig {
                layers: default_layers(net.hidden_layers, net.width),
                activation: net.activation,
                num_points: data.num_points,
                train_fraction: data.train_fraction,
                seed: data.seed,
                ..TrainConfig::default()
            };
            let (prepared, splits) = load_splits(&data, &config)?;
            let rigidity = PlateConstants::default().flexural_rigidity();
            let mut model = WaferPinn::new(&splits, rigidity, &config, Device::cuda_if_available())?;
            model.load(&checkpoint)?;
            info!("Loaded weights from {}", checkpoint.display());

            info!("Val Data Loss: {:.3e}", model.validate());
            let points = physical_points(0, &model.predict_collocation()?, &prepared, &splits);
            fs::create_dir_all(&output_dir)?;
            draw_points(&points, &output_dir.join("predicted_pressure.png"))?;
        }
    }

    Ok(())
}

fn load_splits(args: &DataArgs, config: &TrainConfig) -> Result<(PreparedData, Splits)> {
    let profile = dataset::load_profile(&args.data, args.sample)
        .with_context(|| format!("loading profile {} of {}", args.sample, args.data.display()))?;
    let prepared = profile.prepare(&Normalization::default())?;
    info!(
        "Loaded {} radial points from {}",
        prepared.len(),
        args.data.display()
    );

    let mut rng = match config.seed {
        Some(seed) => {
            tch::manual_seed(seed as i64);
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };
    let splits = prepared.split(config.num_points, config.train_fraction, &mut rng)?;
    Ok((prepared, splits))
}

fn train(
    description: &str,
    args: &DataArgs,
    config: &TrainConfig,
    output_dir: &Path,
    checkpoint: Option<&Path>,
    record: bool,
) -> Result<()> {
    config.validate()?;
    let (prepared, splits) = load_splits(args, config)?;
    let rigidity = PlateConstants::default().flexural_rigidity();
    let device = Device::cuda_if_available();
    info!(
        "Training on {:?}: {} train, {} val, {} collocation points, K = {:.4}",
        device,
        splits.train.len(),
        splits.val.len(),
        splits.collocation.len(),
        rigidity
    );

    // 1. Create a record for this training run
    let ledger = if record {
        let pool = db::establish_connection_pool()?;
        let data_path = args.data.to_string_lossy();
        let run = db::create_training_run(
            &pool,
            &NewTrainingRun {
                description,
                data_path: &data_path,
                epochs: i32::try_from(config.epochs)?,
                learning_rate: config.learning_rate,
                num_points: i32::try_from(config.num_points)?,
                flexural_rigidity: rigidity,
            },
        )?;
        info!("Created training run with ID: {}", run.id);
        Some((pool, run.id))
    } else {
        None
    };
    let run_id = ledger.as_ref().map_or(0, |(_, id)| *id);
    let prefix = match &ledger {
        Some((_, id)) => format!("run_{id}_"),
        None => String::new(),
    };

    // 2. Train, streaming the loss log to CSV
    fs::create_dir_all(output_dir)?;
    let log_path = output_dir.join(format!("{prefix}training_log.csv"));
    let mut log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("Unable to create {}", log_path.display()))?;
    write_log_header(&mut log_file)?;

    let mut model = WaferPinn::new(&splits, rigidity, config, device)?;
    let mut history = TrainingHistory::default();
    let outcome = model.run(config.epochs, &mut history, |p| write_log_row(&mut log_file, p));

    // A failed run still keeps whatever it recorded before stopping.
    let status = RunStatus::from_outcome(&outcome);
    if let Some((pool, id)) = &ledger {
        db::save_training_history(pool, *id, &history, status)?;
    }
    if let Err(err) = outcome {
        warn!("Training stopped after {} recorded points", history.points.len());
        return Err(err.into());
    }

    if let Some(dir) = checkpoint {
        fs::create_dir_all(dir)?;
        model.save(dir)?;
        info!("Saved weights to {}", dir.display());
    }

    // 3. Save the results to the database
    let points = physical_points(run_id, &model.predict_collocation()?, &prepared, &splits);
    if let Some((pool, _)) = &ledger {
        info!("Saving results to database...");
        db::save_predictions(pool, &points)?;
        info!("Results saved successfully.");
    }

    // 4. Generate the plots
    draw_points(&points, &output_dir.join(format!("{prefix}pressure.png")))?;
    visualization::draw_loss_history(
        &history.points,
        &path_str(&output_dir.join(format!("{prefix}losses.png")))?,
    )?;
    Ok(())
}

fn write_log_header<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "epoch,data_loss,residual_loss,val_loss")
}

// Rows without a validation pass leave `val_loss` empty.
fn write_log_row<W: Write>(out: &mut W, p: &HistoryPoint) -> std::io::Result<()> {
    let val = p.val.map(|v| format!("{v:.6e}")).unwrap_or_default();
    writeln!(out, "{},{:.6e},{:.6e},{}", p.epoch, p.data, p.residual, val)
}

/// Takes a collocation prediction back to physical units, radius offset
/// included.
fn physical_points(
    run_id: i32,
    pred: &Prediction,
    data: &PreparedData,
    splits: &Splits,
) -> Vec<PredictionPoint> {
    (0..pred.r.len())
        .map(|i| PredictionPoint {
            run_id,
            r: data.physical_radius(pred.r[i]),
            w: pred.w[i] * data.deflection_scale,
            q: pred.q[i] * data.pressure_scale,
            p: pred.p[i] * data.pressure_scale,
            p_target: splits.collocation.p[i] * data.pressure_scale,
        })
        .collect()
}

fn draw_points(points: &[PredictionPoint], out: &Path) -> Result<()> {
    let r: Vec<f64> = points.iter().map(|p| p.r).collect();
    let p: Vec<f64> = points.iter().map(|p| p.p).collect();
    let target: Vec<f64> = points.iter().map(|p| p.p_target).collect();
    visualization::draw_pressure_comparison(&r, &p, &target, &path_str(out)?)
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .with_context(|| format!("non UTF-8 output path {}", path.display()))
}
