//! `immtrack` CLI: configuration checks, scenario runs, replay evaluation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imm_core::{DMat, EstimationMetrics, ImmEstimator, ModelSet};
use sim::replay::{load_replay, save_replay, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "immtrack", about = "IMM estimator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a model configuration, then print a summary.
    CheckConfig {
        /// Path to the JSON configuration
        config: PathBuf,
    },
    /// Simulate a named scenario and run the estimator over it.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Path to the JSON model configuration
        #[arg(long)]
        config: PathBuf,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Initial variance on every fused component
        #[arg(long, default_value_t = 100.0)]
        initial_variance: f64,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the recorded replay log
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Run the estimator over a previously recorded replay log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        /// Path to the JSON model configuration
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value_t = 100.0)]
        initial_variance: f64,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }
        Commands::RunScenario {
            scenario,
            config,
            seed,
            initial_variance,
            output,
            save_replay: save_path,
        } => {
            let models = load_models(&config)?;
            let scenario = Scenario::build(scenario, seed);
            println!(
                "Running scenario '{}' (seed={}, duration={:.0}s)...",
                scenario.name, seed, scenario.duration
            );
            let log = scenario.record()?;
            if let Some(rpath) = save_path {
                save_replay(&log, &rpath)?;
                println!("Replay saved to {}", rpath.display());
            }
            evaluate(&log, models, initial_variance, output.as_deref())?;
        }
        Commands::Replay {
            input,
            config,
            initial_variance,
            output,
        } => {
            let models = load_models(&config)?;
            let log = load_replay(&input).with_context(|| format!("reading {}", input.display()))?;
            println!("Replaying '{}' ({} frames)...", log.scenario_name, log.frames.len());
            evaluate(&log, models, initial_variance, output.as_deref())?;
        }
    }

    Ok(())
}

fn load_models(path: &Path) -> Result<Arc<ModelSet>> {
    let models = ModelSet::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(Arc::new(models))
}

fn check_config(path: &Path) -> Result<()> {
    let models = load_models(path)?;
    println!("Configuration OK: {}", path.display());
    println!("Fused state ({}): {}", models.fused_dim(), models.labels().join(", "));
    for (model, mu) in models.models().iter().zip(models.initial_probabilities().iter()) {
        println!(
            "  {:<12} {:?}  dim={} meas={} control={}  mu0={:.3}",
            model.name(),
            model.filter_type(),
            model.dim(),
            model.measurement_dim(),
            model.control_dim(),
            mu
        );
    }
    println!("Markov transition matrix:{}", models.transition());
    println!("Covariance expansion: {:?}", models.covariance_expansion());
    Ok(())
}

/// Run the estimator over every frame of `log`, starting at the first fix.
fn evaluate(
    log: &ReplayLog,
    models: Arc<ModelSet>,
    initial_variance: f64,
    output_path: Option<&Path>,
) -> Result<()> {
    anyhow::ensure!(
        initial_variance.is_finite() && initial_variance > 0.0,
        "initial variance must be positive"
    );
    let start_idx = log
        .frames
        .iter()
        .position(|f| f.fix.is_some())
        .context("replay log contains no position fix")?;
    let first = &log.frames[start_idx];
    let x0 = match &first.fix {
        Some(fix) => models.state_from_labels(&[("pos_x", fix.x), ("pos_y", fix.y)])?,
        None => anyhow::bail!("replay log contains no position fix"),
    };
    let p0 = DMat::identity(models.fused_dim(), models.fused_dim()) * initial_variance;

    let mut imm = ImmEstimator::new(Arc::clone(&models), x0, p0)?;
    let mut metrics = EstimationMetrics::from_labels(&models, &["pos_x", "pos_y"], &["vel_x", "vel_y"])?;
    let mut fallbacks = 0usize;
    let mut failures = 0usize;
    let mut missed = 0usize;
    let mut prev_time = first.time;

    let start = std::time::Instant::now();
    for frame in &log.frames[start_idx + 1..] {
        let dt = frame.time - prev_time;
        prev_time = frame.time;
        let meas = frame.measurement(&models)?;
        if meas.is_none() {
            missed += 1;
        }
        match imm.step(dt, meas.as_ref()) {
            Ok(out) => {
                if out.probability_fallback {
                    fallbacks += 1;
                }
                let truth = frame.fused_truth(&models)?;
                metrics.accumulate(&out.state, &out.covariance, &truth)?;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(time = frame.time, error = %e, "cycle failed");
            }
        }
    }
    let elapsed = start.elapsed();

    let mu: Vec<f64> = imm.mode_probabilities().iter().copied().collect();
    println!(
        "Done: {} cycles, {} missed fixes, {} fallbacks, {} failed, elapsed={:.3}s",
        imm.cycles(),
        missed,
        fallbacks,
        failures,
        elapsed.as_secs_f64(),
    );
    for (name, p) in models.model_names().zip(&mu) {
        println!("  mu[{name}] = {p:.4}");
    }
    println!(
        "Dominant model: {}  RMSE pos={:.3} vel={:.3}  NEES={:.3}",
        imm.dominant_model(),
        metrics.rmse_position(),
        metrics.rmse_velocity(),
        metrics.mean_nees(),
    );

    if let Some(opath) = output_path {
        let names: Vec<&str> = models.model_names().collect();
        let json = serde_json::json!({
            "scenario": log.scenario_name,
            "seed": log.seed,
            "elapsed_s": elapsed.as_secs_f64(),
            "cycles": imm.cycles(),
            "missed_fixes": missed,
            "probability_fallbacks": fallbacks,
            "failed_cycles": failures,
            "models": names,
            "final_mode_probabilities": mu,
            "dominant_model": imm.dominant_model(),
            "rmse_position": metrics.rmse_position(),
            "rmse_velocity": metrics.rmse_velocity(),
            "mean_nees": metrics.mean_nees(),
        });
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
        println!("Metrics saved to {}", opath.display());
    }

    Ok(())
}
