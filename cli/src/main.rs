//! `fwdtrack` CLI: scenario runs, replay refits, plane dumps.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fwd_core::calibration::{NominalGeometry, SurveyTables};
use fwd_core::diagnostics::{FitObserver, HistogramObserver, NoopObserver};
use fwd_core::field::build_field;
use fwd_core::{Event, EventFitter, PlaneRegistry, TrackerConfig};
use sim::replay::{load_replay, save_replay, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use sim::{FitPerformance, SimulatedEvent};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(name = "fwdtrack", about = "Forward track fitting CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a named scenario, fit it and report performance.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Number of events (defaults to the scenario's own)
        #[arg(long)]
        events: Option<u64>,
        /// Tracker configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Survey tables (JSON); identity alignment if omitted
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Output summary to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the generated events
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Refit a previously recorded scenario log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        calibration: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the resolved plane poses as JSON.
    Planes {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        calibration: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunScenario {
            scenario,
            seed,
            events,
            config,
            calibration,
            output,
            save_replay: save_path,
        } => {
            let mut scenario = Scenario::build(scenario, seed);
            if let Some(n) = events {
                scenario.n_events = n;
            }
            run_scenario(
                scenario,
                config.as_deref(),
                calibration.as_deref(),
                output.as_deref(),
                save_path.as_deref(),
            )?;
        }
        Commands::Replay {
            input,
            config,
            calibration,
            output,
        } => {
            let log = load_replay(&input).with_context(|| format!("loading {}", input.display()))?;
            println!(
                "Replaying '{}' ({} events)...",
                log.scenario.name,
                log.events.len()
            );
            let mut config = load_config(config.as_deref())?;
            log.scenario.apply_to(&mut config);
            let registry = load_registry(&config, calibration.as_deref())?;
            fit_and_report(&log.scenario, &log.events, &config, &registry, output.as_deref())?;
        }
        Commands::Planes { config, calibration } => {
            let config = load_config(config.as_deref())?;
            let registry = load_registry(&config, calibration.as_deref())?;
            let planes: Vec<_> = registry
                .iter()
                .map(|(key, pose)| {
                    let normal = pose.normal();
                    serde_json::json!({
                        "key": key.to_string(),
                        "origin": pose.origin.as_slice(),
                        "u": pose.u.as_slice(),
                        "v": pose.v.as_slice(),
                        "normal": normal.as_slice(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&planes)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    match path {
        Some(p) => Ok(TrackerConfig::from_file(p)?),
        None => Ok(TrackerConfig::default()),
    }
}

fn load_registry(config: &TrackerConfig, calibration: Option<&Path>) -> Result<PlaneRegistry> {
    let tables = match calibration {
        Some(p) => SurveyTables::from_file(p)?,
        None => SurveyTables::identity(),
    };
    let geometry = NominalGeometry {
        fst_z: config.geometry.fst_z.clone(),
        ftt_z: config.geometry.ftt_z.clone(),
    };
    let build = PlaneRegistry::build(&tables, &geometry, &config.geometry);
    for failure in &build.failures {
        warn!(%failure, "sensor left out of the registry");
    }
    Ok(build.registry)
}

fn run_scenario(
    scenario: Scenario,
    config_path: Option<&Path>,
    calibration: Option<&Path>,
    output_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    scenario.apply_to(&mut config);
    let registry = load_registry(&config, calibration)?;

    println!(
        "Running scenario '{}' (seed={}, events={})...",
        scenario.name, scenario.seed, scenario.n_events
    );
    let events = scenario.generate(&registry)?;

    fit_and_report(&scenario, &events, &config, &registry, output_path)?;

    if let Some(rpath) = replay_path {
        let log = ReplayLog { scenario, events };
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }

    Ok(())
}

fn fit_and_report(
    scenario: &Scenario,
    events: &[SimulatedEvent],
    config: &TrackerConfig,
    registry: &PlaneRegistry,
    output_path: Option<&Path>,
) -> Result<()> {
    let histograms = HistogramObserver::new();
    let observer: &dyn FitObserver = if config.generate_histograms {
        &histograms
    } else {
        &NoopObserver
    };
    let field = build_field(&config.field)?;
    let pipeline = EventFitter::new(registry, config, field, observer);

    let start = std::time::Instant::now();
    let detector_events: Vec<Event> = events.iter().map(|e| e.event.clone()).collect();
    let (outputs, stats) = pipeline.process_events(&detector_events);
    let elapsed = start.elapsed();

    let mut performance = FitPerformance::default();
    for (sim, out) in events.iter().zip(&outputs) {
        performance.accumulate(&sim.truth, &out.fits);
    }
    let fit_us: u64 = outputs.iter().map(|o| o.timing_fit_us).sum();
    let refine_us: u64 = outputs.iter().map(|o| o.timing_refine_us).sum();

    println!(
        "Done: {} candidates, {} converged, {} refined, elapsed={:.2}s",
        stats.total,
        stats.converged,
        stats.refined_converged,
        elapsed.as_secs_f64(),
    );
    println!(
        "Efficiency {:.3}, charge purity {:.3}, pT bias {:+.4}, pT resolution {:.4}",
        performance.efficiency(),
        performance.charge_purity(),
        performance.pt_bias(),
        performance.pt_resolution(),
    );

    if let Some(opath) = output_path {
        let tracks: Vec<_> = outputs.iter().flat_map(|o| o.summaries()).collect();
        let json = serde_json::json!({
            "scenario": scenario.name,
            "seed": scenario.seed,
            "elapsed_s": elapsed.as_secs_f64(),
            "timing_fit_us": fit_us,
            "timing_refine_us": refine_us,
            "stats": stats,
            "performance": {
                "counts": performance,
                "efficiency": performance.efficiency(),
                "charge_purity": performance.charge_purity(),
                "pt_bias": performance.pt_bias(),
                "pt_resolution": performance.pt_resolution(),
            },
            "histograms": histograms.snapshot(),
            "tracks": tracks,
        });
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
        println!("Summary saved to {}", opath.display());
    }

    Ok(())
}
