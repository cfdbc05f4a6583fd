mod align;
mod astro;
mod config;
mod devices;
mod image;
mod scheduler;
mod solver;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::align::{AlignEvent, AlignmentController, PolarAxis, PolarStage};
use crate::astro::{format_dec, format_ra, Clock, SystemClock};
use crate::config::{Config, SolverKind};
use crate::devices::sim::{self, SimHandles};
use crate::devices::Rig;
use crate::scheduler::{parser, JobList, Runner, SchedulerController, SchedulerEvent};
use crate::solver::{AstrometrySolver, PlateSolver, SimulatedSolver};

#[derive(Parser)]
#[command(name = "scope-o-mat")]
#[command(about = "Telescope alignment and observation scheduling")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a job list
    Validate {
        jobs: PathBuf,
        /// Print the jobs with windows fixed to now
        #[arg(long)]
        print: bool,
    },
    /// Run a job list on the simulated observatory
    Run {
        jobs: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Capture, solve and correct the pointing once
    Align {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured accuracy, in arcseconds
        #[arg(long)]
        accuracy: Option<f64>,
        /// Override the configured exposure, in seconds
        #[arg(long)]
        exposure: Option<f64>,
    },
    /// Plate-solve an image file
    Solve {
        image: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Slew to the solved centre and align there
        #[arg(long)]
        slew: bool,
    },
    /// Measure and correct polar alignment
    Polar {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "azimuth")]
        axis: String,
        /// Slew to the correction position after measuring
        #[arg(long)]
        correct: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Validate { .. } => None,
        Commands::Run { config, .. }
        | Commands::Align { config, .. }
        | Commands::Solve { config, .. }
        | Commands::Polar { config, .. } => match load_config(config.as_deref()) {
            Ok(c) => Some(c),
            Err(code) => return code,
        },
    };

    let debug = cli.verbose || config.as_ref().is_some_and(|c| c.align.verbose);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    let config = config.unwrap_or_default();
    match cli.command {
        Commands::Validate { jobs, print } => validate(&jobs, print),
        Commands::Run { jobs, .. } => run(&jobs, &config).await,
        Commands::Align {
            accuracy, exposure, ..
        } => align(&config, accuracy, exposure).await,
        Commands::Solve { image, slew, .. } => solve(&image, slew, &config).await,
        Commands::Polar { axis, correct, .. } => polar(&axis, correct, &config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ExitCode> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    Config::from_file(path).map_err(|e| {
        eprintln!("Error loading config {}: {}", path.display(), e);
        ExitCode::FAILURE
    })
}

fn read_jobs(path: &Path) -> Result<JobList, ExitCode> {
    let yaml = fs::read_to_string(path).map_err(|e| {
        eprintln!("Error reading file: {}", e);
        ExitCode::FAILURE
    })?;
    JobList::from_str(&yaml).map_err(|e| {
        eprintln!("Parse error: {}", e);
        ExitCode::FAILURE
    })
}

fn validate(path: &Path, print: bool) -> ExitCode {
    let list = match read_jobs(path) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let jobs = list.instantiate(chrono::Utc::now());

    if print {
        return match parser::to_yaml(&jobs) {
            Ok(yaml) => {
                print!("{}", yaml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error writing jobs: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    println!("Job list is valid ({} jobs)", jobs.len());
    for (i, job) in jobs.iter().enumerate() {
        let target = match job.coordinates() {
            Some(c) => format!("{} {}", format_ra(c.ra_hours()), format_dec(c.dec_degrees())),
            None => "from image".to_string(),
        };
        println!(
            "  {}: {} @ {} (priority {}, sequence {})",
            i + 1,
            job.name,
            target,
            job.priority,
            job.sequence.display()
        );
    }
    ExitCode::SUCCESS
}

/// Simulated rig and the configured solver, sharing one clock.
fn build_rig(config: &Config, clock: Arc<dyn Clock>) -> (Rig, SimHandles, Box<dyn PlateSolver>) {
    let (rig, handles) = sim::build(&config.simulation);
    let solver: Box<dyn PlateSolver> = match config.solver.kind {
        SolverKind::Sim => Box::new(SimulatedSolver::new(
            handles.mount.clone(),
            clock,
            config.simulation.solve_polls,
        )),
        SolverKind::Astrometry => Box::new(AstrometrySolver::new(config.solver.options.clone())),
    };
    log::info!("Using {} solver", config.solver.kind);
    (rig, handles, solver)
}

fn build_aligner(config: &Config) -> Result<(AlignmentController, Rig), ExitCode> {
    let align_config = config.align_config().map_err(|e| {
        eprintln!("Config error: {}", e);
        ExitCode::FAILURE
    })?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (rig, _, solver) = build_rig(config, clock.clone());
    Ok((AlignmentController::new(align_config, solver, clock), rig))
}

async fn run(path: &Path, config: &Config) -> ExitCode {
    let list = match read_jobs(path) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let (align, rig) = match build_aligner(config) {
        Ok(parts) => parts,
        Err(code) => return code,
    };
    let site = align.config().site;
    let start_time = chrono::Utc::now();
    let jobs = list.instantiate(start_time);
    println!("Starting {} jobs at {}", jobs.len(), start_time);

    let controller = SchedulerController::new(config.scheduler.clone(), site, jobs, align);
    let mut runner = match Runner::spawn(
        controller,
        rig,
        Arc::new(SystemClock),
        config.scheduler.poll_interval,
    ) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = runner.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            runner.stop().await;
        }
    }

    let mut code = ExitCode::SUCCESS;
    for event in runner.drain_events() {
        if let SchedulerEvent::JobEnded { job, state, reason } = event {
            match reason {
                Some(reason) => println!("  {}: {} ({})", job, state, reason),
                None => println!("  {}: {}", job, state),
            }
        }
    }
    for (name, state) in runner.status().jobs {
        if state != scheduler::JobState::Complete {
            log::warn!("{} did not complete ({})", name, state);
            code = ExitCode::FAILURE;
        }
    }
    code
}

/// Services the controller until `done` sees a final event.
async fn drive(
    align: &mut AlignmentController,
    rig: &mut Rig,
    mut done: impl FnMut(&AlignEvent) -> bool,
) -> Vec<AlignEvent> {
    let mut seen = Vec::new();
    loop {
        align.service(rig);
        let events = align.drain_events();
        let finished = events.iter().any(&mut done);
        seen.extend(events);
        if finished {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn finished(event: &AlignEvent) -> bool {
    matches!(
        event,
        AlignEvent::Completed { .. } | AlignEvent::Failed { .. } | AlignEvent::Aborted
    )
}

fn report(events: &[AlignEvent]) -> ExitCode {
    for event in events {
        match event {
            AlignEvent::Completed {
                task,
                solution,
                iterations,
            } => {
                log::info!("{} finished after {} iteration(s)", task, iterations);
                match serde_json::to_string_pretty(solution) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("Error printing solution: {}", e),
                }
                return ExitCode::SUCCESS;
            }
            AlignEvent::Failed { task, error } => {
                eprintln!("{} failed: {}", task, error);
                return ExitCode::FAILURE;
            }
            _ => {}
        }
    }
    ExitCode::FAILURE
}

async fn align(config: &Config, accuracy: Option<f64>, exposure: Option<f64>) -> ExitCode {
    let (mut align, mut rig) = match build_aligner(config) {
        Ok(parts) => parts,
        Err(code) => return code,
    };
    if accuracy.is_some() || exposure.is_some() {
        let mut updated = align.config().clone();
        if let Some(accuracy) = accuracy {
            updated.settings.accuracy_arcsec = accuracy;
        }
        if let Some(exposure) = exposure {
            updated.settings.exposure_s = exposure;
        }
        align.update_configuration(updated);
    }
    let request = align.default_request();
    if let Err(e) = align.start_capture(&mut rig, request) {
        eprintln!("Cannot start alignment: {}", e);
        return ExitCode::FAILURE;
    }
    let events = drive(&mut align, &mut rig, finished).await;
    report(&events)
}

async fn solve(image: &Path, slew: bool, config: &Config) -> ExitCode {
    let (mut align, mut rig) = match build_aligner(config) {
        Ok(parts) => parts,
        Err(code) => return code,
    };
    let started = if slew {
        align.load_and_slew(&mut rig, image)
    } else {
        align.solve_file(&mut rig, image)
    };
    if let Err(e) = started {
        eprintln!("Cannot solve {}: {}", image.display(), e);
        return ExitCode::FAILURE;
    }
    let events = drive(&mut align, &mut rig, finished).await;
    report(&events)
}

/// Confirms manual steps on the terminal.
fn ask(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

async fn polar(axis: &str, correct: bool, config: &Config) -> ExitCode {
    let axis = match axis {
        "azimuth" | "az" => PolarAxis::Azimuth,
        "altitude" | "alt" => PolarAxis::Altitude,
        other => {
            eprintln!("Unknown axis '{}', expected azimuth or altitude", other);
            return ExitCode::FAILURE;
        }
    };
    let (mut align, mut rig) = match build_aligner(config) {
        Ok(parts) => parts,
        Err(code) => return code,
    };

    let mut operator = ask;
    let started = match axis {
        PolarAxis::Azimuth => align.measure_azimuth_error(&mut rig, &mut operator),
        PolarAxis::Altitude => align.measure_altitude_error(&mut rig, &mut operator),
    };
    match started {
        Ok(true) => {}
        Ok(false) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Cannot measure {} error: {}", axis, e);
            return ExitCode::FAILURE;
        }
    }

    let events = drive(&mut align, &mut rig, |e| {
        matches!(e, AlignEvent::PolarError(_) | AlignEvent::Failed { .. })
    })
    .await;
    for event in &events {
        match event {
            AlignEvent::PolarError(error) => println!("{}", error.message),
            AlignEvent::Failed { error, .. } => {
                eprintln!("Measurement failed: {}", error);
                return ExitCode::FAILURE;
            }
            _ => {}
        }
    }
    if let Some(deviation) = align.polar_deviation(axis) {
        log::info!("{} deviation {:.4}°", axis, deviation);
    }

    if correct {
        let corrected = match axis {
            PolarAxis::Azimuth => align.correct_azimuth_error(&mut rig),
            PolarAxis::Altitude => align.correct_altitude_error(&mut rig),
        };
        if let Err(e) = corrected {
            eprintln!("Cannot correct {} error: {}", axis, e);
            return ExitCode::FAILURE;
        }
        while align.polar_stage(axis) == PolarStage::Correcting {
            align.on_mount_update(&mut rig);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for event in align.drain_events() {
            if let AlignEvent::Message(message) = event {
                println!("{}", message);
            }
        }
    }
    ExitCode::SUCCESS
}
