//! Command-line front end for plate-solve assisted gotos.
//!
//! Device-facing subcommands run against the built-in simulators; the
//! solve-file subcommand works on any image already on disk.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use tokio::sync::Mutex;

use skygoto::config::Settings;
use skygoto::devices::{
    CameraDevice, MountDevice, SimulatorCamera, SimulatorMount,
};
use skygoto::dispatch::{Dispatcher, SolverChoice};
use skygoto::goto_engine::{
    ConvergenceOutcome, ConvergenceTarget, FailureReason, GotoEngine,
    LogStatusSink,
};
use skygoto::position::{parse_dec, parse_ra, PositionJ2000};

#[derive(Parser)]
#[command(about = "Plate-solve assisted precision goto")]
struct Args {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(long, default_value = "skygoto.json")]
    settings: PathBuf,

    /// Override the configured solver backend.
    #[arg(long)]
    solver: Option<SolverChoice>,

    /// Initial simulated mount RA ("HH:MM:SS" or degrees).
    #[arg(long, default_value = "00:00:00")]
    mount_ra: String,

    /// Initial simulated mount Dec ("+DD:MM:SS" or degrees).
    #[arg(long, default_value = "+45:00:00")]
    mount_dec: String,

    /// Canned image the simulated camera delivers.
    #[arg(long, default_value = "sim.fits")]
    sim_image: PathBuf,

    /// Simulated sensor size, unbinned pixels.
    #[arg(long, default_value_t = 4000)]
    sensor_width: u32,
    #[arg(long, default_value_t = 3000)]
    sensor_height: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plate solve an image already on disk.
    SolveFile {
        image: PathBuf,
        /// Estimated center RA ("HH:MM:SS" or degrees).
        #[arg(long)]
        ra: String,
        /// Estimated center Dec ("+DD:MM:SS" or degrees).
        #[arg(long)]
        dec: String,
        /// Image width/height in binned pixels.
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        /// Binning the image was taken with.
        #[arg(long, default_value_t = 1)]
        binning: u32,
        /// Also write the solution summary as JSON to this path.
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
    /// Expose with the camera and solve at the current mount position.
    SolveImage,
    /// Expose, solve, and sync the mount to the solved position.
    Sync,
    /// Slew the mount to a target, no solving.
    Goto {
        #[arg(long)]
        ra: String,
        #[arg(long)]
        dec: String,
    },
    /// Closed-loop goto: slew, solve, sync, correct until within tolerance.
    PreciseGoto {
        #[arg(long)]
        ra: String,
        #[arg(long)]
        dec: String,
        /// Override the configured tolerance, arcseconds.
        #[arg(long)]
        tolerance: Option<f64>,
        /// Override the configured iteration limit.
        #[arg(long)]
        max_tries: Option<u32>,
    },
}

fn parse_target(ra: &str, dec: &str)
                -> Result<PositionJ2000, Box<dyn std::error::Error>> {
    Ok(PositionJ2000::new(parse_ra(ra)?, parse_dec(dec)?)?)
}

fn build_engine(args: &Args, settings: &Settings)
                -> Result<GotoEngine, Box<dyn std::error::Error>> {
    let mount_target = parse_target(&args.mount_ra, &args.mount_dec)?;
    let mount: Box<dyn MountDevice + Send> = Box::new(
        SimulatorMount::new(mount_target.ra_deg(), mount_target.dec_deg()));
    let camera: Box<dyn CameraDevice + Send> = Box::new(
        SimulatorCamera::new(args.sim_image.clone(), args.sensor_width,
                             args.sensor_height));
    // One flag shared by the engine and the solver backends.
    let cancel = Arc::new(std::sync::Mutex::new(false));
    Ok(GotoEngine::new(
        Arc::new(Mutex::new(camera)),
        Arc::new(Mutex::new(mount)),
        Dispatcher::from_settings_with_cancel(settings, cancel.clone()),
        settings.clone(),
        Arc::new(LogStatusSink),
    )
    .with_cancel_flag(cancel))
}

fn report_failure(reason: &FailureReason) {
    match reason {
        FailureReason::NoSolution =>
            error!("No astrometric solution found"),
        FailureReason::SolveTimeout =>
            error!("Plate solve timed out"),
        FailureReason::SolverUnavailable(detail) =>
            error!("Solver unavailable: {}", detail),
        FailureReason::NotConverged { last_separation_deg } =>
            error!("Did not converge; last miss was {:.1} arcsec",
                   last_separation_deg * 3600.0),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings::load(&args.settings)?;
    if let Some(solver) = args.solver {
        settings.solver = solver;
    }

    match &args.command {
        Command::SolveFile { image, ra, dec, width, height, binning,
                             json_out } => {
            let center = parse_target(ra, dec)?;
            let dispatcher = Dispatcher::from_settings(&settings);
            let request = dispatcher.build_request(
                image.clone(), center, *width, *height, *binning, *binning);
            let solution = dispatcher.solve(&request).await?;
            println!("{}", solution.summary_json());
            if let Some(path) = json_out {
                tokio::fs::write(path, solution.summary_json()).await?;
                info!("Wrote solution summary to {}", path.display());
            }
        }
        Command::SolveImage => {
            let engine = build_engine(&args, &settings)?;
            match engine.solve_here().await? {
                Ok(solution) => println!("{}", solution.summary_json()),
                Err(reason) => {
                    report_failure(&reason);
                    std::process::exit(1);
                }
            }
        }
        Command::Sync => {
            let engine = build_engine(&args, &settings)?;
            match engine.solve_here().await? {
                Ok(solution) => {
                    if engine.sync_to_solution(&solution).await? {
                        info!("Mount synced to {}", solution.position);
                    } else {
                        std::process::exit(1);
                    }
                }
                Err(reason) => {
                    report_failure(&reason);
                    std::process::exit(1);
                }
            }
        }
        Command::Goto { ra, dec } => {
            let engine = build_engine(&args, &settings)?;
            let target = parse_target(ra, dec)?;
            engine.goto(&target).await?;
            info!("Slew to {} complete", target);
        }
        Command::PreciseGoto { ra, dec, tolerance, max_tries } => {
            let engine = build_engine(&args, &settings)?;
            let mut request = ConvergenceTarget::from_settings(
                parse_target(ra, dec)?, &settings);
            if let Some(tolerance) = tolerance {
                request.tolerance_arcsec = *tolerance;
            }
            if let Some(max_tries) = max_tries {
                request.max_tries = *max_tries;
            }
            match engine.precise_goto(&request).await? {
                ConvergenceOutcome::Converged { tries,
                                                separation_arcsec } => {
                    info!("Converged after {} tries, {:.1} arcsec from \
                           target", tries, separation_arcsec);
                }
                ConvergenceOutcome::Failed(reason) => {
                    report_failure(&reason);
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
