//! Adapter for PlateSolve2 (a Windows binary, usually run under wine).
//!
//! PlateSolve2 takes its whole parameter set as one comma-joined argument
//! (all angles in radians) and writes an `.apm` file next to the image:
//! line 1 is `ra,dec,code`, line 2 is `scale,angle,...`, line 3 reads
//! `Valid plate solution` on success.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::config::PlateSolve2Config;
use crate::solver::{
    check_pixel_scale, normalize_roll, parse_float_field, remove_stale_output,
    run_engine, solved_position, PlateSolver, Solution, SolveError,
    SolveRequest,
};

pub struct PlateSolve2Solver {
    exec_path: PathBuf,
    regions: u32,
    timeout: Duration,
}

impl PlateSolve2Solver {
    pub fn new(config: &PlateSolve2Config) -> Self {
        PlateSolve2Solver {
            exec_path: config.exec_path.clone(),
            regions: config.regions,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl PlateSolver for PlateSolve2Solver {
    async fn solve(&self, request: &SolveRequest)
                   -> Result<Solution, SolveError> {
        let apm_path = request.image.with_extension("apm");
        remove_stale_output(&apm_path);

        // Trailing 0 tells PlateSolve2 to exit without waiting for a
        // keypress.
        let arg = format!(
            "{},{},{},{},{},{},0",
            request.estimated_center.ra_deg().to_radians(),
            request.estimated_center.dec_deg().to_radians(),
            request.fov_x_deg.to_radians(),
            request.fov_y_deg.to_radians(),
            self.regions,
            request.image.display());

        let mut command = Command::new(&self.exec_path);
        command.arg(&arg);
        let output = run_engine(command, self.timeout, "platesolve2").await?;
        debug!("platesolve2 exited with {:?}", output.status);

        let apm_text = match std::fs::read_to_string(&apm_path) {
            Ok(text) => text,
            Err(_) => {
                info!("platesolve2 produced no .apm file; no solution");
                return Err(SolveError::NoSolution);
            }
        };

        let mut solution = parse_apm(&apm_text)?;
        solution.binning = request.bin_x;
        Ok(solution)
    }

    fn name(&self) -> &'static str {
        "platesolve2"
    }
}

fn parse_apm(text: &str) -> Result<Solution, SolveError> {
    let mut lines = text.lines();
    let coords_line = lines.next()
        .ok_or_else(|| SolveError::parse("empty .apm file", text))?;
    let scale_line = lines.next()
        .ok_or_else(|| SolveError::parse(".apm missing scale line", text))?;
    let status_line = lines.next().unwrap_or("").trim();

    if status_line != "Valid plate solution" {
        return Err(SolveError::NoSolution);
    }

    let coords: Vec<&str> = coords_line.split(',').collect();
    if coords.len() < 2 {
        return Err(SolveError::parse("malformed coordinates line", text));
    }
    let ra_rad = parse_float_field(coords[0], "RA", text)?;
    let dec_rad = parse_float_field(coords[1], "Dec", text)?;

    let scale_fields: Vec<&str> = scale_line.split(',').collect();
    if scale_fields.len() < 2 {
        return Err(SolveError::parse("malformed scale line", text));
    }
    let pixel_scale =
        check_pixel_scale(parse_float_field(scale_fields[0], "pixel scale",
                                            text)?,
                          text)?;
    let angle = parse_float_field(scale_fields[1], "rotation angle", text)?;

    Ok(Solution {
        position: solved_position(ra_rad.to_degrees(), dec_rad.to_degrees(),
                                  text)?,
        pixel_scale,
        roll_angle: normalize_roll(angle),
        binning: 1,
    })
}
