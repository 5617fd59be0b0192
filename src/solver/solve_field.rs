//! Adapter for astrometry.net's local `solve-field` binary.
//!
//! `solve-field` writes a family of output files next to the image; the only
//! one that matters here is the `.solved` marker (success flag). The solved
//! center, rotation, and pixel scale are scraped from stdout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::SolveFieldConfig;
use crate::position::PositionJ2000;
use crate::solver::{
    check_pixel_scale, normalize_roll, parse_float_field,
    remove_stale_output, run_engine, solved_position, PlateSolver, Solution,
    SolveError, SolveRequest,
};

pub struct SolveFieldSolver {
    exec_path: PathBuf,
    timeout: Duration,
}

impl SolveFieldSolver {
    pub fn new(config: &SolveFieldConfig) -> Self {
        SolveFieldSolver {
            exec_path: config.exec_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl PlateSolver for SolveFieldSolver {
    async fn solve(&self, request: &SolveRequest)
                   -> Result<Solution, SolveError> {
        let solved_path = request.image.with_extension("solved");
        remove_stale_output(&solved_path);

        let mut command = Command::new(&self.exec_path);
        command
            .arg("-O")
            .arg("--no-plots")
            .arg("--no-verify")
            .arg("--resort")
            .arg("--downsample")
            .arg(request.downsample.to_string())
            .arg("-3")
            .arg(request.estimated_center.ra_deg().to_string())
            .arg("-4")
            .arg(request.estimated_center.dec_deg().to_string())
            .arg("-5")
            .arg(request.search_radius_deg().to_string())
            .arg(&request.image);

        let output = run_engine(command, self.timeout, "solve-field").await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("solve-field stdout:\n{}", stdout);

        // The marker file is the authoritative success signal; stdout alone
        // is not trusted.
        if !solved_path.exists() {
            info!("solve-field left no .solved marker; no solution");
            return Err(SolveError::NoSolution);
        }

        let parsed = parse_stdout(&stdout)?;
        let pixel_scale = match parsed.pixel_scale {
            Some(scale) => scale,
            None => {
                let scale = fallback_pixel_scale(request);
                warn!("solve-field reported no pixel scale; using {} \
                       arcsec/px", scale);
                scale
            }
        };
        Ok(Solution {
            position: parsed.position,
            pixel_scale,
            roll_angle: parsed.roll_angle,
            binning: request.bin_x,
        })
    }

    fn name(&self) -> &'static str {
        "solve-field"
    }
}

fn fallback_pixel_scale(request: &SolveRequest) -> f64 {
    match request.pixel_scale_hint {
        Some(hint) => hint,
        None => request.fov_x_deg * 3600.0 / request.width as f64,
    }
}

/// What solve-field's stdout yields. The pixel scale line is absent with
/// some index configurations, so it stays optional here and the caller
/// supplies a fallback.
struct ParsedSolve {
    position: PositionJ2000,
    roll_angle: f64,
    pixel_scale: Option<f64>,
}

fn parse_stdout(stdout: &str) -> Result<ParsedSolve, SolveError> {
    let mut center: Option<(f64, f64)> = None;
    let mut roll: Option<f64> = None;
    let mut pixel_scale = None;

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Field center: (RA,Dec) = (") {
            let coords = rest.split(')').next().unwrap_or("");
            let mut parts = coords.split(',');
            let ra_text = parts.next()
                .ok_or_else(|| SolveError::parse("malformed field center",
                                                 stdout))?;
            let dec_text = parts.next()
                .ok_or_else(|| SolveError::parse("malformed field center",
                                                 stdout))?;
            center = Some((
                parse_float_field(ra_text, "field center RA", stdout)?,
                parse_float_field(dec_text, "field center Dec", stdout)?,
            ));
        } else if let Some(rest) =
            line.strip_prefix("Field rotation angle: up is ")
        {
            let angle_text = rest.split_whitespace().next()
                .ok_or_else(|| SolveError::parse("malformed rotation line",
                                                 stdout))?;
            let mut angle = parse_float_field(
                angle_text, "rotation angle", stdout)?;
            if rest.contains("W of N") {
                angle = -angle;
            }
            roll = Some(normalize_roll(angle));
        } else if line.starts_with("pixel scale ") {
            let scale_text = line
                .trim_start_matches("pixel scale ")
                .split_whitespace()
                .next()
                .ok_or_else(|| SolveError::parse("malformed pixel scale",
                                                 stdout))?;
            pixel_scale = Some(check_pixel_scale(
                parse_float_field(scale_text, "pixel scale", stdout)?,
                stdout)?);
        }
    }

    let (ra_deg, dec_deg) = center.ok_or_else(|| {
        SolveError::parse("no field center in output", stdout)
    })?;
    let roll = roll.ok_or_else(|| {
        SolveError::parse("no rotation angle in output", stdout)
    })?;

    Ok(ParsedSolve {
        position: solved_position(ra_deg, dec_deg, stdout)?,
        roll_angle: roll,
        pixel_scale,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::position::PositionJ2000;

    const SOLVED_STDOUT: &str = "\
Reading input file 1 of 1: \"m31.fits\"...
Solving...
Field: m31.fits
Field center: (RA,Dec) = (10.684793, 41.268903) deg.
Field center: (RA H:M:S, Dec D:M:S) = (00:42:44.350, +41:16:08.050).
Field size: 1.27773 x 0.957253 degrees
Field rotation angle: up is 1.76056 degrees E of N
Field parity: pos
pixel scale 1.15035 arcsec/pix
";

    #[test]
    fn test_parse_solved_stdout() {
        let parsed = parse_stdout(SOLVED_STDOUT).unwrap();
        assert_abs_diff_eq!(parsed.position.ra_deg(), 10.684793,
                            epsilon = 1e-9);
        assert_abs_diff_eq!(parsed.position.dec_deg(), 41.268903,
                            epsilon = 1e-9);
        assert_abs_diff_eq!(parsed.roll_angle, 1.76056, epsilon = 1e-9);
        assert_abs_diff_eq!(parsed.pixel_scale.unwrap(), 1.15035,
                            epsilon = 1e-9);
    }

    #[test]
    fn test_parse_west_of_north_rotation() {
        let stdout = "\
Field center: (RA,Dec) = (10.0, 41.0) deg.
Field rotation angle: up is 2.5 degrees W of N
";
        let parsed = parse_stdout(stdout).unwrap();
        assert_abs_diff_eq!(parsed.roll_angle, -2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_parse_missing_pixel_scale() {
        let stdout = "\
Field center: (RA,Dec) = (10.0, 41.0) deg.
Field rotation angle: up is 1.0 degrees E of N
";
        let parsed = parse_stdout(stdout).unwrap();
        assert!(parsed.pixel_scale.is_none());
    }

    #[test]
    fn test_parse_missing_center_fails() {
        let stdout = "Solving...\nDid not solve.\n";
        assert!(matches!(parse_stdout(stdout),
                         Err(SolveError::ParseFailure { .. })));
    }

    #[test]
    fn test_fallback_pixel_scale() {
        let mut request = SolveRequest {
            image: "/tmp/x.fits".into(),
            estimated_center: PositionJ2000::new(10.0, 41.0).unwrap(),
            fov_x_deg: 2.0,
            fov_y_deg: 1.5,
            width: 4000,
            height: 3000,
            pixel_scale_hint: Some(0.9),
            search_radius_deg: None,
            downsample: 2,
            bin_x: 1,
            bin_y: 1,
        };
        assert_abs_diff_eq!(fallback_pixel_scale(&request), 0.9,
                            epsilon = 1e-12);
        request.pixel_scale_hint = None;
        // 2 deg over 4000 px is 1.8 arcsec/px.
        assert_abs_diff_eq!(fallback_pixel_scale(&request), 1.8,
                            epsilon = 1e-12);
    }

    #[tokio::test]
    async fn test_missing_executable_is_engine_unavailable() {
        let solver = SolveFieldSolver::new(&SolveFieldConfig {
            exec_path: "/nonexistent/solve-field".into(),
            timeout_secs: 5,
        });
        let request = SolveRequest {
            image: "/tmp/no_such_image.fits".into(),
            estimated_center: PositionJ2000::new(10.0, 41.0).unwrap(),
            fov_x_deg: 2.0,
            fov_y_deg: 1.5,
            width: 4000,
            height: 3000,
            pixel_scale_hint: None,
            search_radius_deg: None,
            downsample: 2,
            bin_x: 1,
            bin_y: 1,
        };
        assert!(matches!(solver.solve(&request).await,
                         Err(SolveError::EngineUnavailable(_))));
    }
}
