//! Adapter for the ASTAP command-line solver.
//!
//! ASTAP is invoked once per solve and leaves its result in an `.ini` file
//! next to the input image (FITS-style `KEY=VALUE` lines). `PLTSOLVD=T`
//! marks success; the solved center is in `CRVAL1`/`CRVAL2` (degrees), the
//! pixel size in `CDELT1` (degrees/pixel) and the rotation in `CROTA1`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::config::AstapConfig;
use crate::solver::{
    check_pixel_scale, decompose_cd_matrix, normalize_roll,
    parse_float_field, remove_stale_output, run_engine, solved_position,
    PlateSolver, Solution, SolveError, SolveRequest,
};

pub struct AstapSolver {
    exec_path: PathBuf,
    timeout: Duration,
}

impl AstapSolver {
    pub fn new(config: &AstapConfig) -> Self {
        AstapSolver {
            exec_path: config.exec_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl PlateSolver for AstapSolver {
    async fn solve(&self, request: &SolveRequest)
                   -> Result<Solution, SolveError> {
        let out_base = request.image.with_extension("");
        let ini_path = request.image.with_extension("ini");
        remove_stale_output(&ini_path);

        let mut command = Command::new(&self.exec_path);
        command
            .arg("-ra")
            .arg(request.estimated_center.ra_hours().to_string())
            // South pole distance keeps the argument positive.
            .arg("-spd")
            .arg((request.estimated_center.dec_deg() + 90.0).to_string())
            .arg("-fov")
            .arg(request.fov_y_deg.to_string())
            .arg("-r")
            .arg(request.search_radius_deg().to_string())
            .arg("-z")
            .arg(request.downsample.to_string())
            .arg("-f")
            .arg(&request.image)
            .arg("-o")
            .arg(&out_base);

        let output = run_engine(command, self.timeout, "astap").await?;
        debug!("astap exited with {:?}", output.status);

        // ASTAP reports both "no match" and success through the .ini file;
        // no fresh file means no solution, never a reuse of old output.
        let ini_text = match std::fs::read_to_string(&ini_path) {
            Ok(text) => text,
            Err(_) => {
                info!("astap produced no output file; no solution");
                return Err(SolveError::NoSolution);
            }
        };

        let mut solution = parse_ini(&ini_text)?;
        solution.binning = request.bin_x;
        Ok(solution)
    }

    fn name(&self) -> &'static str {
        "astap"
    }
}

/// Parses an ASTAP `.ini` result file. Pure function so the many textual
/// edge cases are testable without running the engine.
fn parse_ini(text: &str) -> Result<Solution, SolveError> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    match fields.get("PLTSOLVD").map(String::as_str) {
        Some("T") => {}
        Some(_) => return Err(SolveError::NoSolution),
        None => {
            return Err(SolveError::parse("missing PLTSOLVD field", text));
        }
    }

    let get = |key: &str| -> Result<&String, SolveError> {
        fields.get(key)
            .ok_or_else(|| SolveError::parse(format!("missing {}", key), text))
    };

    let ra_deg = parse_float_field(get("CRVAL1")?, "CRVAL1", text)?;
    let dec_deg = parse_float_field(get("CRVAL2")?, "CRVAL2", text)?;

    // Newer ASTAP versions write the full CD matrix; it carries the axis
    // flip that CROTA cannot express, so it wins when present.
    let cd_keys = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"];
    let (pixel_scale, roll_angle) =
        if cd_keys.iter().all(|k| fields.contains_key(*k)) {
            let mut cd = [[0.0; 2]; 2];
            for (i, key) in cd_keys.iter().enumerate() {
                cd[i / 2][i % 2] =
                    parse_float_field(&fields[*key], key, text)?;
            }
            let (scale, roll) = decompose_cd_matrix(&cd);
            (check_pixel_scale(scale, text)?, roll)
        } else {
            // CDELT1 is degrees/pixel and may be negative (axis flip).
            let cdelt1 = parse_float_field(get("CDELT1")?, "CDELT1", text)?;
            let crota1 = parse_float_field(get("CROTA1")?, "CROTA1", text)?;
            (check_pixel_scale(cdelt1.abs() * 3600.0, text)?,
             normalize_roll(crota1))
        };

    Ok(Solution {
        position: solved_position(ra_deg, dec_deg, text)?,
        pixel_scale,
        roll_angle,
        binning: 1,
    })
}
