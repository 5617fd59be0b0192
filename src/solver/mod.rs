//! Normalized plate-solve model: the request/solution value types, the
//! `PlateSolver` trait every backend adapter implements, and the parsing
//! helpers shared by the adapters.
//!
//! Whatever convention the underlying engine reports, adapters normalize the
//! roll angle to degrees East of North of the image Y axis, wrapped into
//! (-180, 180], and the pixel scale to positive arcsec/pixel.

pub mod astap;
pub mod nova;
pub mod platesolve2;
pub mod solve_field;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::{format_dec_dms, format_ra_hms, PositionJ2000};

/// Search radius used when the caller supplies no estimate.
pub const DEFAULT_SEARCH_RADIUS_DEG: f64 = 10.0;

/// Input to a solver adapter: an image on disk plus the hints that keep the
/// engine from searching blindly.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub image: PathBuf,
    pub estimated_center: PositionJ2000,
    /// Field of view, degrees.
    pub fov_x_deg: f64,
    pub fov_y_deg: f64,
    /// Image dimensions in pixels, after any hardware binning.
    pub width: u32,
    pub height: u32,
    /// Pixel scale of the image as delivered (arcsec/pixel), if known.
    pub pixel_scale_hint: Option<f64>,
    pub search_radius_deg: Option<f64>,
    pub downsample: u32,
    pub bin_x: u32,
    pub bin_y: u32,
}

impl SolveRequest {
    pub fn search_radius_deg(&self) -> f64 {
        self.search_radius_deg.unwrap_or(DEFAULT_SEARCH_RADIUS_DEG)
    }
}

/// A normalized plate solution, independent of which engine produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub position: PositionJ2000,
    /// Arcsec/pixel, always positive.
    pub pixel_scale: f64,
    /// Position angle of the image Y axis, degrees East of North, (-180, 180].
    pub roll_angle: f64,
    /// Hardware binning the solved image was taken with.
    pub binning: u32,
}

impl Solution {
    pub fn summary(&self) -> SolutionSummary {
        SolutionSummary {
            ra2000: format_ra_hms(self.position.ra_deg()),
            dec2000: format_dec_dms(self.position.dec_deg()),
            angle: self.roll_angle,
            pixelscale: self.pixel_scale,
            binning: self.binning,
        }
    }

    pub fn summary_json(&self) -> String {
        // Serialization of a plain struct cannot fail.
        serde_json::to_string(&self.summary()).unwrap()
    }
}

/// The one machine-readable artifact other tools consume; field names and
/// sexagesimal formats are a compatibility contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionSummary {
    pub ra2000: String,
    pub dec2000: String,
    pub angle: f64,
    pub pixelscale: f64,
    pub binning: u32,
}

#[derive(Debug, Error)]
pub enum SolveError {
    /// The engine ran to completion but found no astrometric match.
    /// Expected from time to time; callers retry.
    #[error("no astrometric match found")]
    NoSolution,

    /// The engine produced output we could not interpret. The raw text is
    /// kept for diagnostics.
    #[error("could not interpret solver output ({reason}); raw output: {raw:?}")]
    ParseFailure { reason: String, raw: String },

    /// The engine could not be run at all (missing executable, network
    /// unreachable, unexpected exit). Retrying is pointless without
    /// operator action.
    #[error("solver engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Deadline exceeded waiting for the engine.
    #[error("solve timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the solve while it was in flight.
    #[error("solve cancelled")]
    Cancelled,
}

impl SolveError {
    pub fn parse(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        SolveError::ParseFailure { reason: reason.into(), raw: raw.into() }
    }

    /// Whether another attempt could plausibly succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(self,
                  SolveError::EngineUnavailable(_) | SolveError::Cancelled)
    }
}

/// One plate-solving backend. `solve` blocks (at the task level) for as long
/// as the engine needs, up to the adapter's own deadline.
#[async_trait]
pub trait PlateSolver {
    async fn solve(&self, request: &SolveRequest)
                   -> Result<Solution, SolveError>;

    fn name(&self) -> &'static str;
}

/// Wraps an angle in degrees into (-180, 180].
pub fn normalize_roll(angle_deg: f64) -> f64 {
    let mut angle = angle_deg % 360.0;
    if angle <= -180.0 {
        angle += 360.0;
    } else if angle > 180.0 {
        angle -= 360.0;
    }
    angle
}

/// Decomposes a FITS CD matrix (degrees/pixel) into pixel scale
/// (arcsec/pixel) and roll angle (degrees East of North of the Y axis).
///
/// The matrix is `[[cd1_1, cd1_2], [cd2_1, cd2_2]]`. All adapters share this
/// one sign rule; engines that report a CROTA-style angle directly go through
/// `normalize_roll` instead, so the convention stays uniform.
pub fn decompose_cd_matrix(cd: &[[f64; 2]; 2]) -> (f64, f64) {
    let scale_deg = (cd[0][0] * cd[0][0] + cd[1][0] * cd[1][0]).sqrt();
    let roll = normalize_roll(-cd[1][0].atan2(cd[0][0]).to_degrees());
    (scale_deg * 3600.0, roll)
}

/// Parses one numeric field out of engine output, rejecting non-finite
/// values. `raw` is the surrounding engine text, kept for diagnostics.
pub(crate) fn parse_float_field(text: &str, what: &str, raw: &str)
                                -> Result<f64, SolveError> {
    let value: f64 = text.trim().parse().map_err(|_| {
        SolveError::parse(format!("{} is not a number: {:?}", what, text), raw)
    })?;
    if !value.is_finite() {
        return Err(SolveError::parse(format!("{} is not finite", what), raw));
    }
    Ok(value)
}

/// Validates a parsed pixel scale: positive and physically plausible.
pub(crate) fn check_pixel_scale(scale: f64, raw: &str)
                                -> Result<f64, SolveError> {
    if scale <= 0.0 || scale > 3600.0 {
        return Err(SolveError::parse(
            format!("implausible pixel scale {} arcsec/px", scale), raw));
    }
    Ok(scale)
}

/// Builds a J2000 position out of solved values, mapping range violations to
/// a parse failure at the adapter boundary.
pub(crate) fn solved_position(ra_deg: f64, dec_deg: f64, raw: &str)
                              -> Result<PositionJ2000, SolveError> {
    PositionJ2000::new(ra_deg.rem_euclid(360.0), dec_deg)
        .map_err(|e| SolveError::parse(e.to_string(), raw))
}

/// Removes a leftover engine output file so a previous run's result can
/// never be mistaken for this run's.
pub(crate) fn remove_stale_output(path: &Path) {
    if path.exists() {
        debug!("Removing stale solver output {}", path.display());
        let _ = std::fs::remove_file(path);
    }
}

/// Runs a local solver engine with a wall-clock deadline. Spawn failures map
/// to `EngineUnavailable`; exceeding the deadline kills the engine and maps
/// to `Timeout`.
pub(crate) async fn run_engine(
    mut command: tokio::process::Command,
    timeout: Duration,
    engine: &str,
) -> Result<std::process::Output, SolveError> {
    command.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!("Running {}: {:?}", engine, command.as_std());
    let child = command.spawn().map_err(|e| {
        SolveError::EngineUnavailable(format!("{}: {}", engine, e))
    })?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Err(SolveError::Timeout(timeout)),
        Ok(Err(e)) => Err(SolveError::EngineUnavailable(
            format!("{}: {}", engine, e))),
        Ok(Ok(output)) => Ok(output),
    }
}
