//! Adapter for the nova.astrometry.net web service.
//!
//! The service flow is: log in with an API key to get a session, upload the
//! image (multipart, with a `request-json` part carrying the hints), poll
//! the submission until a job appears, poll the job until it finishes, then
//! fetch the calibration. One overall deadline covers the whole exchange.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;

use crate::config::NovaConfig;
use crate::solver::{
    check_pixel_scale, normalize_roll, solved_position, PlateSolver, Solution,
    SolveError, SolveRequest,
};

const SUBMISSION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct NovaSolver {
    api_key: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
    /// Checked between service round trips; a set flag aborts the solve
    /// well before the overall deadline.
    cancel: Arc<Mutex<bool>>,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    errormessage: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<i64>,
}

#[derive(Deserialize)]
struct SubmissionStatus {
    // The service reports pending jobs as `[null]`.
    #[serde(default)]
    jobs: Vec<Option<i64>>,
}

#[derive(Deserialize)]
struct JobStatus {
    status: String,
}

#[derive(Deserialize)]
struct Calibration {
    ra: f64,
    dec: f64,
    pixscale: f64,
    orientation: f64,
}

impl NovaSolver {
    pub fn new(config: &NovaConfig) -> Self {
        NovaSolver {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
            cancel: Arc::new(Mutex::new(false)),
        }
    }

    /// Shares a cancel flag with the caller.
    pub fn with_cancel_flag(mut self, cancel: Arc<Mutex<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancel(&self) -> Result<(), SolveError> {
        if *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) {
            Err(SolveError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn unavailable(context: &str, e: impl std::fmt::Display) -> SolveError {
        SolveError::EngineUnavailable(format!("nova {}: {}", context, e))
    }

    async fn login(&self) -> Result<String, SolveError> {
        let response: LoginResponse = self.client
            .post(format!("{}/api/login", self.base_url))
            .form(&[("request-json",
                     json!({ "apikey": self.api_key }).to_string())])
            .send()
            .await
            .map_err(|e| Self::unavailable("login", e))?
            .json()
            .await
            .map_err(|e| Self::unavailable("login response", e))?;
        match response.session {
            Some(session) if response.status == "success" => {
                debug!("nova session established");
                Ok(session)
            }
            _ => Err(SolveError::EngineUnavailable(format!(
                "nova login rejected: {}",
                response.errormessage.unwrap_or(response.status)))),
        }
    }

    async fn upload(&self, session: &str, request: &SolveRequest)
                    -> Result<i64, SolveError> {
        let mut hints = json!({
            "session": session,
            "publicly_visible": "n",
            "allow_modifications": "d",
            "allow_commercial_use": "d",
            "center_ra": request.estimated_center.ra_deg(),
            "center_dec": request.estimated_center.dec_deg(),
            "radius": request.search_radius_deg(),
            "downsample_factor": request.downsample.max(1),
        });
        if let Some(scale) = request.pixel_scale_hint {
            hints["scale_units"] = json!("arcsecperpix");
            hints["scale_type"] = json!("ev");
            hints["scale_est"] = json!(scale);
            hints["scale_err"] = json!(10);
        }

        let bytes = tokio::fs::read(&request.image).await
            .map_err(|e| Self::unavailable("reading image", e))?;
        let file_name = request.image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.fits".to_string());
        let form = reqwest::multipart::Form::new()
            .text("request-json", hints.to_string())
            .part("file",
                  reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let response: UploadResponse = self.client
            .post(format!("{}/api/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::unavailable("upload", e))?
            .json()
            .await
            .map_err(|e| Self::unavailable("upload response", e))?;
        match response.subid {
            Some(subid) if response.status == "success" => {
                info!("nova accepted upload, submission {}", subid);
                Ok(subid)
            }
            _ => Err(SolveError::EngineUnavailable(format!(
                "nova upload rejected: {}", response.status))),
        }
    }

    async fn wait_for_job(&self, subid: i64) -> Result<i64, SolveError> {
        loop {
            self.check_cancel()?;
            let status: SubmissionStatus = self.client
                .get(format!("{}/api/submissions/{}", self.base_url, subid))
                .send()
                .await
                .map_err(|e| Self::unavailable("submission status", e))?
                .json()
                .await
                .map_err(|e| Self::unavailable("submission response", e))?;
            if let Some(job) = status.jobs.iter().flatten().next() {
                debug!("nova submission {} spawned job {}", subid, job);
                return Ok(*job);
            }
            tokio::time::sleep(SUBMISSION_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_result(&self, job: i64) -> Result<(), SolveError> {
        loop {
            self.check_cancel()?;
            let status: JobStatus = self.client
                .get(format!("{}/api/jobs/{}", self.base_url, job))
                .send()
                .await
                .map_err(|e| Self::unavailable("job status", e))?
                .json()
                .await
                .map_err(|e| Self::unavailable("job response", e))?;
            match status.status.as_str() {
                "success" => return Ok(()),
                "failure" => return Err(SolveError::NoSolution),
                _ => tokio::time::sleep(JOB_POLL_INTERVAL).await,
            }
        }
    }

    async fn fetch_calibration(&self, job: i64)
                               -> Result<Calibration, SolveError> {
        self.client
            .get(format!("{}/api/jobs/{}/calibration/", self.base_url, job))
            .send()
            .await
            .map_err(|e| Self::unavailable("calibration", e))?
            .json()
            .await
            .map_err(|e| Self::unavailable("calibration response", e))
    }

    async fn solve_inner(&self, request: &SolveRequest)
                         -> Result<Solution, SolveError> {
        self.check_cancel()?;
        let session = self.login().await?;
        let subid = self.upload(&session, request).await?;
        let job = self.wait_for_job(subid).await?;
        self.wait_for_result(job).await?;
        let calibration = self.fetch_calibration(job).await?;
        let mut solution = solution_from_calibration(&calibration)?;
        solution.binning = request.bin_x;
        Ok(solution)
    }
}

#[async_trait]
impl PlateSolver for NovaSolver {
    async fn solve(&self, request: &SolveRequest)
                   -> Result<Solution, SolveError> {
        if self.api_key.is_empty() {
            return Err(SolveError::EngineUnavailable(
                "nova API key is not configured".to_string()));
        }
        match tokio::time::timeout(self.timeout,
                                   self.solve_inner(request)).await {
            Err(_) => Err(SolveError::Timeout(self.timeout)),
            Ok(result) => result,
        }
    }

    fn name(&self) -> &'static str {
        "nova"
    }
}

fn solution_from_calibration(calibration: &Calibration)
                             -> Result<Solution, SolveError> {
    let raw = format!("calibration ra={} dec={} pixscale={} orientation={}",
                      calibration.ra, calibration.dec, calibration.pixscale,
                      calibration.orientation);
    Ok(Solution {
        position: solved_position(calibration.ra, calibration.dec, &raw)?,
        pixel_scale: check_pixel_scale(calibration.pixscale, &raw)?,
        roll_angle: normalize_roll(calibration.orientation),
        binning: 1,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_solution_from_calibration() {
        let calibration: Calibration = serde_json::from_str(
            r#"{"parity": 1.0, "orientation": 262.7, "pixscale": 1.4301,
                "radius": 0.64, "ra": 10.6847, "dec": 41.2690}"#).unwrap();
        let solution = solution_from_calibration(&calibration).unwrap();
        assert_abs_diff_eq!(solution.position.ra_deg(), 10.6847,
                            epsilon = 1e-9);
        assert_abs_diff_eq!(solution.position.dec_deg(), 41.2690,
                            epsilon = 1e-9);
        assert_abs_diff_eq!(solution.pixel_scale, 1.4301, epsilon = 1e-9);
        // 262.7 wraps into (-180, 180].
        assert_abs_diff_eq!(solution.roll_angle, -97.3, epsilon = 1e-9);
    }

    #[test]
    fn test_bad_calibration_rejected() {
        let calibration = Calibration {
            ra: 10.0,
            dec: 41.0,
            pixscale: 0.0,
            orientation: 0.0,
        };
        assert!(matches!(solution_from_calibration(&calibration),
                         Err(SolveError::ParseFailure { .. })));
    }

    fn dummy_request() -> SolveRequest {
        SolveRequest {
            image: "/tmp/no_such_image.fits".into(),
            estimated_center: crate::position::PositionJ2000::new(10.0, 41.0)
                .unwrap(),
            fov_x_deg: 2.0,
            fov_y_deg: 1.5,
            width: 4000,
            height: 3000,
            pixel_scale_hint: None,
            search_radius_deg: None,
            downsample: 2,
            bin_x: 1,
            bin_y: 1,
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_before_any_round_trip() {
        let solver = NovaSolver::new(&NovaConfig {
            api_key: "not-a-real-key".to_string(),
            base_url: "http://localhost:9".to_string(),
            timeout_secs: 300,
        });
        *solver.cancel.lock().unwrap() = true;
        // Returns immediately even though the deadline is 300 s and the
        // service is unreachable.
        assert!(matches!(solver.solve(&dummy_request()).await,
                         Err(SolveError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_engine_unavailable() {
        let solver = NovaSolver::new(&NovaConfig {
            api_key: String::new(),
            base_url: "https://nova.astrometry.net".to_string(),
            timeout_secs: 5,
        });
        assert!(matches!(solver.solve(&dummy_request()).await,
                         Err(SolveError::EngineUnavailable(_))));
    }
}
