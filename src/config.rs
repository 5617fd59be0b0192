//! Persistent settings, stored as a JSON file. Every field has a default so
//! a partial (or absent) settings file still yields a working configuration.

use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::SolverChoice;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings file: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Which plate-solving backend to dispatch to.
    pub solver: SolverChoice,
    /// Camera exposure for solve images, seconds.
    pub exposure_secs: f64,
    /// Hardware binning for solve images (same in x and y).
    pub binning: u32,
    /// Unbinned pixel scale of the camera/telescope combination,
    /// arcsec/pixel.
    pub pixel_scale: f64,
    /// A precise goto has converged when the solved position is within this
    /// many arcseconds of the target.
    pub tolerance_arcsec: f64,
    /// Upper bound on goto/solve/sync iterations per precise goto.
    pub max_tries: u32,
    /// Skip the mount sync when the solved position is further than this
    /// from where the mount thinks it is pointing, degrees.
    pub max_sync_separation_deg: f64,
    /// Refuse a goto whose target is further than this from the current
    /// mount position, degrees.
    pub max_goto_separation_deg: f64,
    /// Sky search radius hint handed to the solver, degrees.
    pub search_radius_deg: f64,
    /// Downsample factor handed to the solver (overridden to 1 for binned
    /// images).
    pub downsample: u32,
    pub astap: AstapConfig,
    pub solve_field: SolveFieldConfig,
    pub platesolve2: PlateSolve2Config,
    pub nova: NovaConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            solver: SolverChoice::Astap,
            exposure_secs: 5.0,
            binning: 2,
            pixel_scale: 1.0,
            tolerance_arcsec: 600.0,
            max_tries: 5,
            max_sync_separation_deg: 5.0,
            max_goto_separation_deg: 30.0,
            search_radius_deg: 10.0,
            downsample: 2,
            astap: AstapConfig::default(),
            solve_field: SolveFieldConfig::default(),
            platesolve2: PlateSolve2Config::default(),
            nova: NovaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AstapConfig {
    pub exec_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for AstapConfig {
    fn default() -> Self {
        AstapConfig {
            exec_path: PathBuf::from("/usr/local/bin/astap"),
            timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveFieldConfig {
    pub exec_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for SolveFieldConfig {
    fn default() -> Self {
        SolveFieldConfig {
            exec_path: PathBuf::from("/usr/bin/solve-field"),
            timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateSolve2Config {
    pub exec_path: PathBuf,
    pub regions: u32,
    pub timeout_secs: u64,
}

impl Default for PlateSolve2Config {
    fn default() -> Self {
        PlateSolve2Config {
            exec_path: PathBuf::from("PlateSolve2.exe"),
            regions: 999,
            timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NovaConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for NovaConfig {
    fn default() -> Self {
        NovaConfig {
            api_key: String::new(),
            base_url: "https://nova.astrometry.net".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Settings {
    /// Loads settings from `path`. A missing file yields the defaults; a
    /// present but malformed file is an error rather than a silent reset.
    pub fn load(path: &Path) -> Result<Settings, SettingsError> {
        if !path.exists() {
            info!("No settings file at {}; using defaults", path.display());
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
