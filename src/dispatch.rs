//! Solver dispatch: turns settings plus image geometry into a fully hinted
//! `SolveRequest` and routes it to the configured backend.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::position::PositionJ2000;
use crate::solver::astap::AstapSolver;
use crate::solver::nova::NovaSolver;
use crate::solver::platesolve2::PlateSolve2Solver;
use crate::solver::solve_field::SolveFieldSolver;
use crate::solver::{PlateSolver, Solution, SolveError, SolveRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SolverChoice {
    Astap,
    SolveField,
    #[value(name = "platesolve2")]
    #[serde(rename = "platesolve2")]
    PlateSolve2,
    Nova,
}

/// Field of view covered by `pixels` binned pixels, in degrees.
/// `pixel_scale` is the unbinned scale in arcsec/pixel.
pub fn fov_degrees(pixel_scale: f64, pixels: u32, binning: u32) -> f64 {
    pixel_scale * pixels as f64 * binning as f64 / 3600.0
}

pub struct Dispatcher {
    solver: Box<dyn PlateSolver + Send + Sync>,
    pixel_scale: f64,
    search_radius_deg: f64,
    downsample: u32,
}

impl Dispatcher {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::from_settings_with_cancel(
            settings, Arc::new(Mutex::new(false)))
    }

    /// Like `from_settings`, with a cancel flag handed to backends that
    /// poll a remote service.
    pub fn from_settings_with_cancel(settings: &Settings,
                                     cancel: Arc<Mutex<bool>>) -> Self {
        let solver: Box<dyn PlateSolver + Send + Sync> =
            match settings.solver {
                SolverChoice::Astap =>
                    Box::new(AstapSolver::new(&settings.astap)),
                SolverChoice::SolveField =>
                    Box::new(SolveFieldSolver::new(&settings.solve_field)),
                SolverChoice::PlateSolve2 =>
                    Box::new(PlateSolve2Solver::new(&settings.platesolve2)),
                SolverChoice::Nova =>
                    Box::new(NovaSolver::new(&settings.nova)
                             .with_cancel_flag(cancel)),
            };
        Self::with_solver(solver, settings)
    }

    /// Builds a dispatcher around an arbitrary backend. Lets tests inject a
    /// scripted solver.
    pub fn with_solver(solver: Box<dyn PlateSolver + Send + Sync>,
                       settings: &Settings) -> Self {
        Dispatcher {
            solver,
            pixel_scale: settings.pixel_scale,
            search_radius_deg: settings.search_radius_deg,
            downsample: settings.downsample,
        }
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    /// Assembles the request for an image of `width` x `height` binned
    /// pixels taken at `bin_x`/`bin_y`.
    pub fn build_request(
        &self,
        image: PathBuf,
        estimated_center: PositionJ2000,
        width: u32,
        height: u32,
        bin_x: u32,
        bin_y: u32,
    ) -> SolveRequest {
        // Binned images are already small; further downsampling makes some
        // engines fail to find stars.
        let downsample = if bin_x != 1 || bin_y != 1 {
            1
        } else {
            self.downsample
        };
        SolveRequest {
            image,
            estimated_center,
            fov_x_deg: fov_degrees(self.pixel_scale, width, bin_x),
            fov_y_deg: fov_degrees(self.pixel_scale, height, bin_y),
            width,
            height,
            pixel_scale_hint: Some(self.pixel_scale * bin_x as f64),
            search_radius_deg: Some(self.search_radius_deg),
            downsample,
            bin_x,
            bin_y,
        }
    }

    pub async fn solve(&self, request: &SolveRequest)
                       -> Result<Solution, SolveError> {
        info!("Solving {} with {} (fov {:.3} x {:.3} deg, downsample {})",
              request.image.display(), self.solver.name(),
              request.fov_x_deg, request.fov_y_deg, request.downsample);
        self.solver.solve(request).await
    }
}
