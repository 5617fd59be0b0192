//! The closed-loop goto engine: slew, expose, plate solve, sync, correct,
//! repeat until the mount is within tolerance of the target.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::devices::{
    CameraDevice, CameraError, ImageTransfer, MountDevice, MountError,
};
use crate::dispatch::Dispatcher;
use crate::position::PositionJ2000;
use crate::solver::{Solution, SolveError};

/// Capture-and-solve attempts per convergence iteration before giving up.
const SOLVE_RETRIES: u32 = 3;
const EXPOSURE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SLEW_POLL_INTERVAL: Duration = Duration::from_secs(1);

// Process-wide so concurrent engines never collide on a temp image path.
static IMAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Receives human-readable progress reports during a precise goto.
pub trait StatusSink: Send + Sync {
    fn status(&self, message: &str);
}

/// Routes progress reports to the log.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn status(&self, message: &str) {
        info!("{}", message);
    }
}

#[derive(Debug, Error)]
pub enum GotoError {
    #[error("mount error: {0}")]
    Mount(#[from] MountError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("target is {separation_deg:.2} degrees from the current \
             position, over the {limit_deg:.2} degree goto limit")]
    TargetTooFar { separation_deg: f64, limit_deg: f64 },
    #[error("operation cancelled")]
    Cancelled,
}

/// Why a precise goto gave up. Distinct from `GotoError`: these are
/// outcomes of a run that proceeded normally, not faults.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    NoSolution,
    SolveTimeout,
    SolverUnavailable(String),
    NotConverged { last_separation_deg: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConvergenceOutcome {
    Converged { tries: u32, separation_arcsec: f64 },
    Failed(FailureReason),
}

/// A precise-goto request: where to end up and how hard to try.
#[derive(Debug, Clone)]
pub struct ConvergenceTarget {
    pub target: PositionJ2000,
    pub tolerance_arcsec: f64,
    pub max_tries: u32,
}

impl ConvergenceTarget {
    pub fn from_settings(target: PositionJ2000, settings: &Settings) -> Self {
        ConvergenceTarget {
            target,
            tolerance_arcsec: settings.tolerance_arcsec,
            max_tries: settings.max_tries,
        }
    }
}

/// The sync interlock rule: only a separation strictly beyond the limit
/// blocks the sync; exactly at the limit still syncs.
fn sync_blocked(separation_deg: f64, limit_deg: f64) -> bool {
    separation_deg > limit_deg
}

pub type SharedCamera = Arc<Mutex<Box<dyn CameraDevice + Send>>>;
pub type SharedMount = Arc<Mutex<Box<dyn MountDevice + Send>>>;

pub struct GotoEngine {
    camera: SharedCamera,
    mount: SharedMount,
    dispatcher: Dispatcher,
    settings: Settings,
    sink: Arc<dyn StatusSink>,
    cancel: Arc<std::sync::Mutex<bool>>,
    /// Pause between a sync and the next corrective slew, letting the mount
    /// firmware digest the new pointing model.
    settle: Duration,
}

impl GotoEngine {
    pub fn new(
        camera: SharedCamera,
        mount: SharedMount,
        dispatcher: Dispatcher,
        settings: Settings,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        GotoEngine {
            camera,
            mount,
            dispatcher,
            settings,
            sink,
            cancel: Arc::new(std::sync::Mutex::new(false)),
            settle: Duration::from_secs(1),
        }
    }

    /// Shares an externally owned cancel flag, so components built before
    /// the engine (such as the nova adapter) abort with it.
    pub fn with_cancel_flag(mut self,
                            cancel: Arc<std::sync::Mutex<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Clone of the cancel flag; set it to true to abort the engine at its
    /// next suspension point.
    pub fn cancel_flag(&self) -> Arc<std::sync::Mutex<bool>> {
        self.cancel.clone()
    }

    fn check_cancel(&self) -> Result<(), GotoError> {
        if *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) {
            Err(GotoError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn mount_position_j2000(&self) -> Result<PositionJ2000, GotoError> {
        let jnow = self.mount.lock().await.position().await?;
        Ok(jnow.to_j2000())
    }

    /// Captures one full-frame exposure at the configured binning and
    /// returns the image path with its binned geometry.
    async fn capture_image(&self)
                           -> Result<(PathBuf, u32, u32, u32), GotoError> {
        let bin = self.settings.binning.max(1);
        let exposure =
            Duration::from_secs_f64(self.settings.exposure_secs);
        let path = std::env::temp_dir().join(format!(
            "skygoto_{}_{}.fits",
            std::process::id(),
            IMAGE_SEQ.fetch_add(1, Ordering::Relaxed)));

        {
            let mut camera = self.camera.lock().await;
            camera.set_binning(1, 1).await?;
            let (sensor_w, sensor_h) = camera.sensor_size().await?;
            camera.set_frame(0, 0, sensor_w, sensor_h).await?;
            camera.set_binning(bin, bin).await?;
            camera.start_exposure(exposure).await?;
        }

        let started = std::time::Instant::now();
        loop {
            self.check_cancel()?;
            if self.camera.lock().await.exposure_complete().await? {
                break;
            }
            self.sink.status(&format!(
                "Exposing: {:.1} of {:.1} s",
                started.elapsed().as_secs_f64()
                    .min(self.settings.exposure_secs),
                self.settings.exposure_secs));
            tokio::time::sleep(EXPOSURE_POLL_INTERVAL).await;
        }

        let mut camera = self.camera.lock().await;
        match camera.transfer_mode() {
            ImageTransfer::ToDisk => camera.save_image(&path).await?,
            ImageTransfer::InMemory => {
                let data = camera.image_data().await?;
                tokio::fs::write(&path, data).await
                    .map_err(CameraError::Io)?;
            }
        }
        let (sensor_w, sensor_h) = camera.sensor_size().await?;
        Ok((path, sensor_w / bin, sensor_h / bin, bin))
    }

    /// Captures and solves, retrying on recoverable failures with a fresh
    /// exposure each time. Solver failures come back as an outcome, device
    /// failures as an error.
    async fn capture_and_solve(&self, estimate: &PositionJ2000)
        -> Result<Result<Solution, FailureReason>, GotoError>
    {
        let mut last_error = None;
        for attempt in 1..=SOLVE_RETRIES {
            self.check_cancel()?;
            let (path, width, height, bin) = self.capture_image().await?;
            let request = self.dispatcher.build_request(
                path.clone(), *estimate, width, height, bin, bin);
            let result = self.dispatcher.solve(&request).await;
            let _ = std::fs::remove_file(&path);
            match result {
                Ok(solution) => {
                    self.sink.status(&format!(
                        "Solved at {} ({:.2} arcsec/px, roll {:.2} deg)",
                        solution.position, solution.pixel_scale,
                        solution.roll_angle));
                    return Ok(Ok(solution));
                }
                Err(SolveError::Cancelled) => {
                    return Err(GotoError::Cancelled);
                }
                Err(e) if !e.is_retryable() => {
                    return Ok(Err(FailureReason::SolverUnavailable(
                        e.to_string())));
                }
                Err(e) => {
                    warn!("Solve attempt {}/{} failed: {}",
                          attempt, SOLVE_RETRIES, e);
                    last_error = Some(e);
                }
            }
        }
        Ok(Err(match last_error {
            Some(SolveError::Timeout(_)) => FailureReason::SolveTimeout,
            _ => FailureReason::NoSolution,
        }))
    }

    /// Syncs the mount to the solved position unless the solved position is
    /// implausibly far from where the mount already thinks it points.
    /// Returns whether the sync was applied.
    pub async fn sync_to_solution(&self, solution: &Solution)
                                  -> Result<bool, GotoError> {
        let mount_j2000 = self.mount_position_j2000().await?;
        let separation = solution.position.separation_deg(&mount_j2000);
        if sync_blocked(separation, self.settings.max_sync_separation_deg) {
            self.sink.status(&format!(
                "Not syncing: solved position is {:.2} degrees from the \
                 mount position (limit {:.2})",
                separation, self.settings.max_sync_separation_deg));
            return Ok(false);
        }
        let jnow = solution.position.to_jnow();
        self.mount.lock().await.sync(&jnow).await?;
        Ok(true)
    }

    /// Slews to `target` and waits for the slew to finish.
    pub async fn goto(&self, target: &PositionJ2000)
                      -> Result<(), GotoError> {
        let current = self.mount_position_j2000().await?;
        let separation = target.separation_deg(&current);
        if separation > self.settings.max_goto_separation_deg {
            return Err(GotoError::TargetTooFar {
                separation_deg: separation,
                limit_deg: self.settings.max_goto_separation_deg,
            });
        }

        let jnow = target.to_jnow();
        self.mount.lock().await.goto(&jnow).await?;
        loop {
            self.check_cancel()?;
            if !self.mount.lock().await.is_slewing().await? {
                return Ok(());
            }
            tokio::time::sleep(SLEW_POLL_INTERVAL).await;
        }
    }

    /// Captures an image and solves it, using the mount's current pointing
    /// as the search estimate.
    pub async fn solve_here(&self)
        -> Result<Result<Solution, FailureReason>, GotoError>
    {
        let estimate = self.mount_position_j2000().await?;
        self.capture_and_solve(&estimate).await
    }

    /// Runs the full closed loop: initial slew, then solve/sync/correct
    /// until within tolerance or out of tries.
    pub async fn precise_goto(&self, request: &ConvergenceTarget)
                              -> Result<ConvergenceOutcome, GotoError> {
        let tolerance_deg = request.tolerance_arcsec / 3600.0;
        self.sink.status(&format!(
            "Precise goto to {} (tolerance {:.1} arcsec, {} tries)",
            request.target, request.tolerance_arcsec, request.max_tries));
        self.goto(&request.target).await?;

        let mut last_separation_deg = f64::INFINITY;
        for attempt in 1..=request.max_tries.max(1) {
            self.check_cancel()?;
            let estimate = self.mount_position_j2000().await?;
            let solution = match self.capture_and_solve(&estimate).await? {
                Ok(solution) => solution,
                Err(reason) => return Ok(ConvergenceOutcome::Failed(reason)),
            };

            let separation = solution.position
                .separation_deg(&request.target);
            last_separation_deg = separation;
            self.sink.status(&format!(
                "Try {}/{}: {:.1} arcsec from target",
                attempt, request.max_tries, separation * 3600.0));

            if separation < tolerance_deg {
                return Ok(ConvergenceOutcome::Converged {
                    tries: attempt,
                    separation_arcsec: separation * 3600.0,
                });
            }

            self.sync_to_solution(&solution).await?;
            tokio::time::sleep(self.settle).await;
            if attempt < request.max_tries {
                self.goto(&request.target).await?;
            }
        }

        Ok(ConvergenceOutcome::Failed(FailureReason::NotConverged {
            last_separation_deg,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    use async_trait::async_trait;

    use super::*;
    use crate::devices::ImageTransfer;
    use crate::position::PositionJnow;
    use crate::solver::{PlateSolver, SolveRequest};

    #[derive(Default)]
    struct MountCounters {
        gotos: u32,
        syncs: u32,
    }

    struct MockMount {
        ra_deg: f64,
        dec_deg: f64,
        counters: Arc<StdMutex<MountCounters>>,
    }

    impl MockMount {
        fn new(ra_deg: f64, dec_deg: f64)
               -> (Self, Arc<StdMutex<MountCounters>>) {
            let counters = Arc::new(StdMutex::new(MountCounters::default()));
            let mount = MockMount { ra_deg, dec_deg,
                                    counters: counters.clone() };
            (mount, counters)
        }
    }

    #[async_trait]
    impl MountDevice for MockMount {
        async fn is_connected(&mut self) -> Result<bool, MountError> {
            Ok(true)
        }

        async fn position(&mut self) -> Result<PositionJnow, MountError> {
            Ok(PositionJnow::new(self.ra_deg, self.dec_deg,
                                 SystemTime::now())?)
        }

        async fn sync(&mut self, position: &PositionJnow)
                      -> Result<(), MountError> {
            self.ra_deg = position.ra_deg();
            self.dec_deg = position.dec_deg();
            self.counters.lock().unwrap().syncs += 1;
            Ok(())
        }

        async fn goto(&mut self, target: &PositionJnow)
                      -> Result<(), MountError> {
            self.ra_deg = target.ra_deg();
            self.dec_deg = target.dec_deg();
            self.counters.lock().unwrap().gotos += 1;
            Ok(())
        }

        async fn is_slewing(&mut self) -> Result<bool, MountError> {
            Ok(false)
        }
    }

    struct MockCamera;

    #[async_trait]
    impl CameraDevice for MockCamera {
        async fn sensor_size(&mut self) -> Result<(u32, u32), CameraError> {
            Ok((4000, 3000))
        }

        async fn set_frame(&mut self, _x: u32, _y: u32, _w: u32, _h: u32)
                           -> Result<(), CameraError> {
            Ok(())
        }

        async fn set_binning(&mut self, _bx: u32, _by: u32)
                             -> Result<(), CameraError> {
            Ok(())
        }

        async fn start_exposure(&mut self, _duration: Duration)
                                -> Result<(), CameraError> {
            Ok(())
        }

        async fn exposure_complete(&mut self) -> Result<bool, CameraError> {
            Ok(true)
        }

        fn transfer_mode(&self) -> ImageTransfer {
            ImageTransfer::InMemory
        }

        async fn image_data(&mut self) -> Result<Vec<u8>, CameraError> {
            Ok(b"mock image".to_vec())
        }

        async fn save_image(&mut self, path: &std::path::Path)
                            -> Result<(), CameraError> {
            std::fs::write(path, b"mock image")?;
            Ok(())
        }
    }

    /// Returns one scripted result per solve attempt, repeating the last
    /// entry once the script runs out.
    struct ScriptedSolver {
        script: StdMutex<Vec<Result<Solution, SolveError>>>,
        attempts: Arc<StdMutex<u32>>,
    }

    impl ScriptedSolver {
        fn new(script: Vec<Result<Solution, SolveError>>)
               -> (Self, Arc<StdMutex<u32>>) {
            let attempts = Arc::new(StdMutex::new(0));
            let mut script = script;
            script.reverse();
            (ScriptedSolver { script: StdMutex::new(script),
                              attempts: attempts.clone() },
             attempts)
        }
    }

    #[async_trait]
    impl PlateSolver for ScriptedSolver {
        async fn solve(&self, request: &SolveRequest)
                       -> Result<Solution, SolveError> {
            // The engine must have written the capture to disk, whatever
            // the camera's transfer mode.
            assert!(request.image.exists(), "no image on disk to solve");
            *self.attempts.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                clone_result(&script[0])
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn clone_result(result: &Result<Solution, SolveError>)
                    -> Result<Solution, SolveError> {
        match result {
            Ok(s) => Ok(s.clone()),
            Err(SolveError::NoSolution) => Err(SolveError::NoSolution),
            Err(SolveError::Timeout(d)) => Err(SolveError::Timeout(*d)),
            Err(SolveError::EngineUnavailable(m)) =>
                Err(SolveError::EngineUnavailable(m.clone())),
            Err(SolveError::Cancelled) => Err(SolveError::Cancelled),
            Err(SolveError::ParseFailure { reason, raw }) =>
                Err(SolveError::ParseFailure { reason: reason.clone(),
                                               raw: raw.clone() }),
        }
    }

    fn solution_at(ra_deg: f64, dec_deg: f64) -> Solution {
        Solution {
            position: PositionJ2000::new(ra_deg, dec_deg).unwrap(),
            pixel_scale: 1.5,
            roll_angle: 0.0,
            binning: 2,
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.exposure_secs = 0.0;
        settings.binning = 2;
        settings.pixel_scale = 1.5;
        settings.max_sync_separation_deg = 10.0;
        settings.max_goto_separation_deg = 90.0;
        settings
    }

    fn engine_with(
        solver: ScriptedSolver,
        mount: MockMount,
        settings: Settings,
    ) -> GotoEngine {
        let dispatcher =
            Dispatcher::with_solver(Box::new(solver), &settings);
        let camera: Box<dyn CameraDevice + Send> = Box::new(MockCamera);
        let mount: Box<dyn MountDevice + Send> = Box::new(mount);
        GotoEngine::new(
            Arc::new(Mutex::new(camera)),
            Arc::new(Mutex::new(mount)),
            dispatcher,
            settings,
            Arc::new(LogStatusSink),
        )
        .with_settle(Duration::ZERO)
    }

    fn target(ra_deg: f64, dec_deg: f64, tolerance_arcsec: f64,
              max_tries: u32) -> ConvergenceTarget {
        ConvergenceTarget {
            target: PositionJ2000::new(ra_deg, dec_deg).unwrap(),
            tolerance_arcsec,
            max_tries,
        }
    }

    #[tokio::test]
    async fn test_converges_first_try_when_solution_is_on_target() {
        let (solver, attempts) =
            ScriptedSolver::new(vec![Ok(solution_at(120.0, 45.0))]);
        let (mount, counters) = MockMount::new(119.0, 44.5);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 5))
            .await
            .unwrap();
        assert!(matches!(outcome,
                         ConvergenceOutcome::Converged { tries: 1, .. }));
        assert_eq!(*attempts.lock().unwrap(), 1);
        let counters = counters.lock().unwrap();
        // Only the initial slew; convergence happened before any sync.
        assert_eq!(counters.gotos, 1);
        assert_eq!(counters.syncs, 0);
    }

    #[tokio::test]
    async fn test_converges_as_pointing_error_decays() {
        // Each corrective pass shrinks the miss tenfold: 0.5 deg, 0.05,
        // 0.005, 0.0005. With a 5 arcsec tolerance the fourth solve is the
        // first within tolerance.
        let (solver, _) = ScriptedSolver::new(vec![
            Ok(solution_at(120.5, 45.0)),
            Ok(solution_at(120.05, 45.0)),
            Ok(solution_at(120.005, 45.0)),
            Ok(solution_at(120.0005, 45.0)),
        ]);
        let (mount, counters) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 5.0, 10))
            .await
            .unwrap();
        match outcome {
            ConvergenceOutcome::Converged { tries, separation_arcsec } => {
                assert_eq!(tries, 4);
                assert!(separation_arcsec < 5.0);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
        let counters = counters.lock().unwrap();
        // Initial slew plus one corrective slew per non-final try.
        assert_eq!(counters.gotos, 4);
        assert_eq!(counters.syncs, 3);
    }

    #[tokio::test]
    async fn test_no_solution_fails_after_retries() {
        let (solver, attempts) =
            ScriptedSolver::new(vec![Err(SolveError::NoSolution)]);
        let (mount, counters) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 5))
            .await
            .unwrap();
        assert_eq!(outcome,
                   ConvergenceOutcome::Failed(FailureReason::NoSolution));
        assert_eq!(*attempts.lock().unwrap(), SOLVE_RETRIES);
        assert_eq!(counters.lock().unwrap().gotos, 1);
    }

    #[tokio::test]
    async fn test_unavailable_engine_fails_without_retries() {
        let (solver, attempts) = ScriptedSolver::new(vec![
            Err(SolveError::EngineUnavailable("astap: not found".into())),
        ]);
        let (mount, _) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 5))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ConvergenceOutcome::Failed(
                FailureReason::SolverUnavailable(_))));
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_implausible_solution_skips_sync_and_gives_up() {
        // Solver insists the scope points 15 degrees away; with a 10 degree
        // sync limit the pointing model must stay untouched.
        let (solver, _) =
            ScriptedSolver::new(vec![Ok(solution_at(120.0, 30.0))]);
        let (mount, counters) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 3))
            .await
            .unwrap();
        match outcome {
            ConvergenceOutcome::Failed(
                FailureReason::NotConverged { last_separation_deg }) => {
                assert!(last_separation_deg > 14.0);
            }
            other => panic!("expected NotConverged, got {:?}", other),
        }
        let counters = counters.lock().unwrap();
        assert_eq!(counters.syncs, 0);
        assert_eq!(counters.gotos, 3);
    }

    #[test]
    fn test_sync_interlock_boundary() {
        // The rule is strictly greater-than: exactly at the limit still
        // syncs, a thousandth of a degree beyond does not.
        assert!(!sync_blocked(10.0, 10.0));
        assert!(sync_blocked(10.001, 10.0));
        assert!(!sync_blocked(9.999, 10.0));
    }

    #[tokio::test]
    async fn test_sync_skipped_just_beyond_the_limit() {
        // 10.001 degrees from the mount against a 10 degree limit.
        let (solver, _) =
            ScriptedSolver::new(vec![Ok(solution_at(120.0, 34.999))]);
        let (mount, counters) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, ConvergenceOutcome::Failed(_)));
        assert_eq!(counters.lock().unwrap().syncs, 0);
    }

    #[tokio::test]
    async fn test_sync_applied_just_inside_the_limit() {
        // The rule is strictly greater-than, so a solution a hair inside
        // the 10 degree limit still syncs.
        let (solver, _) =
            ScriptedSolver::new(vec![Ok(solution_at(120.0, 35.001))]);
        let (mount, counters) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let outcome = engine
            .precise_goto(&target(120.0, 45.0, 60.0, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, ConvergenceOutcome::Failed(_)));
        assert_eq!(counters.lock().unwrap().syncs, 1);
    }

    #[tokio::test]
    async fn test_goto_refused_beyond_separation_limit() {
        let (solver, _) =
            ScriptedSolver::new(vec![Err(SolveError::NoSolution)]);
        let (mount, counters) = MockMount::new(0.0, -45.0);
        let mut settings = test_settings();
        settings.max_goto_separation_deg = 30.0;
        let engine = engine_with(solver, mount, settings);

        let result = engine.precise_goto(&target(120.0, 45.0, 60.0, 3)).await;
        assert!(matches!(result,
                         Err(GotoError::TargetTooFar { .. })));
        assert_eq!(counters.lock().unwrap().gotos, 0);
    }

    #[tokio::test]
    async fn test_solver_cancellation_propagates() {
        // A backend that notices the cancel itself (the web adapter does)
        // must surface as a cancelled goto, not as a solver failure.
        let (solver, attempts) =
            ScriptedSolver::new(vec![Err(SolveError::Cancelled)]);
        let (mount, _) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let result = engine.precise_goto(&target(120.0, 45.0, 60.0, 5)).await;
        assert!(matches!(result, Err(GotoError::Cancelled)));
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let (solver, _) =
            ScriptedSolver::new(vec![Ok(solution_at(120.5, 45.0))]);
        let (mount, _) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        *engine.cancel_flag().lock().unwrap() = true;
        let result = engine.precise_goto(&target(120.0, 45.0, 60.0, 5)).await;
        assert!(matches!(result, Err(GotoError::Cancelled)));
    }

    #[tokio::test]
    async fn test_solve_here_uses_mount_estimate() {
        let (solver, attempts) =
            ScriptedSolver::new(vec![Ok(solution_at(120.1, 45.1))]);
        let (mount, _) = MockMount::new(120.0, 45.0);
        let engine = engine_with(solver, mount, test_settings());

        let solution = engine.solve_here().await.unwrap().unwrap();
        assert_eq!(*attempts.lock().unwrap(), 1);
        assert!(solution.position.separation_deg(
            &PositionJ2000::new(120.1, 45.1).unwrap()) < 1e-9);
    }
}
