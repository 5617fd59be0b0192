//! Device abstractions for the camera and the mount, plus file-backed
//! simulators of both.
//!
//! Mount positions cross these interfaces in the equinox of date (JNow);
//! epoch conversion happens in the caller, right at the device boundary.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;

use crate::position::{InvalidCoordinate, PositionJnow};

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera is not connected")]
    NotConnected,
    #[error("no exposure has completed")]
    NoImage,
    #[error("camera rejected request: {0}")]
    Rejected(String),
    #[error("image transfer failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount is not connected")]
    NotConnected,
    #[error("mount rejected request: {0}")]
    Rejected(String),
    #[error("mount reported a bad position: {0}")]
    BadPosition(#[from] InvalidCoordinate),
}

/// How a finished exposure reaches the filesystem. Some camera drivers hand
/// back pixel data in memory; others can only write a file themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTransfer {
    InMemory,
    ToDisk,
}

/// An imaging camera. All dimensions are in binned pixels except
/// `sensor_size`, which is unbinned.
#[async_trait]
pub trait CameraDevice {
    async fn sensor_size(&mut self) -> Result<(u32, u32), CameraError>;

    /// Region of interest in binned pixels.
    async fn set_frame(&mut self, x: u32, y: u32, width: u32, height: u32)
                       -> Result<(), CameraError>;

    async fn set_binning(&mut self, bin_x: u32, bin_y: u32)
                         -> Result<(), CameraError>;

    async fn start_exposure(&mut self, duration: Duration)
                            -> Result<(), CameraError>;

    /// Whether the most recent exposure has completed.
    async fn exposure_complete(&mut self) -> Result<bool, CameraError>;

    /// Which of `image_data` / `save_image` this driver supports natively.
    fn transfer_mode(&self) -> ImageTransfer;

    /// Returns the completed exposure as encoded FITS bytes.
    async fn image_data(&mut self) -> Result<Vec<u8>, CameraError>;

    /// Writes the completed exposure to `path` as a FITS file.
    async fn save_image(&mut self, path: &Path) -> Result<(), CameraError>;
}

/// A goto mount. Positions are equinox-of-date.
#[async_trait]
pub trait MountDevice {
    async fn is_connected(&mut self) -> Result<bool, MountError>;

    async fn position(&mut self) -> Result<PositionJnow, MountError>;

    /// Tells the mount it is actually pointing at `position`, updating its
    /// pointing model without moving.
    async fn sync(&mut self, position: &PositionJnow)
                  -> Result<(), MountError>;

    /// Starts a slew to `target`. Returns once the slew is underway;
    /// completion is observed through `is_slewing`.
    async fn goto(&mut self, target: &PositionJnow)
                  -> Result<(), MountError>;

    async fn is_slewing(&mut self) -> Result<bool, MountError>;
}

/// A mount simulator with an explicit pointing-model error. The mount
/// reports `physical + offset`; a goto moves the physical axes so the
/// reported position lands on the target, a sync only changes the offset.
pub struct SimulatorMount {
    physical_ra_deg: f64,
    physical_dec_deg: f64,
    offset_ra_deg: f64,
    offset_dec_deg: f64,
}

impl SimulatorMount {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        SimulatorMount {
            physical_ra_deg: ra_deg,
            physical_dec_deg: dec_deg,
            offset_ra_deg: 0.0,
            offset_dec_deg: 0.0,
        }
    }

    /// Seeds a pointing-model error, degrees.
    pub fn with_pointing_error(mut self, ra_deg: f64, dec_deg: f64) -> Self {
        self.offset_ra_deg = ra_deg;
        self.offset_dec_deg = dec_deg;
        self
    }

    /// Where the simulated axes actually point, ignoring the model offset.
    pub fn physical_position(&self) -> (f64, f64) {
        (self.physical_ra_deg, self.physical_dec_deg)
    }
}

#[async_trait]
impl MountDevice for SimulatorMount {
    async fn is_connected(&mut self) -> Result<bool, MountError> {
        Ok(true)
    }

    async fn position(&mut self) -> Result<PositionJnow, MountError> {
        let ra = (self.physical_ra_deg + self.offset_ra_deg)
            .rem_euclid(360.0);
        let dec = (self.physical_dec_deg + self.offset_dec_deg)
            .clamp(-90.0, 90.0);
        Ok(PositionJnow::new(ra, dec, SystemTime::now())?)
    }

    async fn sync(&mut self, position: &PositionJnow)
                  -> Result<(), MountError> {
        self.offset_ra_deg = position.ra_deg() - self.physical_ra_deg;
        self.offset_dec_deg = position.dec_deg() - self.physical_dec_deg;
        info!("Simulator mount synced to {}", position);
        Ok(())
    }

    async fn goto(&mut self, target: &PositionJnow)
                  -> Result<(), MountError> {
        self.physical_ra_deg = target.ra_deg() - self.offset_ra_deg;
        self.physical_dec_deg = target.dec_deg() - self.offset_dec_deg;
        info!("Simulator mount slewing to {}", target);
        Ok(())
    }

    async fn is_slewing(&mut self) -> Result<bool, MountError> {
        Ok(false)
    }
}

/// A camera simulator backed by a canned image file. Exposures take real
/// time; `save_image` copies the canned file into place.
pub struct SimulatorCamera {
    source: PathBuf,
    sensor_width: u32,
    sensor_height: u32,
    bin_x: u32,
    bin_y: u32,
    exposure_done_at: Option<Instant>,
}

impl SimulatorCamera {
    pub fn new(source: PathBuf, sensor_width: u32, sensor_height: u32)
               -> Self {
        SimulatorCamera {
            source,
            sensor_width,
            sensor_height,
            bin_x: 1,
            bin_y: 1,
            exposure_done_at: None,
        }
    }
}

#[async_trait]
impl CameraDevice for SimulatorCamera {
    async fn sensor_size(&mut self) -> Result<(u32, u32), CameraError> {
        Ok((self.sensor_width, self.sensor_height))
    }

    async fn set_frame(&mut self, x: u32, y: u32, width: u32, height: u32)
                       -> Result<(), CameraError> {
        if x + width * self.bin_x > self.sensor_width
            || y + height * self.bin_y > self.sensor_height
        {
            return Err(CameraError::Rejected(format!(
                "frame {}x{}+{}+{} exceeds sensor", width, height, x, y)));
        }
        Ok(())
    }

    async fn set_binning(&mut self, bin_x: u32, bin_y: u32)
                         -> Result<(), CameraError> {
        if bin_x == 0 || bin_y == 0 {
            return Err(CameraError::Rejected("zero binning".to_string()));
        }
        self.bin_x = bin_x;
        self.bin_y = bin_y;
        Ok(())
    }

    async fn start_exposure(&mut self, duration: Duration)
                            -> Result<(), CameraError> {
        debug!("Simulator camera exposing for {:?}", duration);
        self.exposure_done_at = Some(Instant::now() + duration);
        Ok(())
    }

    async fn exposure_complete(&mut self) -> Result<bool, CameraError> {
        match self.exposure_done_at {
            Some(done_at) => Ok(Instant::now() >= done_at),
            None => Err(CameraError::NoImage),
        }
    }

    fn transfer_mode(&self) -> ImageTransfer {
        ImageTransfer::ToDisk
    }

    async fn image_data(&mut self) -> Result<Vec<u8>, CameraError> {
        if self.exposure_done_at.is_none() {
            return Err(CameraError::NoImage);
        }
        Ok(tokio::fs::read(&self.source).await?)
    }

    async fn save_image(&mut self, path: &Path) -> Result<(), CameraError> {
        if self.exposure_done_at.is_none() {
            return Err(CameraError::NoImage);
        }
        tokio::fs::copy(&self.source, path).await?;
        Ok(())
    }
}
