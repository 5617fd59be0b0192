//! Epoch-tagged sky positions.
//!
//! A `SkyPosition` always carries its reference epoch in the type, so J2000
//! values (used by solvers and targets) cannot be handed to the mount (which
//! wants JNow) without an explicit precession step.

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

use crate::astro_util;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidCoordinate {
    #[error("right ascension {0} degrees is outside [0, 360)")]
    RightAscension(f64),
    #[error("declination {0} degrees is outside [-90, +90]")]
    Declination(f64),
    #[error("could not parse coordinate {0:?}")]
    Unparseable(String),
}

/// Fixed J2000.0 reference epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J2000;

/// Equinox-of-date epoch, pinned to the instant the value was produced for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jnow {
    pub instant: SystemTime,
}

/// An RA/Dec pair tagged with its epoch. Immutable; transforms produce new
/// values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition<E> {
    ra_deg: f64,
    dec_deg: f64,
    epoch: E,
}

pub type PositionJ2000 = SkyPosition<J2000>;
pub type PositionJnow = SkyPosition<Jnow>;

fn validate(ra_deg: f64, dec_deg: f64) -> Result<(), InvalidCoordinate> {
    if !ra_deg.is_finite() || !(0.0..360.0).contains(&ra_deg) {
        return Err(InvalidCoordinate::RightAscension(ra_deg));
    }
    if !dec_deg.is_finite() || !(-90.0..=90.0).contains(&dec_deg) {
        return Err(InvalidCoordinate::Declination(dec_deg));
    }
    Ok(())
}

impl<E> SkyPosition<E> {
    pub fn ra_deg(&self) -> f64 {
        self.ra_deg
    }

    pub fn dec_deg(&self) -> f64 {
        self.dec_deg
    }

    pub fn ra_hours(&self) -> f64 {
        self.ra_deg / 15.0
    }

    /// Great-circle separation in degrees. Only positions of the same epoch
    /// can be compared; mixing epochs requires an explicit transform first.
    pub fn separation_deg(&self, other: &SkyPosition<E>) -> f64 {
        astro_util::angular_separation_deg(
            self.ra_deg, self.dec_deg, other.ra_deg, other.dec_deg)
    }
}

impl SkyPosition<J2000> {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Result<Self, InvalidCoordinate> {
        validate(ra_deg, dec_deg)?;
        Ok(SkyPosition { ra_deg, dec_deg, epoch: J2000 })
    }

    /// Precesses to the equinox of the current instant.
    pub fn to_jnow(&self) -> SkyPosition<Jnow> {
        self.to_jnow_at(SystemTime::now())
    }

    /// Precesses to the equinox of `instant`. Deterministic for a fixed
    /// instant.
    pub fn to_jnow_at(&self, instant: SystemTime) -> SkyPosition<Jnow> {
        let jd = astro_util::julian_date(instant);
        let (ra_deg, dec_deg) = astro_util::precess(
            self.ra_deg, self.dec_deg, astro_util::JD_J2000, jd);
        SkyPosition { ra_deg, dec_deg, epoch: Jnow { instant } }
    }
}

impl SkyPosition<Jnow> {
    pub fn new(ra_deg: f64, dec_deg: f64, instant: SystemTime)
               -> Result<Self, InvalidCoordinate> {
        validate(ra_deg, dec_deg)?;
        Ok(SkyPosition { ra_deg, dec_deg, epoch: Jnow { instant } })
    }

    pub fn instant(&self) -> SystemTime {
        self.epoch.instant
    }

    /// Precesses back to the fixed J2000 equinox.
    pub fn to_j2000(&self) -> SkyPosition<J2000> {
        let jd = astro_util::julian_date(self.epoch.instant);
        let (ra_deg, dec_deg) = astro_util::precess(
            self.ra_deg, self.dec_deg, jd, astro_util::JD_J2000);
        SkyPosition { ra_deg, dec_deg, epoch: J2000 }
    }
}

impl<E> fmt::Display for SkyPosition<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}",
               format_ra_hms(self.ra_deg), format_dec_dms(self.dec_deg))
    }
}

/// Formats an RA (degrees) as padded HH:MM:SS.s in hours.
pub fn format_ra_hms(ra_deg: f64) -> String {
    let total_hours = (ra_deg / 15.0).rem_euclid(24.0);
    let (h, m, s) = to_sexagesimal(total_hours);
    let (h, m, s) = carry(h, m, s, 24);
    format!("{:02}:{:02}:{:04.1}", h, m, s)
}

/// Formats a declination (degrees) as ±DD:MM:SS.s, sign always present.
pub fn format_dec_dms(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let (d, m, s) = to_sexagesimal(dec_deg.abs());
    let (d, m, s) = carry(d, m, s, u32::MAX);
    format!("{}{:02}:{:02}:{:04.1}", sign, d, m, s)
}

fn to_sexagesimal(value: f64) -> (u32, u32, f64) {
    let whole = value.trunc();
    let minutes_total = (value - whole) * 60.0;
    let minutes = minutes_total.trunc();
    let seconds = (minutes_total - minutes) * 60.0;
    (whole as u32, minutes as u32, seconds)
}

// Rounds seconds to one decimal and propagates any carry upward.
fn carry(mut top: u32, mut minutes: u32, seconds: f64, top_modulus: u32)
         -> (u32, u32, f64) {
    let mut seconds = (seconds * 10.0).round() / 10.0;
    if seconds >= 60.0 {
        seconds -= 60.0;
        minutes += 1;
    }
    if minutes >= 60 {
        minutes -= 60;
        top += 1;
    }
    if top_modulus != u32::MAX && top >= top_modulus {
        top -= top_modulus;
    }
    (top, minutes, seconds)
}

/// Parses an RA given either as sexagesimal hours ("HH:MM:SS.s") or decimal
/// degrees, returning degrees.
pub fn parse_ra(text: &str) -> Result<f64, InvalidCoordinate> {
    let trimmed = text.trim();
    let ra_deg = if trimmed.contains(':') {
        parse_sexagesimal(trimmed)? * 15.0
    } else {
        trimmed.parse::<f64>()
            .map_err(|_| InvalidCoordinate::Unparseable(text.to_string()))?
    };
    validate(ra_deg, 0.0)?;
    Ok(ra_deg)
}

/// Parses a declination given either as sexagesimal degrees ("±DD:MM:SS.s")
/// or decimal degrees, returning degrees.
pub fn parse_dec(text: &str) -> Result<f64, InvalidCoordinate> {
    let trimmed = text.trim();
    let dec_deg = if trimmed.contains(':') {
        parse_sexagesimal(trimmed)?
    } else {
        trimmed.parse::<f64>()
            .map_err(|_| InvalidCoordinate::Unparseable(text.to_string()))?
    };
    validate(0.0, dec_deg)?;
    Ok(dec_deg)
}

fn parse_sexagesimal(text: &str) -> Result<f64, InvalidCoordinate> {
    let bad = || InvalidCoordinate::Unparseable(text.to_string());
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text.strip_prefix('+').unwrap_or(text)),
    };
    let mut parts = rest.split(':');
    let whole: f64 = parts.next().ok_or_else(bad)?
        .parse().map_err(|_| bad())?;
    let minutes: f64 = match parts.next() {
        Some(p) => p.parse().map_err(|_| bad())?,
        None => 0.0,
    };
    let seconds: f64 = match parts.next() {
        Some(p) => p.parse().map_err(|_| bad())?,
        None => 0.0,
    };
    if parts.next().is_some() || minutes < 0.0 || seconds < 0.0 {
        return Err(bad());
    }
    Ok(sign * (whole + minutes / 60.0 + seconds / 3600.0))
}
