//! Spherical-astronomy helpers: Julian dates, angular separation, and
//! equatorial precession between epochs.

use std::time::SystemTime;

use astro::angle::anglr_sepr;
use astro::time::{julian_day, CalType, Date};
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Julian date of the J2000.0 epoch.
pub const JD_J2000: f64 = 2451545.0;

const DAYS_PER_CENTURY: f64 = 36525.0;

/// Returns the Julian date for the given instant.
pub fn julian_date(time: SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(time);
    let day_fraction =
        dt_utc.time().num_seconds_from_midnight() as f64 / 86400.0;
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64 + day_fraction,
        cal_type: CalType::Gregorian,
    };
    julian_day(&date)
}

/// Returns the great-circle separation, in degrees, between two positions
/// given in degrees.
pub fn angular_separation_deg(
    p0_ra: f64,
    p0_dec: f64,
    p1_ra: f64,
    p1_dec: f64,
) -> f64 {
    anglr_sepr(
        p0_ra.to_radians(),
        p0_dec.to_radians(),
        p1_ra.to_radians(),
        p1_dec.to_radians(),
    )
    .to_degrees()
}

/// Rigorous equatorial precession (Meeus, "Astronomical Algorithms" ch. 21)
/// from the mean equinox of `jd_from` to that of `jd_to`. Input and output
/// RA/Dec are in degrees; output RA is wrapped into [0, 360).
///
/// Swapping the two Julian dates gives the inverse transform, so a round
/// trip reproduces the input to floating-point precision.
pub fn precess(ra_deg: f64, dec_deg: f64, jd_from: f64, jd_to: f64)
               -> (f64, f64) {
    let t_big = (jd_from - JD_J2000) / DAYS_PER_CENTURY;
    let t = (jd_to - jd_from) / DAYS_PER_CENTURY;

    // Accumulated precession angles, in arcseconds.
    let zeta = (2306.2181 + 1.39656 * t_big - 0.000139 * t_big * t_big) * t
        + (0.30188 - 0.000344 * t_big) * t * t
        + 0.017998 * t * t * t;
    let z = (2306.2181 + 1.39656 * t_big - 0.000139 * t_big * t_big) * t
        + (1.09468 + 0.000066 * t_big) * t * t
        + 0.018203 * t * t * t;
    let theta = (2004.3109 - 0.85330 * t_big - 0.000217 * t_big * t_big) * t
        - (0.42665 + 0.000217 * t_big) * t * t
        - 0.041833 * t * t * t;

    let zeta = (zeta / 3600.0).to_radians();
    let z = (z / 3600.0).to_radians();
    let theta = (theta / 3600.0).to_radians();

    let ra = ra_deg.to_radians();
    let dec = dec_deg.to_radians();

    let a = dec.cos() * (ra + zeta).sin();
    let b = theta.cos() * dec.cos() * (ra + zeta).cos()
        - theta.sin() * dec.sin();
    let c = theta.sin() * dec.cos() * (ra + zeta).cos()
        + theta.cos() * dec.sin();

    let ra_out = (a.atan2(b) + z).to_degrees().rem_euclid(360.0);
    let dec_out = c.asin().to_degrees();
    (ra_out, dec_out)
}
