//! Plate-solve assisted precision goto for amateur telescope mounts.
//!
//! The crate drives a camera and a goto mount in a closed loop: slew to the
//! target, take an image, plate solve it, sync the mount to where it really
//! points, and slew again, repeating until the solved position is within
//! tolerance of the target.

pub mod astro_util;
pub mod config;
pub mod devices;
pub mod dispatch;
pub mod goto_engine;
pub mod position;
pub mod solver;
