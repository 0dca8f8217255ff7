//! facefx: face-landmark driven camera effects.
//!
//! Frames flow from a capture source through a landmark detector into two
//! renderers sharing one surface: a full-frame color filter and a textured
//! decoration anchored to facial landmarks.

pub mod capture;
pub mod config;
pub mod effects;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod landmark;
pub mod output;
pub mod tracking;
pub mod utils;
