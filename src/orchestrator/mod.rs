//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (follow, cancel on Ctrl-C) and the
//! live registry view. CLI code calls into this module to keep presentation
//! separate from tracking.

mod controller;

pub(crate) use controller::{drive_run, watch_registry};
