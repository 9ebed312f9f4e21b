//! Per-bill lifecycle: the controller loop and its period-end deadline.

pub mod controller;
pub mod deadline;

pub use controller::{ControllerReport, ControllerSettings, CreationError, LifecycleController, ResumeError};
pub use deadline::{Deadline, DeadlineScheduler, DeadlineState};
