//! Phase scheduling: plans a run from config, launches one task per phase at
//! its start offset, and coordinates shutdown on interrupt.

pub mod cancel;
pub mod engine;
pub mod report;

pub use cancel::{CancellationSignal, WaitOutcome};
pub use engine::{RunSettings, Scheduler, TestRun};
pub use report::{DeviceFailure, PhaseReport, PhaseStatus, RunReport};
