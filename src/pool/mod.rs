//! Worker pool: fixed-size task execution with depth-based backpressure and
//! per-worker telemetry.

pub mod backpressure;
pub mod telemetry;
pub mod workers;

pub use backpressure::{BackpressureController, PressureLevel};
pub use telemetry::{PipelineTelemetry, WorkerSlot};
pub use workers::{Task, TaskFuture, WorkerPool};
