#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! GPU Burn-In Harness
//!
//! Drives every selected compute device at sustained load, continuously
//! verifies the work performed, and reports throughput, errors and
//! temperatures until the run deadline expires or the operator aborts.

pub mod config;
pub mod device;
pub mod monitor;
pub mod report;
pub mod shutdown;
pub mod telemetry;
pub mod worker;

pub use config::{BurnConfig, DeviceSelection, MemorySpec, Precision};
pub use device::{CpuBackend, DeviceBackend, DeviceCompute};
pub use monitor::{Monitor, WorkerState};
pub use report::{Report, ReportReceiver, ReportSender};
pub use shutdown::{CancelToken, ShutdownCoordinator};
