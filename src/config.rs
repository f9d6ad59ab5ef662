//! Run configuration for the burn harness.

use std::{str::FromStr, time::Duration};

/// How much device memory a worker should claim for its working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpec {
    /// Absolute byte count.
    Bytes(u64),
    /// Percentage of the currently free device memory, `1..=100`.
    Percent(u8),
}

impl Default for MemorySpec {
    fn default() -> Self {
        Self::Percent(90)
    }
}

impl MemorySpec {
    /// Resolve the spec against the device's currently free memory.
    #[must_use]
    pub fn resolve(self, free_bytes: u64) -> u64 {
        match self {
            Self::Bytes(b) => b,
            Self::Percent(p) => (u128::from(free_bytes) * u128::from(p) / 100) as u64,
        }
    }
}

impl FromStr for MemorySpec {
    type Err = ConfigError;

    /// Accepts `NNN` (MiB) or `NN%`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Memory(s.to_string());
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct.parse().map_err(|_| bad())?;
            if !(1..=100).contains(&pct) {
                return Err(bad());
            }
            Ok(Self::Percent(pct))
        } else {
            let mib: u64 = s.parse().map_err(|_| bad())?;
            if mib == 0 {
                return Err(bad());
            }
            Ok(Self::Bytes(mib * 1024 * 1024))
        }
    }
}

/// Floating-point precision of the stress workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

/// Which devices to burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Every device the backend enumerates.
    All,
    /// One explicit device index.
    Index(u32),
}

/// Settings for one burn run.
#[derive(Debug, Clone)]
pub struct BurnConfig {
    /// Total run length, a hard wall-clock deadline.
    pub duration: Duration,
    /// Working-set size per device.
    pub memory: MemorySpec,
    /// Workload precision.
    pub precision: Precision,
    /// Ask the backend for specialized matrix-math acceleration.
    pub tensor_cores: bool,
    /// Device selection.
    pub devices: DeviceSelection,
    /// Path to the verification routine, for backends that load one.
    pub compare_module: String,
    /// How long to wait for workers to stop cooperatively before
    /// abandoning them.
    pub grace: Duration,
    /// Sleep between monitor poll passes. Tunable; the monitor never
    /// relies on channel-readiness notification.
    pub poll_interval: Duration,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            memory: MemorySpec::default(),
            precision: Precision::Single,
            tensor_cores: false,
            devices: DeviceSelection::All,
            compare_module: "compare.ptx".to_string(),
            grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Errors in run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid memory spec {0:?} (expected MiB count or NN%)")]
    Memory(String),
}
