//! Device compute capability.
//!
//! The harness only ever talks to devices through [`DeviceBackend`] and
//! [`DeviceCompute`]; what the stress kernel actually computes is the
//! backend's business. The in-tree [`CpuBackend`] is a reference
//! implementation (a seeded matrix product re-verified against a golden
//! result) so the harness runs and can be exercised on any machine.

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::{BurnConfig, Precision};

/// Number of in-flight completion markers a worker rotates through.
/// Two slots let compute for pass *k+1* issue while pass *k-1* settles.
pub const MARKER_SLOTS: usize = 2;

/// Errors raised by a device backend. All of them are fatal to the one
/// worker that hit them, never to the run.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Device, context or compute-library setup failed.
    #[error("device init failed: {0}")]
    Init(String),
    /// The requested working set cannot host two input buffers plus at
    /// least one output buffer.
    #[error("working set needs {needed} bytes but only {budget} were granted")]
    ResourceExhausted { needed: u64, budget: u64 },
    /// The device failed mid-run.
    #[error("compute failure: {0}")]
    Compute(String),
}

/// Static description of one device, for the listing mode.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub total_memory: u64,
}

/// An open per-device stress handle. One worker owns exactly one of these;
/// all resources it holds die with it.
///
/// `run_iteration` and `verify` may enqueue asynchronous device work; the
/// marker pair (`record_marker` / `marker_ready`) is how the worker keeps
/// the device queue at most two passes deep.
pub trait DeviceCompute: Send {
    /// Perform (or enqueue) one pass of stress work.
    fn run_iteration(&mut self) -> Result<(), DeviceError>;

    /// Check the most recent pass and return the number of faulty elements
    /// that have settled since the last call.
    fn verify(&mut self) -> Result<u64, DeviceError>;

    /// Drop a completion marker behind everything enqueued so far.
    fn record_marker(&mut self, slot: usize) -> Result<(), DeviceError>;

    /// Whether the work behind a previously recorded marker has settled.
    fn marker_ready(&mut self, slot: usize) -> Result<bool, DeviceError>;

    /// How many workload iterations one `run_iteration` pass performs.
    fn iterations_per_pass(&self) -> u64;
}

/// Device enumeration and construction.
pub trait DeviceBackend: Send + Sync {
    fn device_count(&self) -> Result<usize, DeviceError>;

    fn describe(&self, index: u32) -> Result<DeviceInfo, DeviceError>;

    /// Floating-point operations one workload iteration represents, for
    /// throughput reporting.
    fn ops_per_iteration(&self) -> u64;

    /// Initialize a device and allocate its working set per the run
    /// configuration. Fails with [`DeviceError::ResourceExhausted`] when
    /// the budget cannot host a minimal working set.
    fn open(&self, index: u32, config: &BurnConfig) -> Result<Box<dyn DeviceCompute>, DeviceError>;
}

/// Square matrix dimension of the reference workload.
const MATRIX_DIM: usize = 128;

/// Reference backend: burns host cores with repeated seeded matrix
/// products. Presents a single device whose "memory" is a fixed pool.
pub struct CpuBackend {
    pool_bytes: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self {
            pool_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CpuBackend {
    #[must_use]
    pub fn with_pool(pool_bytes: u64) -> Self {
        Self { pool_bytes }
    }
}

impl DeviceBackend for CpuBackend {
    fn device_count(&self) -> Result<usize, DeviceError> {
        Ok(1)
    }

    fn describe(&self, index: u32) -> Result<DeviceInfo, DeviceError> {
        if index != 0 {
            return Err(DeviceError::Init(format!("no such device: {index}")));
        }
        Ok(DeviceInfo {
            index,
            name: "CPU reference workload".to_string(),
            total_memory: self.pool_bytes,
        })
    }

    fn ops_per_iteration(&self) -> u64 {
        // One multiply-add per inner-loop step of an n^3 matrix product.
        2 * (MATRIX_DIM as u64).pow(3)
    }

    fn open(&self, index: u32, config: &BurnConfig) -> Result<Box<dyn DeviceCompute>, DeviceError> {
        if index != 0 {
            return Err(DeviceError::Init(format!("no such device: {index}")));
        }
        if config.tensor_cores {
            tracing::debug!("reference backend has no matrix-math acceleration, ignoring");
        }
        let budget = config.memory.resolve(self.pool_bytes);
        match config.precision {
            Precision::Single => Ok(Box::new(CpuDevice::<f32>::new(budget)?)),
            Precision::Double => Ok(Box::new(CpuDevice::<f64>::new(budget)?)),
        }
    }
}

trait Element:
    Copy
    + PartialEq
    + Send
    + From<f32>
    + std::ops::Add<Output = Self>
    + std::ops::Mul<Output = Self>
    + 'static
{
}

impl Element for f32 {}
impl Element for f64 {}

struct CpuDevice<T> {
    a: Vec<T>,
    b: Vec<T>,
    /// Product computed once at init; every later product must match it.
    golden: Vec<T>,
    /// `iters` rotating output slots.
    out: Vec<T>,
    iters: u64,
    settled_faults: u64,
}

impl<T: Element> CpuDevice<T> {
    fn new(budget: u64) -> Result<Self, DeviceError> {
        let result_size = (size_of::<T>() * MATRIX_DIM * MATRIX_DIM) as u64;
        // Two input buffers plus at least one output slot.
        let needed = 3 * result_size;
        if budget < needed {
            return Err(DeviceError::ResourceExhausted { needed, budget });
        }
        let iters = (budget - 2 * result_size) / result_size;

        let n = MATRIX_DIM * MATRIX_DIM;
        let mut rng = StdRng::seed_from_u64(10);
        let mut fill = |v: &mut Vec<T>| {
            v.extend(
                (0..n).map(|_| T::from(rng.random_range(0..1_000_000) as f32 / 100_000.0)),
            );
        };
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        fill(&mut a);
        fill(&mut b);

        let mut golden = vec![T::from(0.0); n];
        matmul(&a, &b, &mut golden);

        Ok(Self {
            a,
            b,
            golden,
            out: vec![T::from(0.0); n * iters as usize],
            iters,
            settled_faults: 0,
        })
    }

    #[cfg(test)]
    fn corrupt_slot(&mut self, slot: usize) {
        let n = MATRIX_DIM * MATRIX_DIM;
        self.out[slot * n] = T::from(-1.0);
    }
}

impl<T: Element> DeviceCompute for CpuDevice<T> {
    fn run_iteration(&mut self) -> Result<(), DeviceError> {
        let n = MATRIX_DIM * MATRIX_DIM;
        for slot in self.out.chunks_mut(n) {
            slot.fill(T::from(0.0));
            matmul(&self.a, &self.b, slot);
        }
        Ok(())
    }

    fn verify(&mut self) -> Result<u64, DeviceError> {
        let n = MATRIX_DIM * MATRIX_DIM;
        self.settled_faults = self
            .out
            .chunks(n)
            .map(|slot| {
                slot.iter()
                    .zip(&self.golden)
                    .filter(|(got, want)| got != want)
                    .count() as u64
            })
            .sum();
        Ok(self.settled_faults)
    }

    fn record_marker(&mut self, _slot: usize) -> Result<(), DeviceError> {
        Ok(())
    }

    fn marker_ready(&mut self, _slot: usize) -> Result<bool, DeviceError> {
        // Host work is synchronous: everything enqueued has settled.
        Ok(true)
    }

    fn iterations_per_pass(&self) -> u64 {
        self.iters
    }
}

fn matmul<T: Element>(a: &[T], b: &[T], c: &mut [T]) {
    let n = MATRIX_DIM;
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                c[i * n + j] = c[i * n + j] + aik * b[k * n + j];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySpec;

    fn result_size<T>() -> u64 {
        (size_of::<T>() * MATRIX_DIM * MATRIX_DIM) as u64
    }

    #[test]
    fn test_working_set_too_small() {
        let budget = 3 * result_size::<f32>() - 1;
        match CpuDevice::<f32>::new(budget) {
            Err(DeviceError::ResourceExhausted { needed, .. }) => {
                assert_eq!(needed, 3 * result_size::<f32>());
            }
            other => panic!("expected ResourceExhausted, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_output_slots_from_budget() {
        // Budget for two inputs plus three outputs.
        let dev = CpuDevice::<f32>::new(5 * result_size::<f32>()).unwrap();
        assert_eq!(dev.iterations_per_pass(), 3);
    }

    #[test]
    fn test_clean_pass_verifies_clean() {
        let mut dev = CpuDevice::<f32>::new(3 * result_size::<f32>()).unwrap();
        dev.run_iteration().unwrap();
        assert_eq!(dev.verify().unwrap(), 0);
    }

    #[test]
    fn test_corruption_is_counted() {
        let mut dev = CpuDevice::<f64>::new(4 * result_size::<f64>()).unwrap();
        dev.run_iteration().unwrap();
        dev.corrupt_slot(1);
        assert_eq!(dev.verify().unwrap(), 1);
        // The next pass rewrites every slot.
        dev.run_iteration().unwrap();
        assert_eq!(dev.verify().unwrap(), 0);
    }

    #[test]
    fn test_open_respects_precision_and_memory() {
        let backend = CpuBackend::with_pool(8 * result_size::<f32>());
        let config = BurnConfig {
            memory: MemorySpec::Percent(50),
            ..BurnConfig::default()
        };
        // 50% of the pool hosts two inputs plus two outputs.
        let dev = backend.open(0, &config).unwrap();
        assert_eq!(dev.iterations_per_pass(), 2);

        let config = BurnConfig {
            precision: Precision::Double,
            memory: MemorySpec::Percent(50),
            ..BurnConfig::default()
        };
        assert!(matches!(
            backend.open(0, &config),
            Err(DeviceError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_unknown_device_index() {
        let backend = CpuBackend::default();
        assert!(matches!(
            backend.open(7, &BurnConfig::default()),
            Err(DeviceError::Init(_))
        ));
    }
}
