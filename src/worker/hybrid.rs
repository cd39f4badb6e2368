//! Hybrid backend: CPU threads and the GPU dispatcher side by side.
//!
//! Both halves share the same stats object and result channel, so
//! attempt counts sum and matches merge without any coordination. No
//! search-space partitioning is needed: every worker samples seeds
//! independently and collisions are as improbable as the search itself.

use super::cpu::CpuBackend;
use super::gpu::{GpuBackend, GpuError};
use super::{BackendOptions, WorkerContext};

pub struct HybridBackend {
    cpu: CpuBackend,
    gpu: GpuBackend,
}

impl HybridBackend {
    /// Starts both halves. GPU unavailability fails the whole backend
    /// so the caller can fall back to CPU-only; a CPU spawn failure
    /// after GPU init tears the GPU half down via its Drop.
    pub fn start(options: &BackendOptions, ctx: &WorkerContext) -> Result<Self, GpuError> {
        let gpu = GpuBackend::start(&options.gpu, ctx)?;
        let cpu = CpuBackend::start(options.cpu_workers, ctx)
            .map_err(|e| GpuError::InitFailed(e.to_string()))?;
        Ok(Self { cpu, gpu })
    }

    pub fn alive(&self) -> usize {
        self.cpu.alive() + self.gpu.alive()
    }

    pub fn join(self) {
        self.cpu.join();
        self.gpu.join();
    }
}
