//! Search backends and the types they share.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam_channel::Sender;

use crate::crypto::{Keypair, OnionAddress};
use crate::matcher::{Pattern, PatternSet};

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;
#[cfg(feature = "gpu")]
mod hybrid;

pub use cpu::CpuBackend;
#[cfg(feature = "gpu")]
pub use gpu::{GpuBackend, GpuError};
#[cfg(feature = "gpu")]
pub use hybrid::HybridBackend;

/// A verified match emitted by a backend.
///
/// One `FoundKey` is emitted per matching pattern, so an address that
/// satisfies several patterns appears once for each of them.
#[derive(Debug, Clone)]
pub struct FoundKey {
    /// The pattern this key satisfied
    pub pattern: Pattern,
    /// The derived onion address
    pub address: OnionAddress,
    /// The key pair that produced the address
    pub keypair: Keypair,
    /// When the match was found
    pub discovered_at: SystemTime,
}

/// Counters shared by every worker of a search.
///
/// Increments are relaxed; the numbers are for progress reporting and
/// may briefly lag the workers.
#[derive(Debug, Default)]
pub struct SearchStats {
    /// Candidate keys generated and tested
    pub attempts: AtomicU64,
    /// Matches found (counted per matching pattern)
    pub matches: AtomicU64,
}

impl SearchStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_attempts(&self, n: u64) {
        self.attempts.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_matches(&self, n: u64) {
        self.matches.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn total_matches(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }
}

/// Everything a backend needs to run: what to look for, where to send
/// hits, and the shared counters and stop flag.
#[derive(Clone)]
pub struct WorkerContext {
    /// Patterns to match candidates against
    pub patterns: PatternSet,
    /// Shared counters
    pub stats: Arc<SearchStats>,
    /// Channel matches are sent through
    pub found_tx: Sender<FoundKey>,
    /// Cooperative stop flag, observed once per worker iteration
    pub stop: Arc<AtomicBool>,
}

impl WorkerContext {
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Which backend the user asked for.
///
/// All variants parse regardless of compiled features; an unavailable
/// backend degrades to CPU at selection time with a warning rather
/// than failing at the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// Best available: hybrid, then GPU, then CPU
    #[default]
    Auto,
    /// CPU worker threads only
    Cpu,
    /// GPU only (requires the `gpu` feature and a usable device)
    Gpu,
    /// CPU and GPU together
    Hybrid,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Auto => write!(f, "auto"),
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Gpu => write!(f, "gpu"),
            BackendKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// GPU tuning parameters. Carried unconditionally so configuration
/// code does not grow feature-conditional fields; only the `gpu`
/// backend reads them.
#[derive(Debug, Clone)]
pub struct GpuOptions {
    /// Device index within the first OpenCL platform
    pub device_index: usize,
    /// Seeds evaluated per kernel dispatch
    pub batch_size: usize,
    /// Path to the precompiled device program
    pub program: PathBuf,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            batch_size: 1 << 18,
            program: PathBuf::from("onion-vanity.clbin"),
        }
    }
}

/// Parameters for starting a backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// CPU worker thread count
    pub cpu_workers: usize,
    /// GPU tuning
    pub gpu: GpuOptions,
}

/// Errors raised while starting a backend.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A running backend.
pub enum Backend {
    Cpu(CpuBackend),
    #[cfg(feature = "gpu")]
    Gpu(GpuBackend),
    #[cfg(feature = "gpu")]
    Hybrid(HybridBackend),
}

impl Backend {
    /// Short operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Cpu(_) => "cpu",
            #[cfg(feature = "gpu")]
            Backend::Gpu(_) => "gpu",
            #[cfg(feature = "gpu")]
            Backend::Hybrid(_) => "hybrid",
        }
    }

    /// Number of workers still running.
    pub fn alive(&self) -> usize {
        match self {
            Backend::Cpu(b) => b.alive(),
            #[cfg(feature = "gpu")]
            Backend::Gpu(b) => b.alive(),
            #[cfg(feature = "gpu")]
            Backend::Hybrid(b) => b.alive(),
        }
    }

    /// Waits for every worker to exit. Callers set the stop flag first;
    /// joining without it blocks until the search space is exhausted,
    /// which for this search space means forever.
    pub fn join(self) {
        match self {
            Backend::Cpu(b) => b.join(),
            #[cfg(feature = "gpu")]
            Backend::Gpu(b) => b.join(),
            #[cfg(feature = "gpu")]
            Backend::Hybrid(b) => b.join(),
        }
    }
}

/// Starts the backend the user asked for, degrading to CPU when the
/// accelerator is unavailable.
pub fn select_backend(
    kind: BackendKind,
    options: &BackendOptions,
    ctx: &WorkerContext,
) -> Result<Backend, WorkerError> {
    match kind {
        BackendKind::Cpu => start_cpu(options, ctx),
        BackendKind::Gpu => start_gpu(options, ctx),
        BackendKind::Hybrid | BackendKind::Auto => start_hybrid(options, ctx),
    }
}

#[cfg(feature = "gpu")]
fn start_gpu(options: &BackendOptions, ctx: &WorkerContext) -> Result<Backend, WorkerError> {
    match GpuBackend::start(&options.gpu, ctx) {
        Ok(gpu) => Ok(Backend::Gpu(gpu)),
        Err(e) => {
            tracing::warn!("accelerator unavailable ({e}), falling back to cpu");
            start_cpu(options, ctx)
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn start_gpu(options: &BackendOptions, ctx: &WorkerContext) -> Result<Backend, WorkerError> {
    tracing::warn!("built without gpu support, falling back to cpu");
    start_cpu(options, ctx)
}

#[cfg(feature = "gpu")]
fn start_hybrid(options: &BackendOptions, ctx: &WorkerContext) -> Result<Backend, WorkerError> {
    match HybridBackend::start(options, ctx) {
        Ok(hybrid) => Ok(Backend::Hybrid(hybrid)),
        Err(e) => {
            tracing::warn!("accelerator unavailable ({e}), running cpu only");
            start_cpu(options, ctx)
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn start_hybrid(options: &BackendOptions, ctx: &WorkerContext) -> Result<Backend, WorkerError> {
    start_cpu(options, ctx)
}

fn start_cpu(options: &BackendOptions, ctx: &WorkerContext) -> Result<Backend, WorkerError> {
    Ok(Backend::Cpu(CpuBackend::start(options.cpu_workers, ctx)?))
}
