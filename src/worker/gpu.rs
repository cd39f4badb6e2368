//! GPU backend using OpenCL.
//!
//! Division of labor per batch:
//! 1. Host generates a batch of random seeds
//! 2. Device derives public keys, encodes addresses and matches patterns
//! 3. Device returns only the indices of matching seeds
//! 4. Host re-derives each hit and verifies it before emitting
//!
//! The device program ships as a precompiled binary artifact; it is
//! loaded from disk at startup and never compiled from source here. A
//! missing artifact or device makes the whole backend unavailable,
//! which callers treat as a fallback condition rather than an error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::program::Program;
use opencl3::types::{cl_uchar, cl_uint, CL_BLOCKING};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{char_to_value, Keypair, OnionAddress, ADDRESS_LEN};
use crate::matcher::{Pattern, PatternPosition};

use super::{FoundKey, GpuOptions, WorkerContext};

/// Kernel entry point expected in the device program.
const KERNEL_NAME: &str = "derive_and_match";

/// Upper bound on hits returned per batch. Matches are rare enough
/// that overflow means a degenerate pattern, not lost work: the host
/// re-verifies, and dropped hits only delay the next one.
const MAX_HITS_PER_BATCH: u32 = 256;

/// Transient batch errors tolerated in a row before the worker exits
/// and lets the controller notice the backend is gone.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Errors a batch retry cannot recover from. Weak or exhausted
/// randomness ends the worker immediately; device hiccups are retried
/// up to [`MAX_CONSECUTIVE_FAILURES`].
fn is_fatal(error: &GpuError) -> bool {
    matches!(error, GpuError::Randomness(_))
}

/// Errors that make the GPU backend unavailable or a batch fail.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU device found")]
    DeviceNotFound,

    #[error("device program not found at {0}")]
    ProgramMissing(PathBuf),

    #[error("GPU initialization failed: {0}")]
    InitFailed(String),

    #[error("device program load failed: {0}")]
    ProgramLoad(String),

    #[error("buffer operation failed: {0}")]
    BufferError(String),

    #[error("kernel execution failed: {0}")]
    KernelExec(String),

    #[error("randomness source failed: {0}")]
    Randomness(#[from] rand::Error),
}

/// Pattern layout the device program expects (`pattern_config_t`).
#[repr(C)]
#[derive(Clone, Copy)]
struct DevicePatternConfig {
    /// 0=prefix, 1=suffix, 2=anywhere
    position: u32,
    /// Pattern length in characters
    len: u32,
    /// 5-bit base32 values, the representation the device encoder
    /// produces, padded with zeros
    values: [u8; ADDRESS_LEN],
}

fn pattern_to_device_config(pattern: &Pattern) -> DevicePatternConfig {
    let mut values = [0u8; ADDRESS_LEN];
    for (i, c) in pattern.text().chars().enumerate() {
        // Pattern construction already rejected anything outside the
        // alphabet.
        values[i] = char_to_value(c).unwrap_or(0);
    }
    DevicePatternConfig {
        position: match pattern.position() {
            PatternPosition::Prefix => 0,
            PatternPosition::Suffix => 1,
            PatternPosition::Anywhere => 2,
        },
        len: pattern.text().len() as u32,
        values,
    }
}

/// A single-threaded GPU backend dispatching seed batches to a device.
pub struct GpuBackend {
    handle: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

impl GpuBackend {
    /// Initializes the device and spawns the dispatch thread.
    ///
    /// All unavailability conditions (no device, out-of-range index,
    /// missing or unloadable program artifact) surface here, before
    /// any thread is spawned.
    pub fn start(options: &GpuOptions, ctx: &WorkerContext) -> Result<Self, GpuError> {
        let worker = GpuWorker::new(options, ctx.clone())?;
        let live = Arc::new(AtomicUsize::new(1));
        let stop = ctx.stop.clone();

        let thread_live = live.clone();
        let handle = thread::Builder::new()
            .name("onion-gpu-worker".into())
            .spawn(move || {
                worker.run();
                thread_live.fetch_sub(1, Ordering::Relaxed);
            })
            .map_err(|e| GpuError::InitFailed(e.to_string()))?;

        Ok(Self {
            handle: Some(handle),
            live,
            stop,
        })
    }

    pub fn alive(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn join(mut self) {
        self.join_handle();
    }

    fn join_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join_handle();
    }
}

struct GpuWorker {
    ctx: WorkerContext,
    context: Context,
    queue: CommandQueue,
    kernel: Kernel,
    batch_size: usize,
    configs: Vec<DevicePatternConfig>,
}

impl GpuWorker {
    fn new(options: &GpuOptions, ctx: WorkerContext) -> Result<Self, GpuError> {
        // Check the artifact before touching the OpenCL runtime so a
        // missing file is reported the same way on GPU-less machines.
        let binary = std::fs::read(&options.program)
            .map_err(|_| GpuError::ProgramMissing(options.program.clone()))?;

        let device_ids =
            get_all_devices(CL_DEVICE_TYPE_GPU).map_err(|e| GpuError::InitFailed(e.to_string()))?;
        if device_ids.len() <= options.device_index {
            return Err(GpuError::DeviceNotFound);
        }

        let device = Device::new(device_ids[options.device_index]);
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        tracing::info!("using GPU device: {device_name}");

        let context =
            Context::from_device(&device).map_err(|e| GpuError::InitFailed(e.to_string()))?;
        let queue = CommandQueue::create_default_with_properties(&context, 0, 0)
            .map_err(|e| GpuError::InitFailed(e.to_string()))?;

        let program = Program::create_and_build_from_binary(&context, &[&binary], "")
            .map_err(|e| GpuError::ProgramLoad(e.to_string()))?;
        let kernel =
            Kernel::create(&program, KERNEL_NAME).map_err(|e| GpuError::ProgramLoad(e.to_string()))?;

        let configs = ctx
            .patterns
            .patterns()
            .iter()
            .map(pattern_to_device_config)
            .collect();

        Ok(Self {
            ctx,
            context,
            queue,
            kernel,
            batch_size: options.batch_size,
            configs,
        })
    }

    fn run(&self) {
        let mut consecutive_failures = 0u32;
        loop {
            if self.ctx.should_stop() {
                break;
            }

            match self.run_batch() {
                Ok(()) => consecutive_failures = 0,
                Err(e) if is_fatal(&e) => {
                    // Randomness failure must kill the worker, never be
                    // retried against a weaker source.
                    tracing::error!("GPU worker stopping: {e}");
                    return;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::error!(
                            "GPU worker stopping after {consecutive_failures} failed batches: {e}"
                        );
                        return;
                    }
                    tracing::warn!("GPU batch failed: {e}");
                    thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    }

    /// Dispatches one batch and re-verifies whatever the device flagged.
    fn run_batch(&self) -> Result<(), GpuError> {
        let mut seeds = vec![0u8; self.batch_size * 32];
        OsRng.try_fill_bytes(&mut seeds)?;

        let mut seeds_buf = unsafe {
            Buffer::<cl_uchar>::create(
                &self.context,
                CL_MEM_READ_ONLY,
                seeds.len(),
                std::ptr::null_mut(),
            )
            .map_err(|e| GpuError::BufferError(e.to_string()))?
        };

        let config_bytes = unsafe {
            std::slice::from_raw_parts(
                self.configs.as_ptr() as *const u8,
                self.configs.len() * std::mem::size_of::<DevicePatternConfig>(),
            )
        };
        let mut configs_buf = unsafe {
            Buffer::<cl_uchar>::create(
                &self.context,
                CL_MEM_READ_ONLY,
                config_bytes.len(),
                std::ptr::null_mut(),
            )
            .map_err(|e| GpuError::BufferError(e.to_string()))?
        };

        let mut hits_buf = unsafe {
            Buffer::<cl_uint>::create(
                &self.context,
                CL_MEM_WRITE_ONLY,
                MAX_HITS_PER_BATCH as usize,
                std::ptr::null_mut(),
            )
            .map_err(|e| GpuError::BufferError(e.to_string()))?
        };

        let mut hit_count_buf = unsafe {
            Buffer::<cl_uint>::create(&self.context, CL_MEM_READ_WRITE, 1, std::ptr::null_mut())
                .map_err(|e| GpuError::BufferError(e.to_string()))?
        };

        let zero: [u32; 1] = [0];
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut seeds_buf, CL_BLOCKING, 0, &seeds, &[])
                .map_err(|e| GpuError::BufferError(e.to_string()))?;
            self.queue
                .enqueue_write_buffer(&mut configs_buf, CL_BLOCKING, 0, config_bytes, &[])
                .map_err(|e| GpuError::BufferError(e.to_string()))?;
            self.queue
                .enqueue_write_buffer(&mut hit_count_buf, CL_BLOCKING, 0, &zero, &[])
                .map_err(|e| GpuError::BufferError(e.to_string()))?;
        }

        let num_patterns = self.configs.len() as u32;
        let max_hits = MAX_HITS_PER_BATCH;
        let kernel_event = unsafe {
            ExecuteKernel::new(&self.kernel)
                .set_arg(&seeds_buf)
                .set_arg(&configs_buf)
                .set_arg(&num_patterns)
                .set_arg(&mut hits_buf)
                .set_arg(&mut hit_count_buf)
                .set_arg(&max_hits)
                .set_global_work_size(self.batch_size)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| GpuError::KernelExec(e.to_string()))?
        };
        kernel_event
            .wait()
            .map_err(|e| GpuError::KernelExec(e.to_string()))?;

        let mut count_out = [0u32; 1];
        unsafe {
            self.queue
                .enqueue_read_buffer(&hit_count_buf, CL_BLOCKING, 0, &mut count_out, &[])
                .map_err(|e| GpuError::BufferError(e.to_string()))?;
        }

        let num_hits = (count_out[0] as usize).min(MAX_HITS_PER_BATCH as usize);
        if num_hits > 0 {
            let mut hits = vec![0u32; MAX_HITS_PER_BATCH as usize];
            unsafe {
                self.queue
                    .enqueue_read_buffer(&hits_buf, CL_BLOCKING, 0, &mut hits, &[])
                    .map_err(|e| GpuError::BufferError(e.to_string()))?;
            }

            for &seed_index in &hits[..num_hits] {
                let Some(chunk) = seeds.chunks_exact(32).nth(seed_index as usize) else {
                    continue;
                };
                let mut seed = [0u8; 32];
                seed.copy_from_slice(chunk);
                self.verify_and_emit(seed);
            }
        }

        self.ctx.stats.add_attempts(self.batch_size as u64);
        Ok(())
    }

    /// The device result is advisory; nothing is reported without a
    /// full host-side re-derivation.
    fn verify_and_emit(&self, seed: [u8; 32]) {
        let keypair = Keypair::from_seed(seed);
        let address = OnionAddress::from_public_key(keypair.public_key());
        for index in self.ctx.patterns.matching(&address) {
            self.ctx.stats.add_matches(1);
            let found = FoundKey {
                pattern: self.ctx.patterns.patterns()[index].clone(),
                address: address.clone(),
                keypair: keypair.clone(),
                discovered_at: SystemTime::now(),
            };
            let _ = self.ctx.found_tx.send(found);
        }
    }
}
