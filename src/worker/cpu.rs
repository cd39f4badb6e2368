//! CPU backend: one generate-encode-match loop per thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

use crate::crypto::{Keypair, OnionAddress};

use super::{FoundKey, WorkerContext, WorkerError};

/// Attempts between stop-flag checks and stats flushes.
const BATCH_SIZE: u64 = 512;

/// A pool of CPU worker threads.
pub struct CpuBackend {
    /// Worker thread handles (Option to allow taking during join)
    handles: Option<Vec<JoinHandle<()>>>,
    /// Workers that have not exited yet
    live: Arc<AtomicUsize>,
    /// The search-wide stop flag, set on drop so joining cannot hang
    stop: Arc<AtomicBool>,
}

impl CpuBackend {
    /// Spawns `workers` threads running against the shared context.
    pub fn start(workers: usize, ctx: &WorkerContext) -> Result<Self, WorkerError> {
        let live = Arc::new(AtomicUsize::new(workers));
        let handles = (0..workers)
            .map(|id| {
                let ctx = ctx.clone();
                let live = live.clone();
                thread::Builder::new()
                    .name(format!("onion-worker-{}", id))
                    .spawn(move || {
                        CpuWorker::new(id, ctx, OsRng).run();
                        live.fetch_sub(1, Ordering::Relaxed);
                    })
            })
            .collect::<Result<Vec<_>, _>>();

        let handles = match handles {
            Ok(handles) => handles,
            Err(e) => {
                // Workers that did spawn must not be left running.
                ctx.stop.store(true, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        Ok(Self {
            handles: Some(handles),
            live,
            stop: ctx.stop.clone(),
        })
    }

    /// Workers still running.
    pub fn alive(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Waits for every worker to exit.
    pub fn join(mut self) {
        self.join_handles();
    }

    fn join_handles(&mut self) {
        if let Some(handles) = self.handles.take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join_handles();
    }
}

/// A single worker loop. Owns its randomness source so no two workers
/// ever walk the same seed sequence.
pub(super) struct CpuWorker<R> {
    id: usize,
    ctx: WorkerContext,
    rng: R,
}

impl<R: RngCore + CryptoRng> CpuWorker<R> {
    pub(super) fn new(id: usize, ctx: WorkerContext, rng: R) -> Self {
        Self { id, ctx, rng }
    }

    /// Generates and tests candidates until stopped.
    ///
    /// A randomness failure ends this worker; the shared live count
    /// lets the controller notice when no workers remain.
    pub(super) fn run(mut self) {
        loop {
            if self.ctx.should_stop() {
                break;
            }

            for _ in 0..BATCH_SIZE {
                let keypair = match Keypair::try_generate(&mut self.rng) {
                    Ok(keypair) => keypair,
                    Err(e) => {
                        tracing::error!(worker = self.id, "key generation failed: {e}");
                        return;
                    }
                };

                let address = OnionAddress::from_public_key(keypair.public_key());
                if !self.ctx.patterns.matches_any(&address) {
                    continue;
                }

                for index in self.ctx.patterns.matching(&address) {
                    self.ctx.stats.add_matches(1);
                    let found = FoundKey {
                        pattern: self.ctx.patterns.patterns()[index].clone(),
                        address: address.clone(),
                        keypair: keypair.clone(),
                        discovered_at: SystemTime::now(),
                    };
                    // The receiver may already be gone during shutdown.
                    let _ = self.ctx.found_tx.send(found);
                }
            }

            self.ctx.stats.add_attempts(BATCH_SIZE);
        }
    }
}
