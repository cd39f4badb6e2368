//! Search lifecycle: start backends, collect matches, persist keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::matcher::PatternSet;
use crate::store::{KeyStore, StoreError};
use crate::worker::{
    select_backend, Backend, BackendKind, BackendOptions, FoundKey, SearchStats, WorkerContext,
    WorkerError,
};

/// Lifecycle of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// Configured but not started
    Idle,
    /// Backends running
    Running,
    /// Halted by request or backend failure before completion
    Stopped,
    /// Every pattern reached its target match count
    Completed,
}

/// Events surfaced by [`SearchController::poll`].
#[derive(Debug)]
pub enum SearchEvent {
    /// A match was found and its key file written
    Found {
        found: FoundKey,
        path: std::path::PathBuf,
    },
    /// A match was found but could not be written; the key is still in
    /// memory so the caller can retry or record it elsewhere
    PersistFailed { found: FoundKey, error: StoreError },
    /// Every worker exited without being asked to stop
    BackendFailed,
}

/// Errors from starting a search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search already started")]
    AlreadyStarted,
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Point-in-time view of search progress.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub matches: u64,
    pub elapsed: Duration,
    pub keys_per_second: f64,
    pub backend: &'static str,
}

/// Owns the backends and result channel of one search.
///
/// Parameters are fixed at construction; changing anything means
/// stopping and building a new controller.
pub struct SearchController {
    patterns: PatternSet,
    store: KeyStore,
    backend_kind: BackendKind,
    options: BackendOptions,
    /// Matches wanted per pattern; 0 means run until stopped
    target: u64,
    /// Outstanding matches per pattern, meaningful when target > 0
    remaining: Vec<u64>,
    state: SearchState,
    stats: Arc<SearchStats>,
    stop: Arc<AtomicBool>,
    backend: Option<Backend>,
    found_rx: Option<Receiver<FoundKey>>,
    pending: VecDeque<SearchEvent>,
    started_at: Option<Instant>,
}

impl SearchController {
    /// Builds an idle controller. The pattern set and store are already
    /// validated by their constructors, so nothing here can fail before
    /// `start`.
    pub fn new(
        patterns: PatternSet,
        store: KeyStore,
        backend_kind: BackendKind,
        options: BackendOptions,
        matches_per_pattern: u64,
    ) -> Self {
        let remaining = vec![matches_per_pattern; patterns.len()];
        Self {
            patterns,
            store,
            backend_kind,
            options,
            target: matches_per_pattern,
            remaining,
            state: SearchState::Idle,
            stats: Arc::new(SearchStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
            backend: None,
            found_rx: None,
            pending: VecDeque::new(),
            started_at: None,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Flag handle for signal handlers; setting it stops the search.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Starts the backends. Valid only once, from the idle state.
    pub fn start(&mut self) -> Result<(), SearchError> {
        if self.state != SearchState::Idle {
            return Err(SearchError::AlreadyStarted);
        }

        for pattern in self.patterns.patterns() {
            if pattern.is_unreachable() {
                tracing::warn!(
                    "suffix pattern '{}' can never match: every address ends in 'd'",
                    pattern.text()
                );
            }
        }

        let (found_tx, found_rx) = unbounded();
        let ctx = WorkerContext {
            patterns: self.patterns.clone(),
            stats: self.stats.clone(),
            found_tx,
            stop: self.stop.clone(),
        };
        // The context and its sender clones now live in the workers
        // only, so the channel disconnects when the last worker exits.
        let backend = select_backend(self.backend_kind, &self.options, &ctx)?;
        tracing::info!(backend = backend.label(), "search started");

        self.backend = Some(backend);
        self.found_rx = Some(found_rx);
        self.started_at = Some(Instant::now());
        self.state = SearchState::Running;
        Ok(())
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout or when the search is no longer
    /// running and no drained events remain.
    pub fn poll(&mut self, timeout: Duration) -> Option<SearchEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.state != SearchState::Running {
            return None;
        }

        let received = self.found_rx.as_ref()?.recv_timeout(timeout);
        match received {
            Ok(found) => {
                let event = self.process(found);
                if self.targets_met() {
                    self.finish(SearchState::Completed);
                }
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.backend_lost() {
                    tracing::error!("all workers exited unexpectedly");
                    self.finish(SearchState::Stopped);
                    return Some(SearchEvent::BackendFailed);
                }
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Channel closure means every sender, hence every
                // worker, is gone.
                if self.stop.load(Ordering::Relaxed) {
                    self.finish(SearchState::Stopped);
                    self.pending.pop_front()
                } else {
                    tracing::error!("all workers exited unexpectedly");
                    self.finish(SearchState::Stopped);
                    Some(SearchEvent::BackendFailed)
                }
            }
        }
    }

    /// Stops the search, joins every worker and drains the channel so
    /// no match found before the stop signal is lost. Already-drained
    /// events stay available through [`poll`](Self::poll).
    pub fn stop(&mut self) {
        if self.state == SearchState::Running {
            self.finish(SearchState::Stopped);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let attempts = self.stats.total_attempts();
        let secs = elapsed.as_secs_f64();
        StatsSnapshot {
            attempts,
            matches: self.stats.total_matches(),
            elapsed,
            keys_per_second: if secs > 0.0 { attempts as f64 / secs } else { 0.0 },
            backend: self.backend.as_ref().map_or("-", Backend::label),
        }
    }

    /// Expected seconds until the next match at the current rate.
    pub fn estimated_seconds_to_match(&self) -> Option<f64> {
        let rate = self.snapshot().keys_per_second;
        if rate > 0.0 {
            Some(self.patterns.estimated_attempts() / rate)
        } else {
            None
        }
    }

    /// Persists a found key and accounts it against its pattern.
    fn process(&mut self, found: FoundKey) -> SearchEvent {
        if let Some(index) = self
            .patterns
            .patterns()
            .iter()
            .position(|p| *p == found.pattern)
        {
            if self.remaining[index] > 0 {
                self.remaining[index] -= 1;
            }
        }

        match self.store.save(&found) {
            Ok(path) => SearchEvent::Found { found, path },
            Err(error) => {
                tracing::error!("failed to persist {}: {error}", found.address);
                SearchEvent::PersistFailed { found, error }
            }
        }
    }

    fn targets_met(&self) -> bool {
        self.target > 0 && self.remaining.iter().all(|&r| r == 0)
    }

    fn backend_lost(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
            && self.backend.as_ref().is_some_and(|b| b.alive() == 0)
    }

    /// Signals stop, joins the workers, then drains the channel.
    fn finish(&mut self, state: SearchState) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(backend) = self.backend.take() {
            backend.join();
        }
        if let Some(rx) = self.found_rx.take() {
            for found in rx.try_iter() {
                let event = self.process(found);
                self.pending.push_back(event);
            }
        }
        self.state = if self.targets_met() && state != SearchState::Stopped {
            SearchState::Completed
        } else {
            state
        };
        tracing::info!(state = ?self.state, "search finished");
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(backend) = self.backend.take() {
            backend.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Pattern, PatternPosition};
    use crate::worker::GpuOptions;

    const KEY_FILE_HEADER: &[u8] = b"== ed25519v1-secret: type0 ==\0\0\0";

    fn controller(dir: &std::path::Path, patterns: Vec<Pattern>, count: u64) -> SearchController {
        SearchController::new(
            PatternSet::new(patterns).unwrap(),
            KeyStore::open(dir).unwrap(),
            BackendKind::Cpu,
            BackendOptions {
                cpu_workers: 2,
                gpu: GpuOptions::default(),
            },
            count,
        )
    }

    #[test]
    fn finds_and_persists_prefix_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(
            dir.path(),
            vec![Pattern::new("ab", PatternPosition::Prefix).unwrap()],
            1,
        );
        assert_eq!(ctl.state(), SearchState::Idle);
        ctl.start().unwrap();
        assert_eq!(ctl.state(), SearchState::Running);

        let deadline = Instant::now() + Duration::from_secs(120);
        let (found, path) = loop {
            assert!(Instant::now() < deadline, "no match within deadline");
            match ctl.poll(Duration::from_millis(200)) {
                Some(SearchEvent::Found { found, path }) => break (found, path),
                Some(other) => panic!("unexpected event: {other:?}"),
                None => continue,
            }
        };

        assert!(found.address.body().starts_with("ab"));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            found.address.to_onion()
        );
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 96);
        assert_eq!(&content[..32], KEY_FILE_HEADER);
        assert_eq!(&content[32..], &found.keypair.expanded_secret_key());

        assert_eq!(ctl.state(), SearchState::Completed);
        assert!(ctl.snapshot().attempts > 0);
    }

    #[test]
    fn stop_halts_a_running_search() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(
            dir.path(),
            // Effectively impossible within the test's lifetime.
            vec![Pattern::new("zzzzzzzzzzzzzzzz", PatternPosition::Prefix).unwrap()],
            1,
        );
        ctl.start().unwrap();
        assert!(ctl.poll(Duration::from_millis(100)).is_none());

        ctl.stop();
        assert_eq!(ctl.state(), SearchState::Stopped);
        assert!(ctl.poll(Duration::from_millis(10)).is_none());
        // Workers are joined, so the counters are final.
        let before = ctl.snapshot().attempts;
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ctl.snapshot().attempts, before);
    }

    #[test]
    fn stop_handle_stops_from_outside() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(
            dir.path(),
            vec![Pattern::new("zzzzzzzzzzzzzzzz", PatternPosition::Prefix).unwrap()],
            1,
        );
        ctl.start().unwrap();
        ctl.stop_handle().store(true, Ordering::Relaxed);

        // The channel disconnects once the workers notice the flag.
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            match ctl.poll(Duration::from_millis(100)) {
                None if ctl.state() != SearchState::Running => break,
                _ if Instant::now() > deadline => panic!("workers did not stop"),
                _ => continue,
            }
        }
        assert_eq!(ctl.state(), SearchState::Stopped);
    }

    #[test]
    fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(
            dir.path(),
            vec![Pattern::new("zzzzzzzzzzzzzzzz", PatternPosition::Prefix).unwrap()],
            1,
        );
        ctl.start().unwrap();
        assert!(matches!(ctl.start(), Err(SearchError::AlreadyStarted)));
        ctl.stop();
    }

    #[test]
    fn persist_failure_reports_the_key_and_keeps_searching() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("keys");
        let mut ctl = controller(
            &out,
            vec![Pattern::new("a", PatternPosition::Prefix).unwrap()],
            // Run forever so a failed save cannot be the last event.
            0,
        );
        ctl.start().unwrap();

        // Make the output directory unusable while the search runs.
        std::fs::remove_dir_all(&out).unwrap();
        std::fs::write(&out, b"occupied").unwrap();

        let deadline = Instant::now() + Duration::from_secs(120);
        let found = loop {
            assert!(Instant::now() < deadline, "no persist failure within deadline");
            match ctl.poll(Duration::from_millis(200)) {
                Some(SearchEvent::PersistFailed { found, error }) => {
                    assert!(matches!(error, StoreError::Write(_, _)));
                    break found;
                }
                // Matches saved before the directory was replaced.
                Some(SearchEvent::Found { .. }) | None => continue,
                Some(other) => panic!("unexpected event: {other:?}"),
            }
        };

        // The key survives the failed write: everything needed to retry
        // or recover it is still in memory.
        assert!(found.address.body().starts_with('a'));
        assert_eq!(
            found.address,
            crate::crypto::OnionAddress::from_public_key(found.keypair.public_key())
        );
        assert_eq!(found.keypair.expanded_secret_key().len(), 64);

        // A failed save never stops the search.
        assert_eq!(ctl.state(), SearchState::Running);
        ctl.stop();
        assert_eq!(ctl.state(), SearchState::Stopped);
    }

    #[test]
    fn zero_count_never_completes_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(
            dir.path(),
            vec![Pattern::new("a", PatternPosition::Prefix).unwrap()],
            0,
        );
        ctl.start().unwrap();

        // Collect a few matches; the search must stay running.
        let mut seen = 0;
        let deadline = Instant::now() + Duration::from_secs(120);
        while seen < 3 && Instant::now() < deadline {
            if let Some(SearchEvent::Found { .. }) = ctl.poll(Duration::from_millis(200)) {
                seen += 1;
            }
        }
        assert_eq!(seen, 3);
        assert_eq!(ctl.state(), SearchState::Running);
        ctl.stop();
        assert_eq!(ctl.state(), SearchState::Stopped);
    }
}
