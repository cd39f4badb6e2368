//! Runtime configuration for the onion address search.

use std::path::PathBuf;

use clap::Parser;

use crate::matcher::{Pattern, PatternError, PatternPosition, PatternSet};
use crate::worker::{BackendKind, BackendOptions, GpuOptions};

/// Tor v3 Vanity Onion Address Generator
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Patterns to search for, as `text` or `text:position`
    /// (position: prefix, suffix, anywhere)
    #[arg(required = true)]
    pub patterns: Vec<String>,

    /// Default position for patterns given without one
    #[arg(short = 't', long, default_value = "prefix")]
    pub position: PatternPosition,

    /// Directory found keys are written into
    #[arg(short = 'd', long, default_value = "found-keys")]
    pub dst: PathBuf,

    /// Backend to run the search on
    #[arg(short = 'm', long, default_value = "auto")]
    pub mode: BackendKind,

    /// Number of CPU worker threads (default: number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Stop after finding N keys per pattern (0 = run forever)
    #[arg(short = 'n', long, default_value = "1")]
    pub count: u64,

    /// Progress report interval in seconds
    #[arg(short = 'r', long, default_value = "5")]
    pub report_interval: u64,

    /// GPU device index to use
    #[cfg(feature = "gpu")]
    #[arg(long, default_value = "0")]
    pub gpu_device: usize,

    /// Seeds per GPU kernel dispatch
    #[cfg(feature = "gpu")]
    #[arg(long, default_value = "262144")]
    pub gpu_batch_size: usize,

    /// Path to the precompiled GPU program
    #[cfg(feature = "gpu")]
    #[arg(long, default_value = "onion-vanity.clbin")]
    pub gpu_program: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("at least one pattern is required")]
    EmptyPatterns,

    #[error("worker count must be at least 1")]
    NoWorkers,
}

impl Config {
    /// Returns the number of CPU workers, defaulting to the CPU count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }

    /// Validates everything that can be checked without touching the
    /// filesystem; the output directory is probed by the key store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patterns.is_empty() {
            return Err(ConfigError::EmptyPatterns);
        }
        if self.workers == Some(0) {
            return Err(ConfigError::NoWorkers);
        }
        self.pattern_set()?;
        Ok(())
    }

    /// Parses and validates the pattern arguments.
    pub fn pattern_set(&self) -> Result<PatternSet, ConfigError> {
        let patterns = self
            .patterns
            .iter()
            .map(|spec| Pattern::parse(spec, self.position))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternSet::new(patterns)?)
    }

    /// Backend parameters derived from the arguments.
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            cpu_workers: self.worker_count(),
            gpu: self.gpu_options(),
        }
    }

    #[cfg(feature = "gpu")]
    fn gpu_options(&self) -> GpuOptions {
        GpuOptions {
            device_index: self.gpu_device,
            batch_size: self.gpu_batch_size,
            program: self.gpu_program.clone(),
        }
    }

    #[cfg(not(feature = "gpu"))]
    fn gpu_options(&self) -> GpuOptions {
        GpuOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_config(patterns: &[&str]) -> Config {
        Config {
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            position: PatternPosition::Prefix,
            dst: PathBuf::from("found-keys"),
            mode: BackendKind::Auto,
            workers: None,
            count: 1,
            report_interval: 5,
            #[cfg(feature = "gpu")]
            gpu_device: 0,
            #[cfg(feature = "gpu")]
            gpu_batch_size: 262144,
            #[cfg(feature = "gpu")]
            gpu_program: PathBuf::from("onion-vanity.clbin"),
        }
    }

    #[test]
    fn valid_patterns() {
        let config = make_test_config(&["abc", "xyz:suffix", "q2w:anywhere"]);
        assert!(config.validate().is_ok());
        let set = config.pattern_set().unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.patterns()[1].position(), PatternPosition::Suffix);
    }

    #[test]
    fn invalid_alphabet_is_rejected() {
        // 0, 1, 8 and 9 never occur in base32 onion addresses.
        let config = make_test_config(&["abc1"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn empty_pattern_list_is_rejected() {
        let config = make_test_config(&[]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPatterns)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = make_test_config(&["abc"]);
        config.workers = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn default_position_applies_to_bare_patterns() {
        let mut config = make_test_config(&["abc"]);
        config.position = PatternPosition::Anywhere;
        let set = config.pattern_set().unwrap();
        assert_eq!(set.patterns()[0].position(), PatternPosition::Anywhere);
    }
}
