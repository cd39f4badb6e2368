//! # onion_vanity
//!
//! High-performance Tor v3 vanity onion address generator.
//!
//! Generates Ed25519 identity keys and keeps the ones whose onion
//! address matches user-supplied patterns, writing each hit in the
//! format Tor loads from `hs_ed25519_secret_key`.
//!
//! ## Architecture
//!
//! - `crypto`: Key generation and onion address derivation
//! - `matcher`: Pattern validation and matching
//! - `worker`: CPU/GPU backends and their shared plumbing
//! - `search`: Search lifecycle, statistics and event delivery
//! - `store`: Found-key persistence
//! - `config`: Runtime configuration

pub mod config;
pub mod crypto;
pub mod matcher;
pub mod search;
pub mod store;
pub mod worker;

pub use config::{Config, ConfigError};
pub use crypto::{Keypair, OnionAddress};
pub use matcher::{Pattern, PatternPosition, PatternSet};
pub use search::{SearchController, SearchEvent, SearchState, StatsSnapshot};
pub use store::KeyStore;
pub use worker::{BackendKind, FoundKey};

#[cfg(feature = "gpu")]
pub use worker::{GpuBackend, GpuError};
