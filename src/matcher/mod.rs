//! Address pattern matching.

mod pattern;

pub use pattern::{Pattern, PatternError, PatternPosition, PatternSet};
