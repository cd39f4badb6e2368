//! Pattern matching over onion address bodies.

use std::str::FromStr;

use crate::crypto::{is_onion_char, OnionAddress, ADDRESS_LEN, ONION_ALPHABET};

/// Where in the address body a pattern must occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PatternPosition {
    /// Match at the beginning of the address
    #[default]
    Prefix,
    /// Match at the end of the address (before `.onion`)
    Suffix,
    /// Match anywhere in the address
    Anywhere,
}

impl FromStr for PatternPosition {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prefix" | "start" | "begin" => Ok(PatternPosition::Prefix),
            "suffix" | "end" => Ok(PatternPosition::Suffix),
            "anywhere" | "contains" | "any" => Ok(PatternPosition::Anywhere),
            _ => Err(PatternError::UnknownPosition(s.to_string())),
        }
    }
}

impl std::fmt::Display for PatternPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternPosition::Prefix => write!(f, "prefix"),
            PatternPosition::Suffix => write!(f, "suffix"),
            PatternPosition::Anywhere => write!(f, "anywhere"),
        }
    }
}

/// Errors raised while building a pattern.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern is {0} characters, the address body is only {ADDRESS_LEN}")]
    TooLong(usize),
    #[error("invalid character '{0}' (allowed: {ONION_ALPHABET})")]
    InvalidCharacter(char),
    #[error("unknown pattern position: {0}")]
    UnknownPosition(String),
}

/// A validated search pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// The pattern text, lowercase, restricted to the onion alphabet
    text: String,
    /// Where the text must occur in the address body
    position: PatternPosition,
}

impl Pattern {
    /// Creates a pattern, normalizing case and validating the alphabet.
    ///
    /// Uppercase input is accepted and lowercased; any character outside
    /// a-z and 2-7 is rejected (onion addresses never contain 0, 1, 8 or 9).
    pub fn new(text: impl Into<String>, position: PatternPosition) -> Result<Self, PatternError> {
        let text = text.into().to_lowercase();
        if text.is_empty() {
            return Err(PatternError::Empty);
        }
        if text.len() > ADDRESS_LEN {
            return Err(PatternError::TooLong(text.len()));
        }
        if let Some(c) = text.chars().find(|&c| !is_onion_char(c)) {
            return Err(PatternError::InvalidCharacter(c));
        }
        Ok(Self { text, position })
    }

    /// Parses the CLI form `text` or `text:position`.
    pub fn parse(spec: &str, default_position: PatternPosition) -> Result<Self, PatternError> {
        match spec.split_once(':') {
            Some((text, position)) => Self::new(text, position.parse()?),
            None => Self::new(spec, default_position),
        }
    }

    /// Returns the normalized pattern text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns where the pattern must occur.
    pub fn position(&self) -> PatternPosition {
        self.position
    }

    /// Matches an address body against this pattern.
    #[inline]
    pub fn matches(&self, address: &OnionAddress) -> bool {
        let body = address.body();
        match self.position {
            PatternPosition::Prefix => body.starts_with(&self.text),
            PatternPosition::Suffix => body.ends_with(&self.text),
            PatternPosition::Anywhere => body.contains(&self.text),
        }
    }

    /// True for suffix patterns that can never match: the trailing
    /// version byte fixes the final base32 character to 'd', so any
    /// suffix ending in something else has zero probability.
    pub fn is_unreachable(&self) -> bool {
        self.position == PatternPosition::Suffix && !self.text.ends_with('d')
    }

    /// Expected number of candidates per match.
    ///
    /// Each base32 character carries 5 bits, so a fixed placement costs
    /// 32^n. Anywhere patterns get one chance per window position.
    pub fn estimated_attempts(&self) -> f64 {
        let fixed = 32f64.powi(self.text.len() as i32);
        match self.position {
            PatternPosition::Prefix | PatternPosition::Suffix => fixed,
            PatternPosition::Anywhere => {
                let windows = (ADDRESS_LEN - self.text.len() + 1) as f64;
                fixed / windows
            }
        }
    }

    /// Relative per-candidate comparison cost, with a prefix test as 1.0.
    ///
    /// A prefix test fails on the first character almost always; suffix
    /// and substring tests touch more of the body. Used only to shade
    /// the throughput estimate, not for scheduling.
    pub fn comparison_cost(&self) -> f64 {
        match self.position {
            PatternPosition::Prefix => 1.0,
            PatternPosition::Suffix => 2.0,
            PatternPosition::Anywhere => (ADDRESS_LEN - self.text.len() + 1) as f64,
        }
    }

    /// Returns a human-readable difficulty estimate at the given rate
    /// (candidates per second).
    pub fn difficulty_description(&self, rate: f64) -> String {
        if rate <= 0.0 {
            return "unknown".into();
        }
        let secs = self.estimated_attempts() / rate;
        match secs {
            s if s < 1.0 => "less than a second".into(),
            s if s < 60.0 => format!("about {:.0} seconds", s),
            s if s < 3_600.0 => format!("about {:.0} minutes", s / 60.0),
            s if s < 86_400.0 => format!("about {:.1} hours", s / 3_600.0),
            s if s < 86_400.0 * 365.0 => format!("about {:.1} days", s / 86_400.0),
            s => format!("about {:.1} years", s / (86_400.0 * 365.0)),
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.text, self.position)
    }
}

/// The full set of patterns a search is looking for.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Builds a set from validated patterns. At least one is required.
    pub fn new(patterns: Vec<Pattern>) -> Result<Self, PatternError> {
        if patterns.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { patterns })
    }

    /// Returns the patterns in the set.
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the indices of every pattern the address matches.
    ///
    /// A candidate is checked against all patterns, so an address that
    /// satisfies several patterns is reported for each of them.
    #[inline]
    pub fn matching(&self, address: &OnionAddress) -> Vec<usize> {
        self.patterns
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches(address))
            .map(|(i, _)| i)
            .collect()
    }

    /// True if the address matches at least one pattern. Cheaper than
    /// [`matching`](Self::matching) on the hot path because it stops at
    /// the first hit.
    #[inline]
    pub fn matches_any(&self, address: &OnionAddress) -> bool {
        self.patterns.iter().any(|p| p.matches(address))
    }

    /// Expected candidates until the first match across the whole set.
    ///
    /// Per-pattern match probabilities are independent enough to sum.
    pub fn estimated_attempts(&self) -> f64 {
        let rate: f64 = self
            .patterns
            .iter()
            .map(|p| 1.0 / p.estimated_attempts())
            .sum();
        1.0 / rate
    }

    /// Total per-candidate comparison cost of the set.
    pub fn comparison_cost(&self) -> f64 {
        self.patterns.iter().map(Pattern::comparison_cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_with_prefix(prefix: &str) -> OnionAddress {
        // Scan deterministic keys until one encodes with the wanted
        // prefix; only usable for one-character prefixes in tests.
        let mut key = [0u8; 32];
        for i in 0..=u16::MAX {
            key[0] = (i >> 8) as u8;
            key[1] = (i & 0xff) as u8;
            let addr = OnionAddress::from_public_key(&key);
            if addr.body().starts_with(prefix) {
                return addr;
            }
        }
        panic!("no key found with prefix {prefix}");
    }

    #[test]
    fn prefix_match() {
        let addr = OnionAddress::from_public_key(&[0u8; 32]);
        let p = Pattern::new("aaaa", PatternPosition::Prefix).unwrap();
        assert!(p.matches(&addr));
    }

    #[test]
    fn prefix_no_match() {
        let addr = OnionAddress::from_public_key(&[0u8; 32]);
        let p = Pattern::new("bbbb", PatternPosition::Prefix).unwrap();
        assert!(!p.matches(&addr));
    }

    #[test]
    fn suffix_matches_only_at_end() {
        // Body of the zero key: aaaa...aaam2dqd
        let addr = OnionAddress::from_public_key(&[0u8; 32]);
        assert!(Pattern::new("2dqd", PatternPosition::Suffix)
            .unwrap()
            .matches(&addr));
        // Present in the body but not at the end.
        assert!(!Pattern::new("aaam", PatternPosition::Suffix)
            .unwrap()
            .matches(&addr));
    }

    #[test]
    fn anywhere_match() {
        let addr = OnionAddress::from_public_key(&[0u8; 32]);
        assert!(Pattern::new("m2dq", PatternPosition::Anywhere)
            .unwrap()
            .matches(&addr));
    }

    #[test]
    fn uppercase_input_is_normalized() {
        let p = Pattern::new("AAAA", PatternPosition::Prefix).unwrap();
        assert_eq!(p.text(), "aaaa");
        let addr = OnionAddress::from_public_key(&[0u8; 32]);
        assert!(p.matches(&addr));
    }

    #[test]
    fn rejects_invalid_characters() {
        for c in ['1', '0', '8', '9', '-', '.'] {
            let err = Pattern::new(format!("ab{c}"), PatternPosition::Prefix);
            assert!(matches!(err, Err(PatternError::InvalidCharacter(got)) if got == c));
        }
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(matches!(
            Pattern::new("", PatternPosition::Prefix),
            Err(PatternError::Empty)
        ));
        assert!(matches!(
            Pattern::new("a".repeat(57), PatternPosition::Prefix),
            Err(PatternError::TooLong(57))
        ));
    }

    #[test]
    fn parse_with_position_suffix() {
        let p = Pattern::parse("abcd:suffix", PatternPosition::Prefix).unwrap();
        assert_eq!(p.text(), "abcd");
        assert_eq!(p.position(), PatternPosition::Suffix);

        let p = Pattern::parse("abcd", PatternPosition::Anywhere).unwrap();
        assert_eq!(p.position(), PatternPosition::Anywhere);

        assert!(Pattern::parse("abcd:sideways", PatternPosition::Prefix).is_err());
    }

    #[test]
    fn unreachable_suffix_detection() {
        assert!(Pattern::new("abc", PatternPosition::Suffix)
            .unwrap()
            .is_unreachable());
        assert!(!Pattern::new("abd", PatternPosition::Suffix)
            .unwrap()
            .is_unreachable());
        assert!(!Pattern::new("abc", PatternPosition::Prefix)
            .unwrap()
            .is_unreachable());
    }

    #[test]
    fn estimated_attempts_scale() {
        let p1 = Pattern::new("a", PatternPosition::Prefix).unwrap();
        let p2 = Pattern::new("ab", PatternPosition::Prefix).unwrap();
        assert_eq!(p1.estimated_attempts(), 32.0);
        assert_eq!(p2.estimated_attempts(), 1024.0);

        // Anywhere is easier than prefix for the same text.
        let anywhere = Pattern::new("ab", PatternPosition::Anywhere).unwrap();
        assert!(anywhere.estimated_attempts() < p2.estimated_attempts());
    }

    #[test]
    fn set_reports_every_matching_pattern() {
        let addr = addr_with_prefix("a");
        let set = PatternSet::new(vec![
            Pattern::new("a", PatternPosition::Prefix).unwrap(),
            Pattern::new("zzzzzz", PatternPosition::Prefix).unwrap(),
            Pattern::new("d", PatternPosition::Suffix).unwrap(),
        ])
        .unwrap();
        let hits = set.matching(&addr);
        assert_eq!(hits, vec![0, 2]);
        assert!(set.matches_any(&addr));
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(matches!(
            PatternSet::new(Vec::new()),
            Err(PatternError::Empty)
        ));
    }
}
