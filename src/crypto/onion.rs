//! Tor v3 onion address derivation and representation.

use std::fmt;

use tiny_keccak::{Hasher, Sha3};

/// The base32 alphabet used by onion addresses (RFC 4648, lowercase).
pub const ONION_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz234567";

/// Length of the address body in characters: 35 bytes * 8 / 5 bits.
pub const ADDRESS_LEN: usize = 56;

/// Onion address version byte.
const VERSION: u8 = 3;

/// Domain separation prefix for the address checksum.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// A Tor v3 onion address body (56 base32 characters, without the
/// `.onion` suffix).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Derives the address from an Ed25519 public key.
    ///
    /// The derivation is the one Tor specifies for v3 hidden services:
    ///
    /// ```text
    /// checksum = SHA3-256(".onion checksum" || pubkey || version)[0..2]
    /// body     = base32(pubkey || checksum || version)
    /// ```
    ///
    /// where version is `0x03`. The result is deterministic and depends
    /// only on the public key bytes.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = Sha3::v256();
        hasher.update(CHECKSUM_PREFIX);
        hasher.update(public_key);
        hasher.update(&[VERSION]);
        let mut checksum = [0u8; 32];
        hasher.finalize(&mut checksum);

        let mut raw = [0u8; 35];
        raw[..32].copy_from_slice(public_key);
        raw[32..34].copy_from_slice(&checksum[..2]);
        raw[34] = VERSION;

        Self(base32::encode(
            base32::Alphabet::Rfc4648Lower { padding: false },
            &raw,
        ))
    }

    /// Returns the 56-character address body.
    #[inline]
    pub fn body(&self) -> &str {
        &self.0
    }

    /// Returns the full hostname, e.g. `abc...xyz.onion`.
    pub fn to_onion(&self) -> String {
        format!("{}.onion", self.0)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.onion", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({}.onion)", self.0)
    }
}

/// Returns true if the character can occur in an onion address body.
#[inline]
pub fn is_onion_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '2'..='7')
}

/// Maps an address character to its 5-bit base32 value.
///
/// Used by the GPU backend to hand patterns to the device program in
/// the same representation the encoder produces.
#[inline]
pub fn char_to_value(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 - b'a'),
        '2'..='7' => Some(c as u8 - b'2' + 26),
        _ => None,
    }
}
