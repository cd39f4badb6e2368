//! Ed25519 identity key generation for hidden services.

use ed25519_dalek::SigningKey;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};

/// Errors that can occur while generating a key pair.
#[derive(Debug, thiserror::Error)]
pub enum KeypairError {
    /// The secure randomness source failed. This is fatal to the
    /// worker that hit it; there is no fallback to a weaker source.
    #[error("secure randomness source failed: {0}")]
    Randomness(#[from] rand::Error),
}

/// An Ed25519 key pair derived from a 32-byte seed.
///
/// The seed and public key are held together so a match can be
/// persisted without re-deriving anything; everything else is derived
/// on demand and the whole value is dropped for non-matches.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// The secret seed (the value Tor calls the "secret key").
    seed: [u8; 32],
    /// The derived public key.
    public: [u8; 32],
}

impl Keypair {
    /// Generates a new key pair from a secure randomness source.
    ///
    /// Each worker owns its own source instance, so two workers never
    /// evaluate the same seed. A randomness failure is returned as an
    /// error rather than silently retried or degraded.
    pub fn try_generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, KeypairError> {
        let mut seed = [0u8; 32];
        rng.try_fill_bytes(&mut seed)?;
        Ok(Self::from_seed(seed))
    }

    /// Derives the key pair deterministically from a seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public = signing_key.verifying_key().to_bytes();
        Self { seed, public }
    }

    /// Returns the public key bytes.
    #[inline]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Returns the secret seed bytes.
    #[inline]
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Returns the expanded secret key in the layout Tor loads from
    /// `hs_ed25519_secret_key`: SHA-512 of the seed with the standard
    /// Ed25519 clamping applied to the scalar half.
    pub fn expanded_secret_key(&self) -> [u8; 64] {
        let digest = Sha512::digest(self.seed);
        let mut expanded = [0u8; 64];
        expanded.copy_from_slice(&digest);
        expanded[0] &= 248;
        expanded[31] &= 127;
        expanded[31] |= 64;
        expanded
    }
}
