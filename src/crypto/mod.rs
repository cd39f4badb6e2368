//! Cryptographic primitives: Ed25519 key generation and Tor v3 onion
//! address derivation.

mod keypair;
mod onion;

pub use keypair::{Keypair, KeypairError};
pub use onion::{char_to_value, is_onion_char, OnionAddress, ADDRESS_LEN, ONION_ALPHABET};
