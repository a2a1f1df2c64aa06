//! # Store Key Generation
//!
//! Store keys are `<prefix><sha256(material)>` so identifiers of any length (service
//! names, client keys, full URLs) map to short keys of fixed shape.

use sha2::{Digest, Sha256};

/// Build a prefixed, hashed store key
pub fn hashed_key(prefix: &str, material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{}{}", prefix, hex::encode(hasher.finalize()))
}
