//! Integrity seals over cassette contents.
//!
//! A seal is `sha256:<hex>` when no key is configured and
//! `hmac-sha256:<hex>` when one is. The keyed form also detects a tamperer
//! who recomputes the plain digest after editing a cassette.

use std::fmt;

use hmac::Hmac;
use hmac::Mac;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Result;
use crate::error::VcrError;

type HmacSha256 = Hmac<Sha256>;

const PLAIN_PREFIX: &str = "sha256:";
const KEYED_PREFIX: &str = "hmac-sha256:";

/// Computes and checks seals.
#[derive(Clone)]
pub struct Sealer {
    mac: Option<HmacSha256>,
}

impl Sealer {
    /// Plain SHA-256 seals.
    pub fn unkeyed() -> Self {
        Self { mac: None }
    }

    /// HMAC-SHA256 seals under `key`.
    pub fn keyed(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(VcrError::config("seal key must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| VcrError::config(format!("invalid seal key: {e}")))?;
        Ok(Self { mac: Some(mac) })
    }

    pub fn is_keyed(&self) -> bool {
        self.mac.is_some()
    }

    /// Seal the canonical bytes of a cassette body.
    pub fn seal(&self, canonical: &[u8]) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                mac.update(canonical);
                format!("{KEYED_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
            }
            None => format!("{PLAIN_PREFIX}{}", hex::encode(Sha256::digest(canonical))),
        }
    }

    /// Check an embedded seal against `canonical`.
    ///
    /// Returns the freshly computed seal on mismatch. A seal produced under
    /// the other algorithm never verifies.
    pub fn verify(&self, canonical: &[u8], embedded: &str) -> std::result::Result<(), String> {
        let verified = match &self.mac {
            Some(mac) => embedded
                .strip_prefix(KEYED_PREFIX)
                .and_then(|tag| hex::decode(tag).ok())
                .is_some_and(|tag| {
                    let mut mac = mac.clone();
                    mac.update(canonical);
                    mac.verify_slice(&tag).is_ok()
                }),
            None => constant_time_eq(&self.seal(canonical), embedded),
        };
        if verified {
            Ok(())
        } else {
            Err(self.seal(canonical))
        }
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = if self.is_keyed() { "hmac-sha256" } else { "sha256" };
        f.debug_struct("Sealer")
            .field("algorithm", &algorithm)
            .finish()
    }
}

/// Compare unkeyed digests without an early exit.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut result = 0;
    for (x, y) in a_bytes.iter().zip(b_bytes.iter()) {
        result |= x ^ y;
    }
    result == 0
}
