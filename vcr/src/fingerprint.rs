//! Request signatures.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::canonical::CanonicalRequest;
use crate::provider::Provider;

/// Number of hex characters kept from the SHA-256 digest (128 bits).
pub const SIGNATURE_HEX_LEN: usize = 32;

/// Content signature of a canonical request.
///
/// Lowercase hex, fixed width, safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signature '{0}': expected {SIGNATURE_HEX_LEN} lowercase hex characters")]
pub struct SignatureParseError(pub String);

impl Signature {
    pub fn parse(s: &str) -> Result<Self, SignatureParseError> {
        let valid = s.len() == SIGNATURE_HEX_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(SignatureParseError(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Signature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = SignatureParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.0
    }
}

/// Compute the signature of a canonical request.
///
/// The provider name is hashed ahead of the canonical bytes, separated by a
/// NUL, so the same body sent to two providers gets two signatures.
pub fn fingerprint(request: &CanonicalRequest) -> Signature {
    fingerprint_bytes(request.provider, request.as_bytes())
}

pub(crate) fn fingerprint_bytes(provider: Provider, canonical: &[u8]) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical);
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(SIGNATURE_HEX_LEN);
    Signature(hex)
}
