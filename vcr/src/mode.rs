//! Operating modes and the per-request decision table.
//!
//! | mode     | store lookup | upstream on miss | writes            | on miss       |
//! |----------|--------------|------------------|-------------------|---------------|
//! | `off`    | never        | always           | never             | n/a           |
//! | `record` | never        | always           | always            | n/a           |
//! | `replay` | always       | never            | never             | `ReplayMiss`  |
//! | `auto`   | always       | on miss          | on miss           | record        |
//! | `strict` | always       | never            | never             | `StrictMiss`  |
//!
//! A corrupt cassette is refused in every mode that reads the store.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::store::Corruption;
use crate::store::LookupResult;

/// Process-wide record/replay mode, fixed at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcrMode {
    /// Pass everything through; the store is untouched.
    Off,
    /// Always call upstream and overwrite the cassette.
    Record,
    /// Serve from the store only; a miss is an error.
    Replay,
    /// Serve hits, record misses.
    #[default]
    Auto,
    /// CI gate: serve hits, fail loudly on a miss, never call upstream.
    Strict,
}

impl VcrMode {
    pub const ALL: [VcrMode; 5] = [
        VcrMode::Off,
        VcrMode::Record,
        VcrMode::Replay,
        VcrMode::Auto,
        VcrMode::Strict,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Record => "record",
            Self::Replay => "replay",
            Self::Auto => "auto",
            Self::Strict => "strict",
        }
    }

    /// Whether requests in this mode read the store before anything else.
    pub fn consults_store(self) -> bool {
        matches!(self, Self::Replay | Self::Auto | Self::Strict)
    }

    /// Whether an operator may force a re-record in this mode.
    pub fn allows_rerecord(self) -> bool {
        matches!(self, Self::Record | Self::Replay | Self::Auto)
    }
}

impl fmt::Display for VcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode '{0}' (expected one of: off, record, replay, auto, strict)")]
pub struct UnknownMode(pub String);

impl FromStr for VcrMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        VcrMode::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// What the controller does next with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Call upstream; touch nothing else.
    Passthrough,
    /// Consult the store, then decide again with the result.
    Lookup,
    /// Return the stored cassette.
    Serve,
    /// Call upstream and persist the response.
    Record,
    /// Fail without calling upstream or writing.
    Refuse(Refusal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    ReplayMiss,
    StrictMiss,
    Corrupt(Corruption),
}

/// The decision table. `lookup` is `None` until the store has been consulted.
pub fn decide(mode: VcrMode, lookup: Option<&LookupResult>) -> Decision {
    match (mode, lookup) {
        (VcrMode::Off, _) => Decision::Passthrough,
        (VcrMode::Record, _) => Decision::Record,
        (_, None) => Decision::Lookup,
        (_, Some(LookupResult::Hit(_))) => Decision::Serve,
        (_, Some(LookupResult::Corrupt(corruption))) => {
            Decision::Refuse(Refusal::Corrupt(corruption.clone()))
        }
        (VcrMode::Replay, Some(LookupResult::Miss)) => Decision::Refuse(Refusal::ReplayMiss),
        (VcrMode::Strict, Some(LookupResult::Miss)) => Decision::Refuse(Refusal::StrictMiss),
        (VcrMode::Auto, Some(LookupResult::Miss)) => Decision::Record,
    }
}
