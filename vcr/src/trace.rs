//! Per-request trace records.
//!
//! Exactly one event is emitted for every handled request, whether it
//! succeeds or fails.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use crate::error::ErrorCategory;
use crate::fingerprint::Signature;
use crate::mode::VcrMode;
use crate::provider::Provider;

/// How a request was resolved against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Served from a verified cassette.
    Hit,
    /// No cassette existed.
    Miss,
    /// A cassette existed but failed verification.
    Corrupt,
    /// Store bypassed entirely.
    Off,
    /// Store not consulted; the response was recorded.
    Record,
    /// The request could not be canonicalized.
    Invalid,
    /// The store could not be read.
    Unavailable,
}

impl TraceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Corrupt => "corrupt",
            Self::Off => "off",
            Self::Record => "record",
            Self::Invalid => "invalid",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub provider: Provider,
    /// Absent only when the request could not be fingerprinted.
    pub signature: Option<Signature>,
    pub mode: VcrMode,
    pub outcome: TraceOutcome,
    pub duration: Duration,
    /// Status code returned to the caller, if any.
    pub status: Option<u16>,
    pub error: Option<ErrorCategory>,
    /// Whether this request joined a call another request started.
    pub coalesced: bool,
}

/// Receives trace events. Must not block.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: &TraceEvent);
}

/// Logs each event through `tracing` under the `codex_vcr::trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, event: &TraceEvent) {
        let signature = event.signature.as_ref().map_or("-", Signature::as_str);
        let error = event.error.map_or("-", ErrorCategory::as_str);
        tracing::info!(
            target: "codex_vcr::trace",
            provider = %event.provider,
            signature,
            mode = %event.mode,
            outcome = event.outcome.as_str(),
            duration_ms = event.duration.as_millis() as u64,
            status = event.status,
            error,
            coalesced = event.coalesced,
            "vcr request"
        );
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, event: &TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
