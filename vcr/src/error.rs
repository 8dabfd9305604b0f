//! Error taxonomy for the record/replay engine.
//!
//! Every variant that concerns a specific request carries the provider and
//! signature so an operator can locate the exact cassette to inspect or
//! re-record. None of these errors are retried inside the engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::fingerprint::Signature;
use crate::mode::VcrMode;
use crate::provider::Provider;
use crate::upstream::UpstreamError;

/// Error category for structured logging and trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request; caller's fault, nothing touched
    Canonicalization,
    /// No cassette under `replay`
    ReplayMiss,
    /// No cassette under `strict`
    StrictMiss,
    /// Stored cassette disagrees with its seal
    Integrity,
    /// Recording attempted where the mode forbids it
    RecordForbidden,
    /// Filesystem failure reading or writing the store
    Storage,
    /// The provider call failed
    Upstream,
    /// Configuration could not be loaded or resolved
    Config,
    /// Logic bugs and task failures
    Internal,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonicalization => "CANONICALIZATION_ERROR",
            Self::ReplayMiss => "REPLAY_MISS",
            Self::StrictMiss => "STRICT_MISS",
            Self::Integrity => "INTEGRITY_VIOLATION",
            Self::RecordForbidden => "RECORD_FORBIDDEN",
            Self::Storage => "STORAGE_ERROR",
            Self::Upstream => "UPSTREAM_ERROR",
            Self::Config => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Record/replay engine error
#[derive(Debug, Error)]
pub enum VcrError {
    #[error("cannot canonicalize {provider} request: {reason}")]
    Canonicalization { provider: Provider, reason: String },

    #[error(
        "replay miss: no cassette for {provider}/{signature} (expected at {}); \
         switch to record or auto mode to capture it",
        cassette.display()
    )]
    ReplayMiss {
        provider: Provider,
        signature: Signature,
        cassette: PathBuf,
    },

    #[error(
        "strict mode: no cassette for {provider}/{signature}; \
         no live call was made and nothing was written. \
         To fix: run this build locally with CODEX_VCR_MODE=record (or auto), \
         then commit {} to version control",
        cassette.display()
    )]
    StrictMiss {
        provider: Provider,
        signature: Signature,
        cassette: PathBuf,
    },

    #[error(
        "integrity violation in {provider}/{signature} at {}: \
         expected seal {expected}, computed {actual} ({detail}); \
         inspect the file and re-record it explicitly",
        cassette.display()
    )]
    IntegrityViolation {
        provider: Provider,
        signature: Signature,
        cassette: PathBuf,
        expected: String,
        actual: String,
        detail: String,
    },

    #[error(
        "strict mode forbids recording {provider}/{signature}; \
         re-record outside CI and commit the cassette"
    )]
    StrictRecordForbidden {
        provider: Provider,
        signature: Signature,
    },

    #[error("recording {provider}/{signature} is disabled in {mode} mode")]
    RecordingDisabled {
        provider: Provider,
        signature: Signature,
        mode: VcrMode,
    },

    #[error(
        "storage error on {} ({provider}/{}): {source}",
        path.display(),
        signature_label(signature.as_ref())
    )]
    Storage {
        provider: Provider,
        signature: Option<Signature>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "storage operation on {} ({provider}/{signature}) timed out after {timeout:?}",
        path.display()
    )]
    StorageTimeout {
        provider: Provider,
        signature: Signature,
        path: PathBuf,
        timeout: Duration,
    },

    #[error("upstream error for {provider}/{}: {source}", signature_label(signature.as_ref()))]
    Upstream {
        provider: Provider,
        signature: Option<Signature>,
        #[source]
        source: UpstreamError,
    },

    #[error("config error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

fn signature_label(signature: Option<&Signature>) -> &str {
    signature.map_or("-", Signature::as_str)
}

impl VcrError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Canonicalization { .. } => ErrorCategory::Canonicalization,
            Self::ReplayMiss { .. } => ErrorCategory::ReplayMiss,
            Self::StrictMiss { .. } => ErrorCategory::StrictMiss,
            Self::IntegrityViolation { .. } => ErrorCategory::Integrity,
            Self::StrictRecordForbidden { .. } | Self::RecordingDisabled { .. } => {
                ErrorCategory::RecordForbidden
            }
            Self::Storage { .. } | Self::StorageTimeout { .. } => ErrorCategory::Storage,
            Self::Upstream { .. } => ErrorCategory::Upstream,
            Self::Config { .. } => ErrorCategory::Config,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a storage error for an I/O failure on `path`
    pub fn storage(
        provider: Provider,
        signature: Option<&Signature>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            provider,
            signature: signature.cloned(),
            path: path.into(),
            source,
        }
    }
}

// In-flight upstream calls deliver one result to many waiters, so errors
// must be clonable. I/O sources are rebuilt from their kind and message.
impl Clone for VcrError {
    fn clone(&self) -> Self {
        match self {
            Self::Canonicalization { provider, reason } => Self::Canonicalization {
                provider: *provider,
                reason: reason.clone(),
            },
            Self::ReplayMiss {
                provider,
                signature,
                cassette,
            } => Self::ReplayMiss {
                provider: *provider,
                signature: signature.clone(),
                cassette: cassette.clone(),
            },
            Self::StrictMiss {
                provider,
                signature,
                cassette,
            } => Self::StrictMiss {
                provider: *provider,
                signature: signature.clone(),
                cassette: cassette.clone(),
            },
            Self::IntegrityViolation {
                provider,
                signature,
                cassette,
                expected,
                actual,
                detail,
            } => Self::IntegrityViolation {
                provider: *provider,
                signature: signature.clone(),
                cassette: cassette.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
                detail: detail.clone(),
            },
            Self::StrictRecordForbidden {
                provider,
                signature,
            } => Self::StrictRecordForbidden {
                provider: *provider,
                signature: signature.clone(),
            },
            Self::RecordingDisabled {
                provider,
                signature,
                mode,
            } => Self::RecordingDisabled {
                provider: *provider,
                signature: signature.clone(),
                mode: *mode,
            },
            Self::Storage {
                provider,
                signature,
                path,
                source,
            } => Self::Storage {
                provider: *provider,
                signature: signature.clone(),
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::StorageTimeout {
                provider,
                signature,
                path,
                timeout,
            } => Self::StorageTimeout {
                provider: *provider,
                signature: signature.clone(),
                path: path.clone(),
                timeout: *timeout,
            },
            Self::Upstream {
                provider,
                signature,
                source,
            } => Self::Upstream {
                provider: *provider,
                signature: signature.clone(),
                source: source.clone(),
            },
            Self::Config { message } => Self::Config {
                message: message.clone(),
            },
            Self::Internal { message } => Self::Internal {
                message: message.clone(),
            },
        }
    }
}

/// Result type for record/replay operations
pub type Result<T> = std::result::Result<T, VcrError>;
