//! Record/replay engine for model-provider traffic.
//!
//! Every outbound provider request is reduced to a canonical form and a
//! content signature. Depending on the session mode the request is served
//! from a sealed cassette on disk, forwarded live and recorded, or refused.
//! `strict` mode is the CI gate: it never calls a provider and never writes,
//! so a test suite either replays exactly what is committed or fails naming
//! the missing cassette.
//!
//! ```text
//! ProviderRequest ─► canonicalize ─► fingerprint ─► decide(mode, lookup)
//!                                                    │
//!          ┌─────────────┬────────────┬──────────────┼──────────────┐
//!        Serve       Passthrough    Record         Refuse
//!     (cassette)     (upstream)  (upstream +    (ReplayMiss /
//!                                 redact + seal  StrictMiss /
//!                                 + atomic write) Integrity)
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod canonical;
pub mod cassette;
pub mod config;
pub mod controller;
pub mod error;
pub mod fingerprint;
pub mod inflight;
pub mod mode;
pub mod provider;
pub mod redact;
pub mod seal;
pub mod store;
pub mod sweeper;
pub mod trace;
pub mod upstream;

pub use canonical::{CanonicalRequest, ProviderRequest, canonicalize};
pub use cassette::{Cassette, CassetteBody, RecordedRequest, RecordedResponse, ResponseBody};
pub use config::{VcrConfig, VcrSession};
pub use controller::{ModeController, ResponseSource, VcrResponse};
pub use error::{ErrorCategory, Result, VcrError};
pub use fingerprint::{Signature, SignatureParseError, fingerprint};
pub use mode::{Decision, Refusal, VcrMode, decide};
pub use provider::Provider;
pub use redact::{KeyRedactor, NoopRedactor, Redactor, redact_for_persist};
pub use seal::Sealer;
pub use store::{CassetteStore, Corruption, LookupResult, SweepReport};
pub use sweeper::RetentionSweeper;
pub use trace::{MemoryTraceSink, TraceEvent, TraceOutcome, TraceSink, TracingSink};
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamResponse};

/// Crate version, stamped into every cassette.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
