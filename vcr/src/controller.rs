//! The per-request state machine.
//!
//! `handle` canonicalizes and fingerprints the request, applies the mode's
//! decision table, and emits exactly one trace event. Store I/O runs on the
//! blocking pool under the session's storage timeout; upstream calls run
//! under the upstream timeout and are coalesced per signature.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::canonical::CanonicalRequest;
use crate::canonical::ProviderRequest;
use crate::canonical::canonicalize;
use crate::cassette::Cassette;
use crate::cassette::CassetteBody;
use crate::cassette::RecordedRequest;
use crate::cassette::RecordedResponse;
use crate::cassette::ResponseBody;
use crate::cassette::TOOL_VERSION;
use crate::cassette::recorded_headers;
use crate::config::VcrSession;
use crate::error::Result;
use crate::error::VcrError;
use crate::fingerprint::Signature;
use crate::fingerprint::fingerprint;
use crate::inflight::CallResult;
use crate::inflight::InflightCalls;
use crate::mode::Decision;
use crate::mode::Refusal;
use crate::mode::VcrMode;
use crate::mode::decide;
use crate::provider::Provider;
use crate::redact::redact_for_persist;
use crate::store::CassetteStore;
use crate::store::LookupResult;
use crate::trace::TraceEvent;
use crate::trace::TraceOutcome;
use crate::trace::TraceSink;
use crate::upstream::Upstream;
use crate::upstream::UpstreamError;
use crate::upstream::UpstreamResponse;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cassette,
    Upstream,
}

/// Response handed back to application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcrResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
    /// Absent only in `off` mode when the request could not be fingerprinted.
    pub signature: Option<Signature>,
}

impl VcrResponse {
    /// Parse the body as JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.body)
    }

    fn from_upstream(response: UpstreamResponse, signature: Option<Signature>) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Upstream,
            signature,
        }
    }

    fn from_cassette(cassette: Cassette) -> Result<Self> {
        let body = cassette.body.response.body.to_bytes().map_err(|e| {
            VcrError::internal(format!(
                "cassette {}/{} has an undecodable body: {e}",
                cassette.body.provider, cassette.body.fingerprint
            ))
        })?;
        Ok(Self {
            status: cassette.body.status,
            headers: cassette.body.response.headers.into_iter().collect(),
            body,
            source: ResponseSource::Cassette,
            signature: Some(cassette.body.fingerprint),
        })
    }
}

/// Result of one request, before the trace event is emitted.
struct Handled {
    result: Result<VcrResponse>,
    outcome: TraceOutcome,
    signature: Option<Signature>,
    coalesced: bool,
}

impl Handled {
    fn failed(outcome: TraceOutcome, signature: Option<Signature>, error: VcrError) -> Self {
        Self {
            result: Err(error),
            outcome,
            signature,
            coalesced: false,
        }
    }
}

/// Routes provider requests through the cassette store according to the
/// session's mode.
pub struct ModeController {
    session: Arc<VcrSession>,
    store: Arc<CassetteStore>,
    upstream: Arc<dyn Upstream>,
    trace: Arc<dyn TraceSink>,
    inflight: InflightCalls,
}

impl ModeController {
    pub fn new(
        session: VcrSession,
        upstream: Arc<dyn Upstream>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        let store = Arc::new(session.store());
        Self {
            session: Arc::new(session),
            store,
            upstream,
            trace,
            inflight: InflightCalls::new(),
        }
    }

    pub fn session(&self) -> &VcrSession {
        &self.session
    }

    pub fn mode(&self) -> VcrMode {
        self.session.mode()
    }

    pub fn store(&self) -> &CassetteStore {
        &self.store
    }

    /// Handle one request under the session mode.
    pub async fn handle(&self, request: ProviderRequest) -> Result<VcrResponse> {
        let started = Instant::now();
        let mode = self.mode();
        let provider = request.provider;
        let handled = self.dispatch(mode, request).await;
        self.emit(provider, mode, started, &handled);
        handled.result
    }

    /// Force a fresh upstream call and overwrite the cassette for this
    /// request, bypassing any existing (possibly corrupt) cassette.
    ///
    /// Refused before any side effect in `strict` and `off` modes.
    pub async fn rerecord(&self, request: ProviderRequest) -> Result<VcrResponse> {
        let started = Instant::now();
        let mode = self.mode();
        let provider = request.provider;
        let handled = self.dispatch_rerecord(mode, request).await;
        self.emit(provider, mode, started, &handled);
        handled.result
    }

    async fn dispatch(&self, mode: VcrMode, request: ProviderRequest) -> Handled {
        if mode == VcrMode::Off {
            return self.passthrough(request).await;
        }

        let provider = request.provider;
        let canonical = match canonicalize(&request) {
            Ok(canonical) => canonical,
            Err(e) => return Handled::failed(TraceOutcome::Invalid, None, e),
        };
        let signature = fingerprint(&canonical);

        match decide(mode, None) {
            Decision::Lookup => {}
            Decision::Record => {
                return self
                    .record(request, canonical, signature, TraceOutcome::Record)
                    .await;
            }
            other => {
                return Handled::failed(
                    TraceOutcome::Invalid,
                    Some(signature),
                    VcrError::internal(format!("unexpected decision {other:?} before lookup")),
                );
            }
        }

        let lookup = match self.lookup(provider, &signature).await {
            Ok(lookup) => lookup,
            Err(e) => return Handled::failed(TraceOutcome::Unavailable, Some(signature), e),
        };
        let outcome = match &lookup {
            LookupResult::Hit(_) => TraceOutcome::Hit,
            LookupResult::Miss => TraceOutcome::Miss,
            LookupResult::Corrupt(_) => TraceOutcome::Corrupt,
        };

        let decision = decide(mode, Some(&lookup));
        match (decision, lookup) {
            (Decision::Serve, LookupResult::Hit(cassette)) => {
                tracing::debug!(provider = %provider, signature = %signature, "serving cassette");
                Handled {
                    result: VcrResponse::from_cassette(*cassette),
                    outcome,
                    signature: Some(signature),
                    coalesced: false,
                }
            }
            (Decision::Record, _) => self.record(request, canonical, signature, outcome).await,
            (Decision::Refuse(refusal), _) => {
                let error = self.refusal_error(provider, &signature, refusal);
                Handled::failed(outcome, Some(signature), error)
            }
            (decision, _) => Handled::failed(
                outcome,
                Some(signature),
                VcrError::internal(format!("unexpected decision {decision:?} after lookup")),
            ),
        }
    }

    async fn dispatch_rerecord(&self, mode: VcrMode, request: ProviderRequest) -> Handled {
        let canonical = match canonicalize(&request) {
            Ok(canonical) => canonical,
            Err(e) => return Handled::failed(TraceOutcome::Invalid, None, e),
        };
        let signature = fingerprint(&canonical);

        if !mode.allows_rerecord() {
            let error = if mode == VcrMode::Strict {
                VcrError::StrictRecordForbidden {
                    provider: request.provider,
                    signature: signature.clone(),
                }
            } else {
                VcrError::RecordingDisabled {
                    provider: request.provider,
                    signature: signature.clone(),
                    mode,
                }
            };
            tracing::warn!(
                provider = %request.provider,
                signature = %signature,
                mode = %mode,
                "re-record refused"
            );
            return Handled::failed(TraceOutcome::Record, Some(signature), error);
        }

        tracing::info!(
            provider = %request.provider,
            signature = %signature,
            "re-recording cassette"
        );
        self.record(request, canonical, signature, TraceOutcome::Record)
            .await
    }

    async fn passthrough(&self, request: ProviderRequest) -> Handled {
        let signature = canonicalize(&request).ok().map(|c| fingerprint(&c));
        let result = call_upstream(
            self.upstream.as_ref(),
            &request,
            signature.as_ref(),
            self.session.upstream_timeout(),
        )
        .await
        .map(|response| VcrResponse::from_upstream(response, signature.clone()));
        Handled {
            result,
            outcome: TraceOutcome::Off,
            signature,
            coalesced: false,
        }
    }

    async fn record(
        &self,
        request: ProviderRequest,
        canonical: CanonicalRequest,
        signature: Signature,
        outcome: TraceOutcome,
    ) -> Handled {
        let provider = request.provider;
        let work = call_and_persist(
            Arc::clone(&self.upstream),
            Arc::clone(&self.store),
            Arc::clone(&self.session),
            request,
            canonical,
            signature.clone(),
        );
        let (result, started) = self.inflight.run(provider, &signature, work).await;
        Handled {
            result: result
                .map(|response| VcrResponse::from_upstream(response, Some(signature.clone()))),
            outcome,
            signature: Some(signature),
            coalesced: !started,
        }
    }

    async fn lookup(&self, provider: Provider, signature: &Signature) -> Result<LookupResult> {
        let store = Arc::clone(&self.store);
        let target = StorageTarget::new(&store, provider, signature);
        let signature = signature.clone();
        run_blocking(self.session.storage_timeout(), target, move || {
            store.lookup(provider, &signature)
        })
        .await
    }

    fn refusal_error(
        &self,
        provider: Provider,
        signature: &Signature,
        refusal: Refusal,
    ) -> VcrError {
        let cassette = self.store.cassette_path(provider, signature);
        let signature = signature.clone();
        match refusal {
            Refusal::ReplayMiss => {
                tracing::warn!(provider = %provider, signature = %signature, "replay miss");
                VcrError::ReplayMiss {
                    provider,
                    signature,
                    cassette,
                }
            }
            Refusal::StrictMiss => {
                tracing::error!(
                    provider = %provider,
                    signature = %signature,
                    cassette = %cassette.display(),
                    "strict miss: request has no recorded cassette"
                );
                VcrError::StrictMiss {
                    provider,
                    signature,
                    cassette,
                }
            }
            Refusal::Corrupt(corruption) => {
                tracing::error!(
                    provider = %provider,
                    signature = %signature,
                    expected = %corruption.expected,
                    actual = %corruption.actual,
                    detail = %corruption.detail,
                    "cassette failed integrity check"
                );
                VcrError::IntegrityViolation {
                    provider,
                    signature,
                    cassette,
                    expected: corruption.expected,
                    actual: corruption.actual,
                    detail: corruption.detail,
                }
            }
        }
    }

    fn emit(&self, provider: Provider, mode: VcrMode, started: Instant, handled: &Handled) {
        self.trace.emit(&TraceEvent {
            provider,
            signature: handled.signature.clone(),
            mode,
            outcome: handled.outcome,
            duration: started.elapsed(),
            status: handled.result.as_ref().ok().map(|r| r.status),
            error: handled.result.as_ref().err().map(VcrError::category),
            coalesced: handled.coalesced,
        });
    }
}

/// Call upstream and persist the redacted exchange, whatever its status.
/// Runs detached from the caller so a cancelled caller never
/// leaves a half-finished recording.
async fn call_and_persist(
    upstream: Arc<dyn Upstream>,
    store: Arc<CassetteStore>,
    session: Arc<VcrSession>,
    request: ProviderRequest,
    canonical: CanonicalRequest,
    signature: Signature,
) -> CallResult {
    let provider = request.provider;
    let response = call_upstream(
        upstream.as_ref(),
        &request,
        Some(&signature),
        session.upstream_timeout(),
    )
    .await?;
    if !response.is_success() {
        tracing::warn!(
            provider = %provider,
            signature = %signature,
            status = response.status,
            "recording non-success upstream status"
        );
    }

    let (request_body, response_body) = redact_for_persist(
        session.redactor(),
        canonical.body,
        ResponseBody::from_bytes(&response.body),
    );
    let body = CassetteBody {
        fingerprint: signature.clone(),
        provider,
        tool_version: TOOL_VERSION.to_string(),
        recorded_at: Utc::now(),
        status: response.status,
        request: RecordedRequest {
            endpoint: canonical.endpoint,
            body: request_body,
        },
        response: RecordedResponse {
            headers: recorded_headers(&response.headers),
            body: response_body,
        },
    };

    let target = StorageTarget::new(&store, provider, &signature);
    let writer = Arc::clone(&store);
    run_blocking(session.storage_timeout(), target, move || writer.write(body)).await?;
    tracing::info!(provider = %provider, signature = %signature, "cassette recorded");
    Ok(response)
}

async fn call_upstream(
    upstream: &dyn Upstream,
    request: &ProviderRequest,
    signature: Option<&Signature>,
    timeout: Duration,
) -> Result<UpstreamResponse> {
    let source = match tokio::time::timeout(timeout, upstream.call(request)).await {
        Ok(Ok(response)) => return Ok(response),
        Ok(Err(e)) => e,
        Err(_) => UpstreamError::Timeout(timeout),
    };
    tracing::warn!(
        provider = %request.provider,
        error = %source,
        "upstream call failed"
    );
    Err(VcrError::Upstream {
        provider: request.provider,
        signature: signature.cloned(),
        source,
    })
}

/// The cassette a blocking store operation acts on, named in timeout errors.
struct StorageTarget {
    provider: Provider,
    signature: Signature,
    path: PathBuf,
}

impl StorageTarget {
    fn new(store: &CassetteStore, provider: Provider, signature: &Signature) -> Self {
        Self {
            provider,
            signature: signature.clone(),
            path: store.cassette_path(provider, signature),
        }
    }
}

/// Run a blocking store operation on the blocking pool with a deadline.
/// On timeout the operation keeps running but its result is discarded.
async fn run_blocking<T, F>(timeout: Duration, target: StorageTarget, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(VcrError::internal(format!("storage task failed: {e}"))),
        Err(_) => {
            tracing::warn!(
                provider = %target.provider,
                signature = %target.signature,
                timeout = ?timeout,
                "storage operation timed out"
            );
            Err(VcrError::StorageTimeout {
                provider: target.provider,
                signature: target.signature,
                path: target.path,
                timeout,
            })
        }
    }
}
