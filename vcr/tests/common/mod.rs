#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]
//! Shared fixtures for integration tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use codex_vcr::MemoryTraceSink;
use codex_vcr::ModeController;
use codex_vcr::Provider;
use codex_vcr::ProviderRequest;
use codex_vcr::Upstream;
use codex_vcr::UpstreamError;
use codex_vcr::UpstreamResponse;
use codex_vcr::VcrMode;
use codex_vcr::VcrSession;
use serde_json::Value;
use serde_json::json;

/// Scripted upstream that counts calls. Each response body carries the
/// zero-based call index so tests can tell recordings apart.
pub struct FakeUpstream {
    calls: AtomicUsize,
    delay: Duration,
    status: u16,
    fail: bool,
    body: Option<Vec<u8>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            status: 200,
            fail: false,
            body: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Return exactly `body` on every call instead of [`Self::body_for_call`].
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Body the fake returns on call `n`.
    pub fn body_for_call(n: usize) -> Value {
        json!({
            "id": format!("resp-{n}"),
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": format!("hello from resp-{n}")}
            }]
        })
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn call(&self, _request: &ProviderRequest) -> Result<UpstreamResponse, UpstreamError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(UpstreamError::Transport {
                url: "fake://upstream".to_string(),
                message: "connection refused".to_string(),
            });
        }
        let body = match &self.body {
            Some(body) => body.clone(),
            None => serde_json::to_vec(&Self::body_for_call(n)).unwrap(),
        };
        Ok(UpstreamResponse {
            status: self.status,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("x-request-id".to_string(), format!("req-{n}")),
            ],
            body,
        })
    }
}

pub struct Harness {
    pub controller: ModeController,
    pub upstream: Arc<FakeUpstream>,
    pub trace: Arc<MemoryTraceSink>,
}

pub fn harness(root: &Path, mode: VcrMode, upstream: FakeUpstream) -> Harness {
    harness_with_session(VcrSession::new(mode, root), upstream)
}

pub fn harness_with_session(session: VcrSession, upstream: FakeUpstream) -> Harness {
    let upstream = Arc::new(upstream);
    let trace = Arc::new(MemoryTraceSink::new());
    let controller = ModeController::new(session, upstream.clone(), trace.clone());
    Harness {
        controller,
        upstream,
        trace,
    }
}

/// OpenAI chat request with a single user message.
pub fn chat(content: &str) -> ProviderRequest {
    ProviderRequest::new(
        Provider::OpenAi,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o-mini",
            "temperature": 0,
            "messages": [{"role": "user", "content": content}]
        }),
    )
}

/// Every cassette file under `root`, excluding temp files.
pub fn cassette_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    for provider in Provider::ALL {
        let Ok(entries) = std::fs::read_dir(root.join(provider.as_str())) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}
