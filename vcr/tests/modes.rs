#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end behavior of each mode against a real on-disk store.

mod common;

use std::time::Duration;

use codex_vcr::ErrorCategory;
use codex_vcr::LookupResult;
use codex_vcr::Provider;
use codex_vcr::ResponseSource;
use codex_vcr::TraceOutcome;
use codex_vcr::UpstreamError;
use codex_vcr::VcrError;
use codex_vcr::VcrMode;
use codex_vcr::VcrSession;
use codex_vcr::canonicalize;
use codex_vcr::fingerprint;
use common::FakeUpstream;
use common::cassette_files;
use common::chat;
use common::harness;
use common::harness_with_session;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn auto_records_on_miss_then_replay_serves_identical_bytes() {
    let dir = TempDir::new().unwrap();

    let auto = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    let recorded = auto.controller.handle(chat("What is 2+2?")).await.unwrap();
    assert_eq!(auto.upstream.calls(), 1);
    assert_eq!(recorded.source, ResponseSource::Upstream);

    let signature = recorded.signature.clone().expect("signature");
    let expected =
        fingerprint(&canonicalize(&chat("What is 2+2?")).expect("canonicalize"));
    assert_eq!(signature, expected);
    let path = auto.controller.store().cassette_path(Provider::OpenAi, &signature);
    assert!(path.exists(), "cassette written at {}", path.display());

    let events = auto.trace.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, TraceOutcome::Miss);
    assert_eq!(events[0].signature.as_ref(), Some(&signature));

    let replay = harness(dir.path(), VcrMode::Replay, FakeUpstream::new());
    let served = replay.controller.handle(chat("What is 2+2?")).await.unwrap();
    assert_eq!(replay.upstream.calls(), 0);
    assert_eq!(served.source, ResponseSource::Cassette);
    assert_eq!(served.body, recorded.body);
    assert_eq!(served.status, 200);
    assert_eq!(
        served.headers,
        vec![("content-type".to_string(), "application/json".to_string())]
    );
    assert_eq!(replay.trace.events()[0].outcome, TraceOutcome::Hit);
}

#[tokio::test]
async fn replay_preserves_upstream_json_formatting() {
    let dir = TempDir::new().unwrap();
    let upstream_bytes = concat!(
        "{\n",
        "  \"id\": \"chatcmpl-1\",\n",
        "  \"object\": \"chat.completion\",\n",
        "  \"usage\": {\"total_tokens\": 1e2}\n",
        "}\n",
    );

    let record = harness(
        dir.path(),
        VcrMode::Record,
        FakeUpstream::new().with_body(upstream_bytes),
    );
    let recorded = record.controller.handle(chat("format")).await.unwrap();
    assert_eq!(recorded.body, upstream_bytes.as_bytes());

    let replay = harness(dir.path(), VcrMode::Replay, FakeUpstream::new());
    let replayed = replay.controller.handle(chat("format")).await.unwrap();
    assert_eq!(replayed.source, ResponseSource::Cassette);
    assert_eq!(replayed.body, recorded.body);
}

#[tokio::test]
async fn auto_hit_does_not_call_upstream() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    let first = h.controller.handle(chat("hi")).await.unwrap();
    let second = h.controller.handle(chat("hi")).await.unwrap();
    assert_eq!(h.upstream.calls(), 1);
    assert_eq!(first.body, second.body);
    assert_eq!(second.source, ResponseSource::Cassette);
}

#[tokio::test]
async fn transport_fields_replay_the_same_cassette() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    h.controller.handle(chat("hi")).await.unwrap();

    let mut noisy = chat("hi");
    noisy.body["user"] = json!("user-42");
    noisy.body["request_id"] = json!("abc");
    let noisy = noisy.with_header("authorization", "Bearer sk-other");
    let served = h.controller.handle(noisy).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cassette);
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn strict_miss_fails_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let seed = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    seed.controller.handle(chat("recorded")).await.unwrap();
    let before = cassette_files(dir.path());

    let strict = harness(dir.path(), VcrMode::Strict, FakeUpstream::new());
    let err = strict
        .controller
        .handle(chat("never recorded"))
        .await
        .expect_err("strict miss");

    let signature = fingerprint(&canonicalize(&chat("never recorded")).unwrap());
    match &err {
        VcrError::StrictMiss {
            provider,
            signature: missing,
            cassette,
        } => {
            assert_eq!(*provider, Provider::OpenAi);
            assert_eq!(*missing, signature);
            assert!(cassette.ends_with(format!("openai/{signature}.json")));
        }
        other => panic!("expected StrictMiss, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains(signature.as_str()));
    assert!(message.contains("CODEX_VCR_MODE=record"));

    assert_eq!(strict.upstream.calls(), 0);
    assert_eq!(cassette_files(dir.path()), before);

    let events = strict.trace.events();
    assert_eq!(events[0].outcome, TraceOutcome::Miss);
    assert_eq!(events[0].error, Some(ErrorCategory::StrictMiss));
}

#[tokio::test]
async fn strict_hit_is_served() {
    let dir = TempDir::new().unwrap();
    harness(dir.path(), VcrMode::Record, FakeUpstream::new())
        .controller
        .handle(chat("ci fixture"))
        .await
        .unwrap();

    let strict = harness(dir.path(), VcrMode::Strict, FakeUpstream::new());
    let served = strict.controller.handle(chat("ci fixture")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cassette);
    assert_eq!(strict.upstream.calls(), 0);
}

#[tokio::test]
async fn strict_with_missing_store_root_misses() {
    let dir = TempDir::new().unwrap();
    let strict = harness(
        &dir.path().join("does-not-exist"),
        VcrMode::Strict,
        FakeUpstream::new(),
    );
    let err = strict.controller.handle(chat("x")).await.unwrap_err();
    assert!(matches!(err, VcrError::StrictMiss { .. }));
    assert!(!dir.path().join("does-not-exist").exists());
}

#[tokio::test]
async fn replay_miss_is_an_error() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Replay, FakeUpstream::new());
    let err = h.controller.handle(chat("unknown")).await.unwrap_err();
    assert!(matches!(err, VcrError::ReplayMiss { .. }), "{err:?}");
    assert_eq!(err.category(), ErrorCategory::ReplayMiss);
    assert_eq!(h.upstream.calls(), 0);
    assert!(cassette_files(dir.path()).is_empty());
}

#[tokio::test]
async fn off_mode_never_touches_the_store() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cassettes");
    let h = harness(&root, VcrMode::Off, FakeUpstream::new());
    let first = h.controller.handle(chat("hi")).await.unwrap();
    h.controller.handle(chat("hi")).await.unwrap();

    assert_eq!(h.upstream.calls(), 2);
    assert_eq!(first.source, ResponseSource::Upstream);
    assert!(!root.exists());

    let events = h.trace.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.outcome == TraceOutcome::Off));
    assert!(events[0].signature.is_some());
}

#[tokio::test]
async fn off_mode_passes_through_unfingerprintable_requests() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Off, FakeUpstream::new());
    let request = codex_vcr::ProviderRequest::new(Provider::OpenAi, "/v1/models", json!({}));
    let response = h.controller.handle(request).await.unwrap();
    assert_eq!(response.signature, None);
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn record_mode_always_overwrites() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Record, FakeUpstream::new());
    h.controller.handle(chat("hi")).await.unwrap();
    let second = h.controller.handle(chat("hi")).await.unwrap();
    assert_eq!(h.upstream.calls(), 2);
    assert!(
        h.trace
            .events()
            .iter()
            .all(|e| e.outcome == TraceOutcome::Record)
    );

    let signature = second.signature.unwrap();
    match h.controller.store().lookup(Provider::OpenAi, &signature).unwrap() {
        LookupResult::Hit(cassette) => {
            let body = cassette.body.response.body.to_bytes().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(value, FakeUpstream::body_for_call(1));
        }
        other => panic!("expected hit, got {other:?}"),
    }
    assert_eq!(cassette_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn malformed_request_fails_before_any_io() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cassettes");
    let h = harness(&root, VcrMode::Auto, FakeUpstream::new());
    let request = codex_vcr::ProviderRequest::new(
        Provider::Anthropic,
        "/v1/messages",
        json!({"messages": [{"role": "user", "content": "no model"}]}),
    );
    let err = h.controller.handle(request).await.unwrap_err();
    assert!(matches!(err, VcrError::Canonicalization { .. }));
    assert_eq!(h.upstream.calls(), 0);
    assert!(!root.exists());

    let events = h.trace.events();
    assert_eq!(events[0].outcome, TraceOutcome::Invalid);
    assert_eq!(events[0].signature, None);
}

#[tokio::test]
async fn upstream_failure_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new().failing());
    let err = h.controller.handle(chat("hi")).await.unwrap_err();
    assert!(matches!(err, VcrError::Upstream { .. }), "{err:?}");
    assert!(cassette_files(dir.path()).is_empty());
    assert_eq!(h.trace.events()[0].error, Some(ErrorCategory::Upstream));
}

#[tokio::test]
async fn non_success_responses_are_recorded_and_replayed() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new().with_status(429));
    let response = h.controller.handle(chat("hi")).await.unwrap();
    assert_eq!(response.status, 429);
    assert_eq!(cassette_files(dir.path()).len(), 1);

    let strict = harness(dir.path(), VcrMode::Strict, FakeUpstream::new());
    let replayed = strict.controller.handle(chat("hi")).await.unwrap();
    assert_eq!(strict.upstream.calls(), 0);
    assert_eq!(replayed.source, ResponseSource::Cassette);
    assert_eq!(replayed.status, 429);
    assert_eq!(replayed.body, response.body);
}

#[tokio::test]
async fn record_mode_overwrites_an_error_with_a_success() {
    let dir = TempDir::new().unwrap();
    let failing = harness(dir.path(), VcrMode::Record, FakeUpstream::new().with_status(400));
    failing.controller.handle(chat("hi")).await.unwrap();

    let record = harness(dir.path(), VcrMode::Record, FakeUpstream::new());
    record.controller.handle(chat("hi")).await.unwrap();

    let replay = harness(dir.path(), VcrMode::Replay, FakeUpstream::new());
    let replayed = replay.controller.handle(chat("hi")).await.unwrap();
    assert_eq!(replayed.status, 200);
    assert_eq!(cassette_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn upstream_timeout_is_reported() {
    let dir = TempDir::new().unwrap();
    let session =
        VcrSession::new(VcrMode::Auto, dir.path()).with_upstream_timeout(Duration::from_millis(50));
    let h = harness_with_session(
        session,
        FakeUpstream::new().with_delay(Duration::from_secs(5)),
    );
    let err = h.controller.handle(chat("slow")).await.unwrap_err();
    match err {
        VcrError::Upstream {
            source: UpstreamError::Timeout(timeout),
            ..
        } => assert_eq!(timeout, Duration::from_millis(50)),
        other => panic!("expected upstream timeout, got {other:?}"),
    }
    assert!(cassette_files(dir.path()).is_empty());
}

#[tokio::test]
async fn storage_failure_after_upstream_success_is_fatal() {
    let dir = TempDir::new().unwrap();
    // A file where the provider directory should be makes writes fail.
    std::fs::write(dir.path().join("openai"), b"not a directory").unwrap();

    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    let err = h.controller.handle(chat("hi")).await.unwrap_err();
    assert!(matches!(err, VcrError::Storage { .. }), "{err:?}");
    assert_eq!(h.upstream.calls(), 1);

    let events = h.trace.events();
    assert_eq!(events[0].outcome, TraceOutcome::Miss);
    assert_eq!(events[0].error, Some(ErrorCategory::Storage));
}

#[tokio::test]
async fn redaction_applies_to_persisted_payloads_only() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());

    let mut request = chat("use the tool");
    request.body["tools"] = json!([{"type": "search", "config": {"api_key": "sk-live-secret"}}]);
    let signature = fingerprint(&canonicalize(&request).unwrap());
    let response = h.controller.handle(request).await.unwrap();
    assert_eq!(response.signature.as_ref(), Some(&signature));

    let text = std::fs::read_to_string(
        h.controller
            .store()
            .cassette_path(Provider::OpenAi, &signature),
    )
    .unwrap();
    assert!(!text.contains("sk-live-secret"));
    assert!(text.contains("[REDACTED]"));
    assert!(!text.contains("x-request-id"));
}

/// Record one cassette, then edit its response in place without resealing.
async fn tampered_store(root: &std::path::Path) -> std::path::PathBuf {
    let h = harness(root, VcrMode::Auto, FakeUpstream::new());
    let response = h.controller.handle(chat("tamper me")).await.unwrap();
    let path = h
        .controller
        .store()
        .cassette_path(Provider::OpenAi, &response.signature.unwrap());
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    value["response"]["body"]["content"]["id"] = json!("forged");
    std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn tampered_cassette_is_refused_in_replay_and_auto() {
    let dir = TempDir::new().unwrap();
    let path = tampered_store(dir.path()).await;
    let tampered = std::fs::read(&path).unwrap();

    for mode in [VcrMode::Replay, VcrMode::Auto, VcrMode::Strict] {
        let h = harness(dir.path(), mode, FakeUpstream::new());
        let err = h.controller.handle(chat("tamper me")).await.unwrap_err();
        match &err {
            VcrError::IntegrityViolation {
                expected, actual, ..
            } => assert_ne!(expected, actual),
            other => panic!("{mode}: expected IntegrityViolation, got {other:?}"),
        }
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert_eq!(h.upstream.calls(), 0, "{mode} must not call upstream");
        assert_eq!(h.trace.events()[0].outcome, TraceOutcome::Corrupt);
    }

    assert_eq!(std::fs::read(&path).unwrap(), tampered);
}

#[tokio::test]
async fn rerecord_replaces_a_corrupt_cassette() {
    let dir = TempDir::new().unwrap();
    tampered_store(dir.path()).await;

    let auto = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    let fresh = auto.controller.rerecord(chat("tamper me")).await.unwrap();
    assert_eq!(fresh.source, ResponseSource::Upstream);
    assert_eq!(auto.upstream.calls(), 1);

    let replay = harness(dir.path(), VcrMode::Replay, FakeUpstream::new());
    let served = replay.controller.handle(chat("tamper me")).await.unwrap();
    assert_eq!(served.body, fresh.body);
}

#[tokio::test]
async fn rerecord_is_refused_in_strict_mode() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Strict, FakeUpstream::new());
    let err = h.controller.rerecord(chat("hi")).await.unwrap_err();
    assert!(matches!(err, VcrError::StrictRecordForbidden { .. }), "{err:?}");
    assert_eq!(err.category(), ErrorCategory::RecordForbidden);
    assert_eq!(h.upstream.calls(), 0);
    assert!(cassette_files(dir.path()).is_empty());
}

#[tokio::test]
async fn rerecord_is_refused_in_off_mode() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Off, FakeUpstream::new());
    let err = h.controller.rerecord(chat("hi")).await.unwrap_err();
    assert!(matches!(err, VcrError::RecordingDisabled { .. }), "{err:?}");
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn shared_session_handles_every_provider() {
    let dir = TempDir::new().unwrap();
    let h = harness(dir.path(), VcrMode::Auto, FakeUpstream::new());
    let requests = vec![
        chat("hi"),
        codex_vcr::ProviderRequest::new(
            Provider::Anthropic,
            "/v1/messages",
            json!({
                "model": "claude-sonnet",
                "max_tokens": 64,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ),
        codex_vcr::ProviderRequest::new(
            Provider::Gemini,
            "/v1beta/models/gemini-1.5-flash:generateContent",
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}),
        ),
        codex_vcr::ProviderRequest::new(
            Provider::Ollama,
            "/api/chat",
            json!({
                "model": "llama3",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }),
        ),
    ];
    for request in requests {
        h.controller.handle(request).await.unwrap();
    }
    let files = cassette_files(dir.path());
    assert_eq!(files.len(), 4);
    for provider in Provider::ALL {
        assert!(
            files
                .iter()
                .any(|f| f.parent().unwrap().ends_with(provider.as_str())),
            "missing {provider} cassette"
        );
    }
    assert_eq!(h.upstream.calls(), 4);
}
