//! On-disk cassette format.
//!
//! A cassette is one recorded request/response pair stored as pretty JSON:
//!
//! ```json
//! {
//!   "fingerprint": "…32 hex…",
//!   "provider": "openai",
//!   "tool_version": "0.0.0",
//!   "recorded_at": "2026-10-18T09:00:00Z",
//!   "status": 200,
//!   "request": { "endpoint": "/v1/chat/completions", "body": { … } },
//!   "response": { "headers": { … }, "body": { "encoding": "json", "content": … } },
//!   "integrity_seal": "sha256:…"
//! }
//! ```
//!
//! The seal covers the canonical serialization of every field except
//! `integrity_seal` itself.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::fingerprint::Signature;
use crate::provider::Provider;

/// Response headers worth keeping in a cassette. Everything else (dates,
/// request ids, rate-limit counters, cookies) varies per call.
pub const RECORDED_HEADERS: &[&str] = &[
    "content-type",
    "openai-model",
    "openai-version",
    "anthropic-version",
];

/// Version stamped into new cassettes.
pub const TOOL_VERSION: &str = crate::VERSION;

/// Name of the seal field inside a cassette file.
pub const SEAL_FIELD: &str = "integrity_seal";

/// Everything in a cassette that the seal covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CassetteBody {
    pub fingerprint: Signature,
    pub provider: Provider,
    pub tool_version: String,
    pub recorded_at: DateTime<Utc>,
    pub status: u16,
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

/// A sealed cassette as read from or written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cassette {
    #[serde(flatten)]
    pub body: CassetteBody,
    pub integrity_seal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub endpoint: String,
    /// Canonical request body after redaction.
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResponse {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

/// A response body in the most reviewable form that still reproduces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "content", rename_all = "snake_case")]
pub enum ResponseBody {
    /// JSON whose compact serialization is exactly the upstream bytes.
    Json(Value),
    /// Any other UTF-8 text: pretty-printed JSON, SSE streams, plain text.
    Text(String),
    /// Anything else.
    Base64(String),
}

impl ResponseBody {
    /// Pick an encoding whose [`ResponseBody::to_bytes`] yields `bytes`
    /// unchanged.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes)
            && serde_json::to_vec(&value).is_ok_and(|compact| compact == bytes)
        {
            return Self::Json(value);
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_string()),
            Err(_) => Self::Base64(STANDARD.encode(bytes)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        match self {
            Self::Json(value) => {
                serde_json::to_vec(value).map_err(|e| format!("serialize json body: {e}"))
            }
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Base64(encoded) => STANDARD
                .decode(encoded)
                .map_err(|e| format!("decode base64 body: {e}")),
        }
    }
}

/// Keep only the allowlisted headers, lowercased.
pub fn recorded_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.to_ascii_lowercase();
            RECORDED_HEADERS
                .contains(&name.as_str())
                .then(|| (name, value.clone()))
        })
        .collect()
}
