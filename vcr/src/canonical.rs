//! Canonical request form.
//!
//! Two requests that would produce the same model output must canonicalize to
//! the same bytes: object keys are sorted at every depth, transport-only
//! fields are dropped, and credentials in the endpoint query are removed.
//! Array order is preserved because message order is meaningful.

use serde_json::Map;
use serde_json::Value;

use crate::error::Result;
use crate::error::VcrError;
use crate::provider::CREDENTIAL_QUERY_PARAMS;
use crate::provider::Provider;

/// A provider-native request as issued by application code.
///
/// Headers are forwarded to the upstream untouched. They never take part in
/// the signature and are never written to a cassette.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider: Provider,
    /// Path (and optional query) relative to the provider base URL,
    /// e.g. `/v1/chat/completions`.
    pub endpoint: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl ProviderRequest {
    pub fn new(provider: Provider, endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            provider,
            endpoint: endpoint.into(),
            body,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Normalized request ready for fingerprinting and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub provider: Provider,
    pub endpoint: String,
    /// Request body with transport fields removed and keys sorted.
    pub body: Value,
    bytes: Vec<u8>,
}

impl CanonicalRequest {
    /// Stable serialized form; the fingerprint input.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Produce the canonical form of a request.
///
/// Pure: performs no I/O. Fails when the body is not a JSON object or lacks
/// a field the provider requires.
pub fn canonicalize(request: &ProviderRequest) -> Result<CanonicalRequest> {
    let provider = request.provider;
    let rules = provider.rules();

    let Value::Object(fields) = &request.body else {
        return Err(invalid(provider, "request body must be a JSON object"));
    };

    for field in rules.required_fields {
        if is_absent(fields.get(*field)) {
            return Err(invalid(provider, format!("missing required field '{field}'")));
        }
    }
    if !rules.content_fields.is_empty()
        && rules
            .content_fields
            .iter()
            .all(|field| is_absent(fields.get(*field)))
    {
        return Err(invalid(
            provider,
            format!(
                "request carries no content (expected one of: {})",
                rules.content_fields.join(", ")
            ),
        ));
    }

    // Explicit null and absent are the same request.
    let mut body = Map::new();
    let mut keys: Vec<&String> = fields
        .iter()
        .filter(|(key, value)| !value.is_null() && !rules.is_transport_field(key))
        .map(|(key, _)| key)
        .collect();
    keys.sort();
    for key in keys {
        if let Some(value) = fields.get(key) {
            body.insert(key.clone(), canonicalize_value(value));
        }
    }
    let body = Value::Object(body);

    let endpoint = normalize_endpoint(&request.endpoint)
        .ok_or_else(|| invalid(provider, "endpoint must be an absolute path"))?;

    let mut envelope = Map::new();
    envelope.insert("body".to_string(), body.clone());
    envelope.insert("endpoint".to_string(), Value::String(endpoint.clone()));
    let bytes = serde_json::to_vec(&Value::Object(envelope))
        .map_err(|e| VcrError::internal(format!("serialize canonical request: {e}")))?;

    Ok(CanonicalRequest {
        provider,
        endpoint,
        body,
        bytes,
    })
}

/// Rebuild a JSON value with object keys in sorted order at every depth.
pub fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize_value(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

/// Serialize a value in canonical form.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(&canonicalize_value(value))
        .map_err(|e| VcrError::internal(format!("serialize canonical value: {e}")))
}

/// Strip credentials from the query, sort the remaining parameters, and
/// drop a trailing slash. Returns `None` for relative or empty paths.
fn normalize_endpoint(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim();
    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };
    if !path.starts_with('/') {
        return None;
    }
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    let mut params: Vec<&str> = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            !CREDENTIAL_QUERY_PARAMS.contains(&name)
        })
        .collect();
    params.sort_unstable();

    if params.is_empty() {
        Some(path.to_string())
    } else {
        Some(format!("{path}?{}", params.join("&")))
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    value.is_none_or(Value::is_null)
}

fn invalid(provider: Provider, reason: impl Into<String>) -> VcrError {
    VcrError::Canonicalization {
        provider,
        reason: reason.into(),
    }
}
