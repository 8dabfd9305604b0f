//! Redaction applied to payloads before they are written to disk.
//!
//! Redaction never touches the signature (computed earlier from the
//! unredacted canonical request) nor the response returned to the caller.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use crate::cassette::ResponseBody;

/// Placeholder written in place of a redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Keys redacted by [`KeyRedactor::default`].
pub const DEFAULT_REDACTED_KEYS: &[&str] = &["api_key", "authorization", "x-api-key"];

/// Transforms a JSON payload before persistence.
///
/// Implementations must be pure: the same input always yields the same
/// output, and nothing outside the payload is read or written.
pub trait Redactor: Send + Sync + fmt::Debug {
    fn redact(&self, payload: Value) -> Value;
}

/// Leaves payloads untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn redact(&self, payload: Value) -> Value {
        payload
    }
}

/// Replaces the value of any object key in a configured set, at any depth.
/// Key matching ignores ASCII case.
#[derive(Debug, Clone)]
pub struct KeyRedactor {
    keys: BTreeSet<String>,
}

impl KeyRedactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn walk(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, inner)| {
                        if self.keys.contains(&key.to_ascii_lowercase()) {
                            (key, Value::String(REDACTED.to_string()))
                        } else {
                            let inner = self.walk(inner);
                            (key, inner)
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.walk(v)).collect()),
            other => other,
        }
    }
}

impl Default for KeyRedactor {
    fn default() -> Self {
        Self::new(DEFAULT_REDACTED_KEYS)
    }
}

impl Redactor for KeyRedactor {
    fn redact(&self, payload: Value) -> Value {
        self.walk(payload)
    }
}

/// Apply `redactor` to the request body and response body about to be
/// persisted. Binary response bodies pass through unchanged. Text that parses
/// as JSON is redacted structurally and kept verbatim when nothing changed;
/// other text is offered to the redactor as a JSON string.
pub fn redact_for_persist(
    redactor: &dyn Redactor,
    request_body: Value,
    response_body: ResponseBody,
) -> (Value, ResponseBody) {
    let request_body = redactor.redact(request_body);
    let response_body = match response_body {
        ResponseBody::Json(value) => ResponseBody::Json(redactor.redact(value)),
        ResponseBody::Text(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => {
                let redacted = redactor.redact(parsed.clone());
                if redacted == parsed {
                    ResponseBody::Text(text)
                } else {
                    ResponseBody::Json(redacted)
                }
            }
            Err(_) => match redactor.redact(Value::String(text)) {
                Value::String(text) => ResponseBody::Text(text),
                other => ResponseBody::Json(other),
            },
        },
        binary @ ResponseBody::Base64(_) => binary,
    };
    (request_body, response_body)
}
