//! Supported model providers and the per-provider request rules.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Identifier for a supported model provider.
///
/// The lowercase name doubles as the store namespace and is mixed into
/// every signature, so identical bodies sent to two providers never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    /// Request rules for this provider.
    pub fn rules(self) -> &'static ProviderRules {
        match self {
            Self::OpenAi => &OPENAI,
            Self::Anthropic => &ANTHROPIC,
            Self::Gemini => &GEMINI,
            Self::Ollama => &OLLAMA,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}' (expected one of: openai, anthropic, gemini, ollama)")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Fields every provider treats as transport metadata.
pub const COMMON_TRANSPORT_FIELDS: &[&str] = &["request_id", "timestamp"];

/// Query parameters that carry credentials and never reach a signature.
pub const CREDENTIAL_QUERY_PARAMS: &[&str] = &["key", "api_key", "api-key"];

/// Shape rules for one provider's request bodies.
#[derive(Debug)]
pub struct ProviderRules {
    /// Top-level fields that must be present.
    pub required_fields: &'static [&'static str],
    /// At least one of these must be present. Empty means no constraint.
    pub content_fields: &'static [&'static str],
    /// Top-level fields that do not change the model's output and are
    /// stripped before hashing.
    pub transport_fields: &'static [&'static str],
    /// Base URL used by the HTTP upstream when no override is configured.
    pub default_base_url: &'static str,
}

static OPENAI: ProviderRules = ProviderRules {
    required_fields: &["model"],
    content_fields: &["messages", "input", "prompt"],
    transport_fields: &["user", "store", "metadata"],
    default_base_url: "https://api.openai.com",
};

static ANTHROPIC: ProviderRules = ProviderRules {
    required_fields: &["model", "messages"],
    content_fields: &[],
    transport_fields: &["metadata"],
    default_base_url: "https://api.anthropic.com",
};

// Gemini names the model in the endpoint path, not the body.
static GEMINI: ProviderRules = ProviderRules {
    required_fields: &["contents"],
    content_fields: &[],
    transport_fields: &["labels"],
    default_base_url: "https://generativelanguage.googleapis.com",
};

static OLLAMA: ProviderRules = ProviderRules {
    required_fields: &["model"],
    content_fields: &["messages", "prompt", "input"],
    transport_fields: &["keep_alive"],
    default_base_url: "http://localhost:11434",
};

impl ProviderRules {
    pub fn is_transport_field(&self, key: &str) -> bool {
        COMMON_TRANSPORT_FIELDS.contains(&key) || self.transport_fields.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<Provider>(), Ok(Provider::OpenAi));
        assert_eq!(" anthropic ".parse::<Provider>(), Ok(Provider::Anthropic));
        assert!("bedrock".parse::<Provider>().is_err());
    }

    #[test]
    fn serde_name_matches_namespace() {
        for provider in Provider::ALL {
            let json = serde_json::to_string(&provider).expect("serialize");
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn transport_fields_include_common_set() {
        let rules = Provider::Anthropic.rules();
        assert!(rules.is_transport_field("request_id"));
        assert!(rules.is_transport_field("metadata"));
        assert!(!rules.is_transport_field("temperature"));
    }
}
