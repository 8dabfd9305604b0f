//! Filesystem cassette store.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   openai/<signature>.json
//!   anthropic/<signature>.json
//!   gemini/<signature>.json
//!   ollama/<signature>.json
//! ```
//!
//! Writes go to a dot-prefixed temp file in the provider directory, are
//! fsynced, then renamed over the target. Readers see either the old
//! cassette or the new one. Scans ignore dot-prefixed names.
//!
//! All methods are blocking; async callers run them on the blocking pool.

use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use serde_json::Value;

use crate::canonical::canonical_bytes;
use crate::cassette::Cassette;
use crate::cassette::CassetteBody;
use crate::cassette::SEAL_FIELD;
use crate::error::Result;
use crate::error::VcrError;
use crate::fingerprint::Signature;
use crate::provider::Provider;
use crate::seal::Sealer;

/// File extension for cassettes.
pub const CASSETTE_EXTENSION: &str = "json";

/// Placeholder used as the expected seal when a cassette carries none.
pub const MISSING_SEAL: &str = "<missing>";

/// Placeholder used as the expected seal when a cassette cannot be parsed.
pub const UNREADABLE_SEAL: &str = "<unreadable>";

/// Outcome of a store lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    Hit(Box<Cassette>),
    Miss,
    Corrupt(Corruption),
}

/// Why a stored cassette was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    /// Seal embedded in the file, or a placeholder.
    pub expected: String,
    /// Seal computed over the file's contents.
    pub actual: String,
    pub detail: String,
}

/// A cassette file found by a directory scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredCassette {
    pub provider: Provider,
    pub signature: Signature,
    pub path: PathBuf,
}

/// Per-file result of [`CassetteStore::verify_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyEntry {
    pub cassette: StoredCassette,
    pub corruption: Option<Corruption>,
}

/// Counts from a retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub retained: usize,
    /// Corrupt or unreadable cassettes left for an operator.
    pub skipped: usize,
}

/// Sealed cassette files keyed by (provider, signature).
#[derive(Debug, Clone)]
pub struct CassetteStore {
    root: PathBuf,
    sealer: Sealer,
}

impl CassetteStore {
    /// Open a store rooted at `root`. Directories are created on first write.
    pub fn open(root: impl Into<PathBuf>, sealer: Sealer) -> Self {
        Self {
            root: root.into(),
            sealer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sealer(&self) -> &Sealer {
        &self.sealer
    }

    /// Path a cassette for `(provider, signature)` lives at.
    pub fn cassette_path(&self, provider: Provider, signature: &Signature) -> PathBuf {
        self.provider_dir(provider)
            .join(format!("{signature}.{CASSETTE_EXTENSION}"))
    }

    fn provider_dir(&self, provider: Provider) -> PathBuf {
        self.root.join(provider.as_str())
    }

    /// Look up and verify a cassette.
    ///
    /// A missing file is a `Miss`. A file whose seal does not match, that
    /// cannot be parsed, or whose recorded key disagrees with its location is
    /// `Corrupt`. Any other I/O failure is an error.
    pub fn lookup(&self, provider: Provider, signature: &Signature) -> Result<LookupResult> {
        let path = self.cassette_path(provider, signature);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(self.classify(provider, signature, &bytes)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                Ok(LookupResult::Miss)
            }
            Err(e) => Err(VcrError::storage(provider, Some(signature), path, e)),
        }
    }

    /// Seal `body` and write it atomically, replacing any existing cassette
    /// for the same key.
    pub fn write(&self, body: CassetteBody) -> Result<Cassette> {
        let provider = body.provider;
        let signature = body.fingerprint.clone();
        let dir = self.provider_dir(provider);
        let target = self.cassette_path(provider, &signature);

        let value = serde_json::to_value(&body)
            .map_err(|e| VcrError::internal(format!("serialize cassette: {e}")))?;
        let integrity_seal = self.sealer.seal(&canonical_bytes(&value)?);
        let cassette = Cassette {
            body,
            integrity_seal,
        };
        let json = serde_json::to_vec_pretty(&cassette)
            .map_err(|e| VcrError::internal(format!("serialize cassette: {e}")))?;

        let storage_err = |path: &Path, e: std::io::Error| {
            VcrError::storage(provider, Some(&signature), path, e)
        };

        std::fs::create_dir_all(&dir).map_err(|e| storage_err(&dir, e))?;

        // Unique temp name so concurrent writers never share a file.
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| storage_err(&dir, e))?;
        tmp.write_all(&json).map_err(|e| storage_err(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| storage_err(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| storage_err(&target, e.error))?;

        tracing::debug!(
            provider = %provider,
            signature = %signature,
            path = %target.display(),
            "cassette written"
        );
        Ok(cassette)
    }

    /// Delete one cassette. Returns whether a file was removed.
    pub fn remove(&self, provider: Provider, signature: &Signature) -> Result<bool> {
        let path = self.cassette_path(provider, signature);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VcrError::storage(provider, Some(signature), path, e)),
        }
    }

    /// Every cassette file currently in the store, ordered by provider then
    /// signature. Files whose names are not signatures are ignored.
    pub fn list(&self) -> Result<Vec<StoredCassette>> {
        let mut found = Vec::new();
        for provider in Provider::ALL {
            let dir = self.provider_dir(provider);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                    continue;
                }
                Err(e) => return Err(VcrError::storage(provider, None, dir, e)),
            };
            let mut in_dir = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| VcrError::storage(provider, None, &dir, e))?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let Some(stem) = name.strip_suffix(&format!(".{CASSETTE_EXTENSION}")) else {
                    continue;
                };
                match Signature::parse(stem) {
                    Ok(signature) => in_dir.push(StoredCassette {
                        provider,
                        signature,
                        path,
                    }),
                    Err(_) => {
                        tracing::debug!(path = %path.display(), "ignoring non-cassette file");
                    }
                }
            }
            in_dir.sort();
            found.extend(in_dir);
        }
        Ok(found)
    }

    /// Delete sealed cassettes recorded before `now - max_age`.
    ///
    /// Corrupt cassettes are never deleted; they are counted as skipped and
    /// left for an operator. A file that disappears mid-pass is ignored.
    /// An age reaching past the earliest representable time expires nothing.
    pub fn delete_older_than(
        &self,
        max_age: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let cutoff = now.checked_sub_signed(max_age);
        let mut report = SweepReport::default();

        for stored in self.list()? {
            let StoredCassette {
                provider,
                signature,
                path,
            } = &stored;
            match self.lookup(*provider, signature) {
                Ok(LookupResult::Hit(cassette))
                    if cutoff.is_some_and(|cutoff| cassette.body.recorded_at < cutoff) =>
                {
                    match std::fs::remove_file(path) {
                        Ok(()) => {
                            report.deleted += 1;
                            tracing::debug!(
                                provider = %provider,
                                signature = %signature,
                                recorded_at = %cassette.body.recorded_at,
                                "expired cassette deleted"
                            );
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            report.skipped += 1;
                            tracing::warn!(
                                provider = %provider,
                                signature = %signature,
                                error = %e,
                                "failed to delete expired cassette"
                            );
                        }
                    }
                }
                Ok(LookupResult::Hit(_)) => report.retained += 1,
                Ok(LookupResult::Miss) => {}
                Ok(LookupResult::Corrupt(corruption)) => {
                    report.skipped += 1;
                    tracing::warn!(
                        provider = %provider,
                        signature = %signature,
                        detail = %corruption.detail,
                        "corrupt cassette left in place by retention sweep"
                    );
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(
                        provider = %provider,
                        signature = %signature,
                        error = %e,
                        "unreadable cassette left in place by retention sweep"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Check the seal of every cassette in the store.
    pub fn verify_all(&self) -> Result<Vec<VerifyEntry>> {
        let mut entries = Vec::new();
        for cassette in self.list()? {
            let corruption = match self.lookup(cassette.provider, &cassette.signature)? {
                LookupResult::Corrupt(corruption) => Some(corruption),
                LookupResult::Hit(_) | LookupResult::Miss => None,
            };
            entries.push(VerifyEntry {
                cassette,
                corruption,
            });
        }
        Ok(entries)
    }

    fn classify(&self, provider: Provider, signature: &Signature, bytes: &[u8]) -> LookupResult {
        let mut fields = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return self.unreadable(bytes, "cassette is not a JSON object".to_string()),
            Err(e) => return self.unreadable(bytes, format!("cassette is not valid JSON: {e}")),
        };

        let expected = match fields.remove(SEAL_FIELD) {
            Some(Value::String(seal)) => seal,
            _ => MISSING_SEAL.to_string(),
        };
        let remainder = Value::Object(fields);
        let canonical = match canonical_bytes(&remainder) {
            Ok(canonical) => canonical,
            Err(e) => return self.unreadable(bytes, e.to_string()),
        };

        if let Err(actual) = self.sealer.verify(&canonical, &expected) {
            let detail = if expected == MISSING_SEAL {
                "cassette has no integrity seal"
            } else {
                "seal does not match contents"
            };
            return LookupResult::Corrupt(Corruption {
                expected,
                actual,
                detail: detail.to_string(),
            });
        }

        let body: CassetteBody = match serde_json::from_value(remainder) {
            Ok(body) => body,
            Err(e) => {
                return LookupResult::Corrupt(Corruption {
                    actual: expected.clone(),
                    expected,
                    detail: format!("sealed cassette has an unexpected shape: {e}"),
                });
            }
        };

        if body.provider != provider || body.fingerprint != *signature {
            return LookupResult::Corrupt(Corruption {
                actual: expected.clone(),
                expected,
                detail: format!(
                    "cassette records {}/{} but is stored as {provider}/{signature}",
                    body.provider, body.fingerprint
                ),
            });
        }

        LookupResult::Hit(Box::new(Cassette {
            body,
            integrity_seal: expected,
        }))
    }

    fn unreadable(&self, bytes: &[u8], detail: String) -> LookupResult {
        LookupResult::Corrupt(Corruption {
            expected: UNREADABLE_SEAL.to_string(),
            actual: self.sealer.seal(bytes),
            detail,
        })
    }
}
