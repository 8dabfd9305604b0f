//! Per-signature coalescing of upstream calls.
//!
//! The first caller for a key starts the work as a detached task; callers that
//! arrive while it is running await the same result. A waiter that is
//! cancelled only drops its handle, so the call and its cassette write still
//! complete for everyone else.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;

use crate::error::VcrError;
use crate::fingerprint::Signature;
use crate::provider::Provider;
use crate::upstream::UpstreamResponse;

/// Result delivered to every caller of a coalesced call.
pub type CallResult = Result<UpstreamResponse, VcrError>;

type SharedCall = Shared<BoxFuture<'static, CallResult>>;
type Registry = Arc<Mutex<HashMap<CallKey, Entry>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey {
    provider: Provider,
    signature: Signature,
}

struct Entry {
    id: u64,
    call: SharedCall,
}

/// Registry of calls currently in flight, keyed by (provider, signature).
#[derive(Default)]
pub struct InflightCalls {
    calls: Registry,
    next_id: AtomicU64,
}

impl InflightCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the in-flight call for `(provider, signature)`, starting `work`
    /// if there is none.
    ///
    /// Returns the shared result and whether this caller started the work.
    /// `work` is dropped unpolled when the caller joins an existing call.
    pub async fn run<F>(
        &self,
        provider: Provider,
        signature: &Signature,
        work: F,
    ) -> (CallResult, bool)
    where
        F: Future<Output = CallResult> + Send + 'static,
    {
        let (call, started) = self.join_or_start(provider, signature, work);
        (call.await, started)
    }

    /// Number of distinct calls in flight.
    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn join_or_start<F>(
        &self,
        provider: Provider,
        signature: &Signature,
        work: F,
    ) -> (SharedCall, bool)
    where
        F: Future<Output = CallResult> + Send + 'static,
    {
        let key = CallKey {
            provider,
            signature: signature.clone(),
        };
        let mut calls = lock(&self.calls);
        if let Some(entry) = calls.get(&key) {
            tracing::debug!(provider = %provider, signature = %signature, "joining in-flight call");
            return (entry.call.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            registry: Arc::clone(&self.calls),
            key: key.clone(),
            id,
        };
        // Registered before the task can finish: it needs this lock to deregister.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        let call = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(VcrError::internal(format!("in-flight call failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        calls.insert(
            key,
            Entry {
                id,
                call: call.clone(),
            },
        );
        (call, true)
    }
}

/// Removes a finished call from the registry, including when it panics.
struct Deregister {
    registry: Registry,
    key: CallKey,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut calls = lock(&self.registry);
        if calls.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            calls.remove(&self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
