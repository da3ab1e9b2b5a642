//! Typed context registry over the TTL store.
//!
//! A registry holds one context *type* (e.g. `controller-params`) and keys
//! entries as `"<type>:<id>"`. Writes are merge-on-write: the first `set` for
//! an id stamps `created_at` and defaults `client_id` to the id; later writes
//! replace the value but preserve `created_at` and refresh `updated_at`.
//!
//! The optimization orchestrator only requires the `controller-params`
//! flavor, which carries a [`RequestContext`].

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notify::CallbackSink;
use crate::transform::OptimizeOptions;

use super::ttl::TtlStore;

/// Context type used for per-request optimization parameters.
pub const CONTROLLER_PARAMS: &str = "controller-params";

// =============================================================================
// Request Context
// =============================================================================

/// Handle to an uploaded file parked on local disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUpload {
    /// Absolute path of the temp file holding the upload
    pub path: PathBuf,

    /// Original filename as sent by the client
    pub original_name: String,

    /// Size of the upload in bytes
    pub size: u64,
}

/// Everything needed to finish an optimization after the HTTP response has
/// been sent.
///
/// Invariants: `new_file_path` (or `new_file_paths`) and `options` are
/// written once, before the response, and never mutated for a given id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Single-file upload (set for the single-image path)
    pub file: Option<StoredUpload>,

    /// Batch uploads, in client order (set for the batch path)
    #[serde(default)]
    pub files: Vec<StoredUpload>,

    /// Accepted optimization options
    pub options: OptimizeOptions,

    /// Webhook sinks to notify on completion
    #[serde(default)]
    pub callbacks: Vec<CallbackSink>,

    /// Minted destination key for the single-file path
    pub new_file_path: Option<String>,

    /// Minted destination keys for the batch path, in client order
    #[serde(default)]
    pub new_file_paths: Vec<String>,
}

impl RequestContext {
    /// All temp files referenced by this context.
    pub fn upload_paths(&self) -> Vec<PathBuf> {
        self.file
            .iter()
            .map(|f| f.path.clone())
            .chain(self.files.iter().map(|f| f.path.clone()))
            .collect()
    }
}

// =============================================================================
// Stored record
// =============================================================================

/// A context value together with its registry bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stored<T> {
    /// The typed context value
    pub value: T,

    /// Client identifier; defaults to the context id on first write
    pub client_id: String,

    /// First write timestamp, preserved across merges
    pub created_at: DateTime<Utc>,

    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Context Registry
// =============================================================================

/// Typed facade over a [`TtlStore`] for one context type.
pub struct ContextRegistry<T: Clone> {
    context_type: &'static str,
    store: TtlStore<Stored<T>>,
}

impl<T: Clone> ContextRegistry<T> {
    /// Create a registry for the given context type with a default TTL.
    pub fn new(context_type: &'static str, default_ttl: Duration) -> Self {
        Self {
            context_type,
            store: TtlStore::with_default_ttl(default_ttl),
        }
    }

    /// The context type this registry serves.
    pub fn context_type(&self) -> &'static str {
        self.context_type
    }

    /// Default TTL applied to stored contexts.
    pub fn default_ttl(&self) -> Duration {
        self.store.default_ttl()
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.context_type, id)
    }

    /// Store a context under the registry default TTL.
    ///
    /// Merge-on-write: an existing record keeps its `created_at` and
    /// `client_id`; `updated_at` is refreshed.
    pub async fn set(&self, id: &str, value: T) {
        self.set_with_ttl(id, value, self.store.default_ttl()).await;
    }

    /// Store a context with an explicit TTL.
    pub async fn set_with_ttl(&self, id: &str, value: T, ttl: Duration) {
        let key = self.key(id);
        let now = Utc::now();
        let stored = match self.store.get(&key).await {
            Some(prior) => Stored {
                value,
                client_id: prior.client_id,
                created_at: prior.created_at,
                updated_at: now,
            },
            None => Stored {
                value,
                client_id: id.to_string(),
                created_at: now,
                updated_at: now,
            },
        };
        self.store.set_with_ttl(key, stored, ttl).await;
    }

    /// Fetch a live context.
    pub async fn get(&self, id: &str) -> Option<Stored<T>> {
        self.store.get(&self.key(id)).await
    }

    /// Check for a live context.
    pub async fn has(&self, id: &str) -> bool {
        self.store.has(&self.key(id)).await
    }

    /// Delete a context. Returns `true` if a live entry was removed.
    pub async fn delete(&self, id: &str) -> bool {
        self.store.delete(&self.key(id)).await
    }

    /// Reset the TTL of a live context.
    pub async fn update_ttl(&self, id: &str, ttl: Duration) -> bool {
        self.store.update_ttl(&self.key(id), ttl).await
    }

    /// Ids of all live contexts of this type.
    pub async fn ids(&self) -> Vec<String> {
        let prefix = format!("{}:", self.context_type);
        self.store
            .keys()
            .await
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect()
    }

    /// Number of live contexts of this type.
    pub async fn count(&self) -> usize {
        self.store.len().await
    }

    /// Eagerly purge expired contexts, reporting how many were removed.
    pub async fn sweep(&self) -> usize {
        self.store.sweep().await
    }

    /// Eagerly purge expired contexts, returning `(id, record)` pairs so the
    /// caller can release per-context resources.
    pub async fn sweep_expired(&self) -> Vec<(String, Stored<T>)> {
        let prefix = format!("{}:", self.context_type);
        self.store
            .sweep_collect()
            .await
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|id| (id.to_string(), v)))
            .collect()
    }

    /// Remove every context, expired or not.
    pub async fn clear(&self) {
        self.store.clear().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
