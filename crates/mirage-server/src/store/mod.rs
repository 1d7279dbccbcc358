//! Repository contracts for stubs, protos and incoming requests.

pub mod cache;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::IncomingRequest;
use crate::stub::types::{Proto, Stub};

pub use cache::{CacheStrategy, StubCache};
pub use memory::StubMemoryStore;

/// Namespace value that wipes every namespace on reset.
pub const RESET_ALL: &str = "reset_all";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Internal(String),
}

/// Query option for listing captured requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingQueryOption {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub limit: usize,
}

/// Query option for resetting stubs and captures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetQueryOption {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tag: String,
}

/// Id and modification time of the most recently written record; the cache
/// freshness probe compares against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastUpdatedRecord {
    pub id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Store for stubs, protos and incoming requests. Implementations own the
/// persisted entities; callers receive snapshots.
#[async_trait]
pub trait StubStore: Send + Sync {
    /// Persists stubs, assigning ids and timestamps, and returns the stored
    /// copies.
    async fn create(&self, stubs: Vec<Stub>) -> Result<Vec<Stub>, StoreError>;

    /// Soft delete: flips `active` off and bumps `updated_at` so the cache
    /// freshness probe notices.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;

    /// All active stubs in a namespace, most recent first.
    async fn get_all(&self, namespace: &str) -> Result<Vec<Stub>, StoreError>;

    async fn create_proto(&self, protos: Vec<Proto>) -> Result<Vec<Proto>, StoreError>;
    async fn get_protos(&self) -> Result<Vec<Proto>, StoreError>;

    async fn create_incoming_request(
        &self,
        request: IncomingRequest,
    ) -> Result<IncomingRequest, StoreError>;

    async fn get_incoming_requests(
        &self,
        option: &IncomingQueryOption,
    ) -> Result<Vec<IncomingRequest>, StoreError>;

    /// Removes stubs and incoming requests for the namespace (and tag when
    /// set). Namespace [`RESET_ALL`] wipes everything.
    async fn reset(&self, option: &ResetQueryOption) -> Result<(), StoreError>;
}

/// Cheap probe for the latest update, backing the default cache strategy.
/// Recorded stubs are excluded so a recording burst does not continuously
/// invalidate the cache.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn last_updated_stub(
        &self,
        namespace: &str,
    ) -> Result<Option<LastUpdatedRecord>, StoreError>;

    async fn last_updated_proto(&self) -> Result<Option<LastUpdatedRecord>, StoreError>;
}
