//! In-memory store. Serves as the default backend and the unit-test double;
//! reads return snapshots so callers never observe in-place mutation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::capture::IncomingRequest;
use crate::stub::types::{Proto, Stub, TAG_RECORDED_STUB};

use super::{
    IncomingQueryOption, LastUpdatedRecord, ResetQueryOption, StatusStore, StoreError, StubStore,
    RESET_ALL,
};

#[derive(Default)]
struct Inner {
    stubs: Vec<Stub>,
    protos: Vec<Proto>,
    requests: Vec<IncomingRequest>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Thread-safe in-memory stub store.
#[derive(Default)]
pub struct StubMemoryStore {
    inner: RwLock<Inner>,
}

impl StubMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored stub, inactive ones included. Test suites
    /// use this to inspect recorder output.
    pub fn snapshot_stubs(&self) -> Vec<Stub> {
        self.inner.read().stubs.clone()
    }
}

#[async_trait]
impl StubStore for StubMemoryStore {
    async fn create(&self, mut stubs: Vec<Stub>) -> Result<Vec<Stub>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        for stub in &mut stubs {
            if stub.id == 0 {
                stub.id = inner.next_id();
            }

            stub.created_at.get_or_insert(now);
            stub.updated_at = Some(now);
            inner.stubs.push(stub.clone());
        }

        Ok(stubs)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for stub in &mut inner.stubs {
            if stub.id == id {
                stub.active = false;
                stub.updated_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<Stub>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .stubs
            .iter()
            .rev()
            .filter(|s| s.namespace == namespace && s.active)
            .cloned()
            .collect())
    }

    async fn create_proto(&self, mut protos: Vec<Proto>) -> Result<Vec<Proto>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        for proto in &mut protos {
            if proto.id == 0 {
                proto.id = inner.next_id();
            }

            proto.created_at.get_or_insert(now);
            proto.updated_at = Some(now);
            inner.protos.push(proto.clone());
        }

        Ok(protos)
    }

    async fn get_protos(&self) -> Result<Vec<Proto>, StoreError> {
        Ok(self.inner.read().protos.clone())
    }

    async fn create_incoming_request(
        &self,
        mut request: IncomingRequest,
    ) -> Result<IncomingRequest, StoreError> {
        let mut inner = self.inner.write();
        if request.id == 0 {
            request.id = inner.next_id();
        }

        inner.requests.push(request.clone());
        Ok(request)
    }

    async fn get_incoming_requests(
        &self,
        option: &IncomingQueryOption,
    ) -> Result<Vec<IncomingRequest>, StoreError> {
        let inner = self.inner.read();
        let mut results = Vec::new();

        for request in inner.requests.iter().rev() {
            if option.limit > 0 && results.len() >= option.limit {
                break;
            }

            if request.namespace != option.namespace {
                continue;
            }

            if !option.ids.is_empty() && !option.ids.contains(&request.id) {
                continue;
            }

            results.push(request.clone());
        }

        Ok(results)
    }

    async fn reset(&self, option: &ResetQueryOption) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if option.namespace == RESET_ALL {
            inner.stubs.clear();
            inner.requests.clear();
            inner.protos.clear();
            return Ok(());
        }

        let namespace = option.namespace.clone();
        let tag = option.tag.clone();
        let keep = |item_namespace: &str, item_tag: &str| {
            item_namespace != namespace || (!tag.is_empty() && item_tag != tag)
        };

        inner.stubs.retain(|s| keep(&s.namespace, &s.tag));
        inner.requests.retain(|r| keep(&r.namespace, &r.tag));
        Ok(())
    }
}

#[async_trait]
impl StatusStore for StubMemoryStore {
    async fn last_updated_stub(
        &self,
        namespace: &str,
    ) -> Result<Option<LastUpdatedRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .stubs
            .iter()
            .filter(|s| s.namespace == namespace && s.tag != TAG_RECORDED_STUB)
            .max_by_key(|s| (s.updated_at, s.id))
            .and_then(|s| {
                s.updated_at.map(|updated_at| LastUpdatedRecord {
                    id: s.id,
                    updated_at,
                })
            }))
    }

    async fn last_updated_proto(&self) -> Result<Option<LastUpdatedRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .protos
            .iter()
            .max_by_key(|p| (p.updated_at, p.id))
            .and_then(|p| {
                p.updated_at.map(|updated_at| LastUpdatedRecord {
                    id: p.id,
                    updated_at,
                })
            }))
    }
}
