//! Message-log wrapper that injects transient failures.

use async_trait::async_trait;
use entity_workflow::providers::in_memory::InMemoryMessageStorage;
use entity_workflow::providers::{
    EntityAddress, MessageStorage, PersistenceError, PrimaryKey, Reply, SaveResult, StoredRequest,
};
use entity_workflow::snowflake::RequestId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fails the next `n` primary-key lookups with a retryable error, then
/// delegates to the wrapped in-memory log.
pub struct FlakyStorage {
    inner: Arc<InMemoryMessageStorage>,
    lookup_failures: AtomicU32,
    injected: AtomicU32,
}

impl FlakyStorage {
    pub fn new(inner: Arc<InMemoryMessageStorage>) -> Self {
        Self {
            inner,
            lookup_failures: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    pub fn fail_next_lookups(&self, n: u32) {
        self.lookup_failures.store(n, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        let took = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        took
    }
}

#[async_trait]
impl MessageStorage for FlakyStorage {
    async fn save_request(&self, request: StoredRequest) -> Result<SaveResult, PersistenceError> {
        self.inner.save_request(request).await
    }

    async fn save_reply(&self, reply: Reply) -> Result<(), PersistenceError> {
        self.inner.save_reply(reply).await
    }

    async fn request_id_for_primary_key(&self, key: &PrimaryKey) -> Result<Option<RequestId>, PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::retryable("request_id_for_primary_key", "database is busy"));
        }
        self.inner.request_id_for_primary_key(key).await
    }

    async fn replies_for_unfiltered(&self, request_ids: &[RequestId]) -> Result<Vec<Reply>, PersistenceError> {
        self.inner.replies_for_unfiltered(request_ids).await
    }

    async fn is_unprocessed(&self, request_id: RequestId) -> Result<bool, PersistenceError> {
        self.inner.is_unprocessed(request_id).await
    }

    async fn reset_request(&self, request_id: RequestId) -> Result<(), PersistenceError> {
        self.inner.reset_request(request_id).await
    }

    async fn unprocessed_requests(&self, entity_types: &[String]) -> Result<Vec<StoredRequest>, PersistenceError> {
        self.inner.unprocessed_requests(entity_types).await
    }

    async fn clear_address(&self, address: &EntityAddress) -> Result<(), PersistenceError> {
        self.inner.clear_address(address).await
    }
}
