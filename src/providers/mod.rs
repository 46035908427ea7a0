//! Durable message log.
//!
//! The engine is a client of the log, never its implementer: it files requests
//! through the substrate and reads replies back by logical key. Any store that
//! implements [`MessageStorage`] can back the engine; [`in_memory`] ships one
//! for tests and single-process use.

use crate::Outcome;
use crate::snowflake::{RequestId, Snowflake};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod error;
pub mod in_memory;

pub use error::{FailureKind, PersistenceError};

/// Routing partition an entity lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub group: String,
    pub id: u32,
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

/// Routing key for one entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityAddress {
    pub entity_type: String,
    pub entity_id: String,
    pub shard_id: ShardId,
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.entity_type, self.entity_id, self.shard_id)
    }
}

/// Logical key a request is filed under: address + operation tag + idempotency id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey {
    pub address: EntityAddress,
    pub tag: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRequest {
    pub id: RequestId,
    pub address: EntityAddress,
    pub tag: String,
    /// Requests without a primary key are never deduplicated.
    pub primary_key: Option<String>,
    pub payload: Value,
    /// Delivery is held back until this instant.
    pub deliver_at: Option<DateTime<Utc>>,
}

impl StoredRequest {
    pub fn logical_key(&self) -> Option<PrimaryKey> {
        self.primary_key.as_ref().map(|id| PrimaryKey {
            address: self.address.clone(),
            tag: self.tag.clone(),
            id: id.clone(),
        })
    }
}

/// Append-only reply record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Snowflake,
    pub request_id: RequestId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveResult {
    Success,
    /// A request with the same primary key already exists; nothing was written.
    Duplicate {
        original: StoredRequest,
        last_reply: Option<Reply>,
    },
}

/// Storage contract for the durable request/reply log.
///
/// Implementations must be read-your-writes consistent for the writing
/// process: a reply is visible to `replies_for_unfiltered` as soon as
/// `save_reply` returns.
#[async_trait::async_trait]
pub trait MessageStorage: Send + Sync {
    /// Persist a request, deduplicating on `(address, tag, primary_key)`.
    async fn save_request(&self, request: StoredRequest) -> Result<SaveResult, PersistenceError>;

    /// Append a reply. Replies are never rewritten.
    async fn save_reply(&self, reply: Reply) -> Result<(), PersistenceError>;

    async fn request_id_for_primary_key(&self, key: &PrimaryKey) -> Result<Option<RequestId>, PersistenceError>;

    /// All replies for the given requests, in write order.
    async fn replies_for_unfiltered(&self, request_ids: &[RequestId]) -> Result<Vec<Reply>, PersistenceError>;

    /// True when the request exists and has no reply yet.
    async fn is_unprocessed(&self, request_id: RequestId) -> Result<bool, PersistenceError>;

    /// Drop every reply of a request so it becomes unprocessed again.
    async fn reset_request(&self, request_id: RequestId) -> Result<(), PersistenceError>;

    /// Requests without a reply for the given entity types, oldest first.
    async fn unprocessed_requests(&self, entity_types: &[String]) -> Result<Vec<StoredRequest>, PersistenceError>;

    /// Delete every request and reply filed under `address`.
    async fn clear_address(&self, address: &EntityAddress) -> Result<(), PersistenceError>;
}
