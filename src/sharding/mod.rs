//! Entity substrate contract.
//!
//! The engine never places entities itself. It describes entity types and their
//! operations, hands the substrate a handler per type, and sends requests to an
//! `(entity type, entity id)` pair. The substrate owns routing, persistence of
//! requests through the message log, and single delivery per request.

use crate::error::EngineError;
use crate::providers::{EntityAddress, ShardId};
use crate::snowflake::RequestId;
use crate::{DEFAULT_SHARD_GROUP, Outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub mod local;

pub use local::{LocalSharding, ShardingConfig};

/// Derives the idempotency id of a request from its payload.
pub type PrimaryKeyFn = fn(&Value) -> String;

/// Decides whether a reset requested while a request was being handled still
/// applies to the outcome the handler produced.
pub type ResetFilterFn = fn(&Outcome) -> bool;

type ShardGroupFn = dyn Fn(&str) -> String + Send + Sync;

/// One operation an entity type accepts.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub tag: &'static str,
    /// Filed in the message log before delivery.
    pub persisted: bool,
    /// The handler keeps running even if every caller stops waiting.
    pub uninterruptible: bool,
    pub primary_key: Option<PrimaryKeyFn>,
    /// Without a filter every in-flight reset re-delivers the request.
    pub reset_filter: Option<ResetFilterFn>,
}

impl OperationSpec {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            persisted: false,
            uninterruptible: false,
            primary_key: None,
            reset_filter: None,
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }

    pub fn uninterruptible(mut self) -> Self {
        self.uninterruptible = true;
        self
    }

    pub fn with_primary_key(mut self, key: PrimaryKeyFn) -> Self {
        self.primary_key = Some(key);
        self
    }

    /// Drop in-flight resets whose finished outcome fails `filter`.
    pub fn with_reset_filter(mut self, filter: ResetFilterFn) -> Self {
        self.reset_filter = Some(filter);
        self
    }

    /// True when an in-flight reset should re-deliver after `outcome`.
    pub fn reset_applies(&self, outcome: &Outcome) -> bool {
        self.reset_filter.is_none_or(|filter| filter(outcome))
    }
}

/// Describes an addressable entity type and the operations it accepts.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    operations: Vec<OperationSpec>,
    shard_group: Option<Arc<ShardGroupFn>>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            shard_group: None,
        }
    }

    pub fn with_operation(mut self, operation: OperationSpec) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_shard_group(mut self, select: Arc<ShardGroupFn>) -> Self {
        self.shard_group = Some(select);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self, tag: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.tag == tag)
    }

    pub fn shard_group_for(&self, entity_id: &str) -> String {
        match &self.shard_group {
            Some(select) => select(entity_id),
            None => DEFAULT_SHARD_GROUP.to_string(),
        }
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("operations", &self.operations)
            .finish()
    }
}

/// A request as seen by the entity handler.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub request_id: RequestId,
    pub address: EntityAddress,
    pub tag: String,
    pub payload: Value,
}

/// Handler bound to an entity type.
///
/// `Ok` outcomes are persisted as the reply. `Err` means the invocation died:
/// no reply is written and the request is delivered again later.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn handle(&self, request: IncomingRequest) -> Result<Outcome, EngineError>;
}

/// Function wrapper that implements `EntityHandler`.
pub struct FnEntityHandler<F, Fut>(pub F)
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Outcome, EngineError>> + Send + 'static;

#[async_trait]
impl<F, Fut> EntityHandler for FnEntityHandler<F, Fut>
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Outcome, EngineError>> + Send + 'static,
{
    async fn handle(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        (self.0)(request).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Return as soon as the request is accepted instead of awaiting its reply.
    pub discard: bool,
    pub deliver_at: Option<DateTime<Utc>>,
}

impl SendOptions {
    pub fn discard() -> Self {
        Self {
            discard: true,
            deliver_at: None,
        }
    }
}

#[async_trait]
pub trait Sharding: Send + Sync {
    fn get_shard_id(&self, entity_id: &str, group: &str) -> ShardId;

    async fn register_entity(&self, entity: EntityType, handler: Arc<dyn EntityHandler>) -> Result<(), EngineError>;

    /// Send `payload` to operation `tag` of `entity_id`.
    ///
    /// Returns `Ok(None)` when `options.discard` is set.
    async fn send(
        &self,
        entity: &EntityType,
        entity_id: &str,
        tag: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Option<Outcome>, EngineError>;

    /// Force a stored request to be delivered again. A request that is still
    /// being handled is delivered again after it finishes, provided its
    /// operation's reset filter accepts the outcome.
    async fn reset(&self, request_id: RequestId) -> Result<(), EngineError>;

    /// Deliver pending persisted requests.
    async fn poll_storage(&self) -> Result<(), EngineError>;

    async fn shutdown(&self) {}
}

/// Typed handle for sending to one entity type.
#[derive(Clone)]
pub struct EntityClient {
    sharding: Arc<dyn Sharding>,
    entity: Arc<EntityType>,
}

impl EntityClient {
    pub fn new(sharding: Arc<dyn Sharding>, entity: Arc<EntityType>) -> Self {
        Self { sharding, entity }
    }

    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    pub fn address(&self, entity_id: &str) -> EntityAddress {
        let group = self.entity.shard_group_for(entity_id);
        EntityAddress {
            entity_type: self.entity.name().to_string(),
            entity_id: entity_id.to_string(),
            shard_id: self.sharding.get_shard_id(entity_id, &group),
        }
    }

    pub async fn send(
        &self,
        entity_id: &str,
        tag: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Option<Outcome>, EngineError> {
        self.sharding.send(&self.entity, entity_id, tag, payload, options).await
    }

    /// Send and await the reply.
    pub async fn request(&self, entity_id: &str, tag: &str, payload: Value) -> Result<Outcome, EngineError> {
        self.send(entity_id, tag, payload, SendOptions::default())
            .await?
            .ok_or_else(|| EngineError::defect(format!("{} {tag} returned no reply", self.entity.name())))
    }
}
