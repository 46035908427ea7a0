use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, debug_span, info, warn};

use super::{EntityHandler, EntityType, IncomingRequest, SendOptions, Sharding};
use crate::Outcome;
use crate::error::EngineError;
use crate::providers::{EntityAddress, MessageStorage, Reply, SaveResult, ShardId, StoredRequest};
use crate::snowflake::{RequestId, SnowflakeGenerator};

/// Configuration for [`LocalSharding`].
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Shards per shard group; shard ids run from 1 to this value.
    pub shards_per_group: u32,
    /// How often the background poller re-scans storage for pending requests.
    pub storage_poll_interval: Duration,
    /// Machine id embedded in minted request ids.
    pub machine_id: u16,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shards_per_group: 300,
            storage_poll_interval: Duration::from_secs(1),
            machine_id: 0,
        }
    }
}

type Delivery = Option<Result<Outcome, EngineError>>;

struct InFlight {
    tx: watch::Sender<Delivery>,
    reset_requested: bool,
    abort: AbortHandle,
}

#[derive(Clone)]
struct Hosted {
    entity: EntityType,
    handler: Arc<dyn EntityHandler>,
}

enum Completion {
    Done,
    Redeliver,
}

/// Single-process entity substrate.
///
/// Every entity is owned by this process. Persisted requests are filed in the
/// message log before delivery, a given request id is never handled twice
/// concurrently, and handlers run on their own tasks so a caller that stops
/// waiting cannot tear down uninterruptible work.
pub struct LocalSharding {
    storage: Arc<dyn MessageStorage>,
    config: ShardingConfig,
    ids: SnowflakeGenerator,
    hosted: RwLock<HashMap<String, Hosted>>,
    in_flight: Mutex<HashMap<RequestId, InFlight>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    this: Weak<LocalSharding>,
}

impl LocalSharding {
    /// Create a substrate without the background storage poller.
    pub fn new(storage: Arc<dyn MessageStorage>, config: ShardingConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            storage,
            ids: SnowflakeGenerator::new(config.machine_id),
            config,
            hosted: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Create a substrate and start polling storage for pending requests.
    pub fn start(storage: Arc<dyn MessageStorage>, config: ShardingConfig) -> Arc<Self> {
        let sharding = Self::new(storage, config);
        sharding.spawn_storage_poller();
        sharding
    }

    pub fn storage(&self) -> &Arc<dyn MessageStorage> {
        &self.storage
    }

    /// Number of requests currently being handled (or held for delayed delivery).
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<RequestId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hosted(&self, entity_type: &str) -> Option<Hosted> {
        self.hosted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type)
            .cloned()
    }

    fn spawn_storage_poller(&self) {
        let this = self.this.clone();
        let interval = self.config.storage_poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(sharding) = this.upgrade() else { break };
                if let Err(e) = sharding.poll_storage().await {
                    warn!(error = %e, "storage poll failed");
                }
            }
        });
        self.joins.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    /// Start handling `request` unless it is already in flight; either way,
    /// return a receiver for its eventual delivery.
    fn dispatch(&self, request: StoredRequest, persisted: bool) -> watch::Receiver<Delivery> {
        let mut in_flight = self.lock_in_flight();
        if let Some(existing) = in_flight.get(&request.id) {
            return existing.tx.subscribe();
        }
        let (tx, rx) = watch::channel(None);
        let id = request.id;
        let this = self.this.clone();
        let task = tokio::spawn(async move {
            if let Some(sharding) = this.upgrade() {
                sharding.run_request(request, persisted).await;
            }
        });
        in_flight.insert(
            id,
            InFlight {
                tx,
                reset_requested: false,
                abort: task.abort_handle(),
            },
        );
        rx
    }

    async fn run_request(&self, request: StoredRequest, persisted: bool) {
        let id = request.id;
        if let Some(at) = request.deliver_at {
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                debug!(request_id = %id, wait_ms = wait.as_millis() as u64, "holding delayed request");
                tokio::time::sleep(wait).await;
            }
        }

        loop {
            if persisted {
                match self.answered(id).await {
                    Ok(Some(delivery)) => {
                        self.finish(id, delivery);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.finish(id, Err(e));
                        return;
                    }
                }
            }

            let result = match self.invoke(&request).await {
                Ok(outcome) if persisted => self.save_reply(id, &outcome).await.map(|()| outcome),
                other => other,
            };
            let reset_applies = match &result {
                Ok(outcome) => persisted && self.reset_applies(&request, outcome),
                Err(e) => {
                    warn!(request_id = %id, tag = %request.tag, error = %e, "request did not complete; leaving it pending");
                    false
                }
            };

            match self.complete(id, result, reset_applies) {
                Completion::Done => return,
                Completion::Redeliver => {
                    debug!(request_id = %id, "request reset while in flight; delivering again");
                    if let Err(e) = self.storage.reset_request(id).await {
                        self.finish(id, Err(e.into()));
                        return;
                    }
                }
            }
        }
    }

    /// `Some` when the request no longer needs handling: it already has a
    /// reply, or it was cleared from storage.
    async fn answered(&self, id: RequestId) -> Result<Option<Result<Outcome, EngineError>>, EngineError> {
        if self.storage.is_unprocessed(id).await? {
            return Ok(None);
        }
        let replies = self.storage.replies_for_unfiltered(&[id]).await?;
        Ok(Some(match replies.into_iter().last() {
            Some(reply) => Ok(reply.outcome),
            None => Err(EngineError::defect(format!("request {id} was cleared before delivery"))),
        }))
    }

    async fn invoke(&self, request: &StoredRequest) -> Result<Outcome, EngineError> {
        let hosted = self
            .hosted(&request.address.entity_type)
            .ok_or_else(|| EngineError::EntityNotRegistered {
                entity_type: request.address.entity_type.clone(),
            })?;
        let span = debug_span!(
            "entity_request",
            request_id = %request.id,
            entity_type = %request.address.entity_type,
            entity_id = %request.address.entity_id,
            tag = %request.tag,
        );
        let incoming = IncomingRequest {
            request_id: request.id,
            address: request.address.clone(),
            tag: request.tag.clone(),
            payload: request.payload.clone(),
        };
        // A panicking handler counts as a failed invocation; the request stays pending.
        AssertUnwindSafe(hosted.handler.handle(incoming).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(EngineError::defect(format!("handler panicked: {}", panic_message(&*panic)))))
            .map_err(|e| match e {
                EngineError::HandlerFailed { .. } => e,
                other => EngineError::HandlerFailed {
                    request_id: request.id,
                    message: other.to_string(),
                },
            })
    }

    fn reset_applies(&self, request: &StoredRequest, outcome: &Outcome) -> bool {
        self.hosted(&request.address.entity_type)
            .and_then(|hosted| hosted.entity.operation(&request.tag).map(|op| op.reset_applies(outcome)))
            .unwrap_or(true)
    }

    async fn save_reply(&self, request_id: RequestId, outcome: &Outcome) -> Result<(), EngineError> {
        self.storage
            .save_reply(Reply {
                id: self.ids.next_id(),
                request_id,
                outcome: outcome.clone(),
            })
            .await
            .map_err(EngineError::from)
    }

    fn complete(&self, id: RequestId, result: Result<Outcome, EngineError>, reset_applies: bool) -> Completion {
        let mut in_flight = self.lock_in_flight();
        if let Some(entry) = in_flight.get_mut(&id)
            && entry.reset_requested
        {
            entry.reset_requested = false;
            if reset_applies {
                return Completion::Redeliver;
            }
            debug!(request_id = %id, "outcome does not take the pending reset; dropping it");
        }
        if let Some(entry) = in_flight.remove(&id) {
            entry.tx.send_replace(Some(result));
        }
        Completion::Done
    }

    fn finish(&self, id: RequestId, result: Result<Outcome, EngineError>) {
        if let Some(entry) = self.lock_in_flight().remove(&id) {
            entry.tx.send_replace(Some(result));
        }
    }

    /// Abort an interruptible request nobody is waiting for any more.
    fn interrupt_if_unobserved(&self, id: RequestId) {
        let mut in_flight = self.lock_in_flight();
        if let Some(entry) = in_flight.get(&id)
            && entry.tx.receiver_count() == 0
            && let Some(entry) = in_flight.remove(&id)
        {
            entry.abort.abort();
            debug!(request_id = %id, "caller stopped waiting; interrupted request");
        }
    }
}

/// Awaits one delivery; interrupts the request if dropped early and the
/// operation is interruptible.
struct PendingReply<'a> {
    sharding: &'a LocalSharding,
    id: RequestId,
    rx: Option<watch::Receiver<Delivery>>,
    interruptible: bool,
}

impl PendingReply<'_> {
    async fn wait(&mut self) -> Result<Outcome, EngineError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(EngineError::Shutdown);
        };
        let delivery = rx
            .wait_for(Option::is_some)
            .await
            .map(|d| d.clone())
            .map_err(|_| EngineError::Shutdown)?;
        self.rx = None;
        delivery.unwrap_or(Err(EngineError::Shutdown))
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            drop(rx);
            if self.interruptible {
                self.sharding.interrupt_if_unobserved(self.id);
            }
        }
    }
}

#[async_trait]
impl Sharding for LocalSharding {
    fn get_shard_id(&self, entity_id: &str, group: &str) -> ShardId {
        let shards = u64::from(self.config.shards_per_group.max(1));
        ShardId {
            group: group.to_string(),
            id: (fnv1a(entity_id.as_bytes()) % shards) as u32 + 1,
        }
    }

    async fn register_entity(&self, entity: EntityType, handler: Arc<dyn EntityHandler>) -> Result<(), EngineError> {
        {
            let mut hosted = self.hosted.write().unwrap_or_else(PoisonError::into_inner);
            if hosted.contains_key(entity.name()) {
                return Err(EngineError::defect(format!(
                    "entity type {} is already registered",
                    entity.name()
                )));
            }
            hosted.insert(
                entity.name().to_string(),
                Hosted {
                    entity: entity.clone(),
                    handler,
                },
            );
        }
        info!(entity_type = %entity.name(), "registered entity type");
        // Requests may have been filed before this process could host the type.
        if let Err(e) = self.poll_storage().await {
            warn!(entity_type = %entity.name(), error = %e, "initial storage poll failed");
        }
        Ok(())
    }

    async fn send(
        &self,
        entity: &EntityType,
        entity_id: &str,
        tag: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<Option<Outcome>, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let op = entity
            .operation(tag)
            .ok_or_else(|| EngineError::defect(format!("{} has no operation {tag}", entity.name())))?;
        let group = entity.shard_group_for(entity_id);
        let request = StoredRequest {
            id: self.ids.next_id(),
            address: EntityAddress {
                entity_type: entity.name().to_string(),
                entity_id: entity_id.to_string(),
                shard_id: self.get_shard_id(entity_id, &group),
            },
            tag: tag.to_string(),
            primary_key: op.primary_key.map(|key| key(&payload)),
            payload,
            deliver_at: options.deliver_at,
        };

        let (id, rx) = if op.persisted {
            match self.storage.save_request(request.clone()).await? {
                SaveResult::Success => (request.id, self.dispatch(request, true)),
                SaveResult::Duplicate {
                    original,
                    last_reply: Some(reply),
                } => {
                    debug!(request_id = %original.id, tag, "duplicate request already answered");
                    return Ok((!options.discard).then_some(reply.outcome));
                }
                SaveResult::Duplicate {
                    original,
                    last_reply: None,
                } => {
                    debug!(request_id = %original.id, tag, "duplicate request still pending");
                    (original.id, self.dispatch(original, true))
                }
            }
        } else {
            (request.id, self.dispatch(request, false))
        };

        if options.discard {
            return Ok(None);
        }
        let mut pending = PendingReply {
            sharding: self,
            id,
            rx: Some(rx),
            interruptible: !op.uninterruptible,
        };
        pending.wait().await.map(Some)
    }

    async fn reset(&self, request_id: RequestId) -> Result<(), EngineError> {
        {
            let mut in_flight = self.lock_in_flight();
            if let Some(entry) = in_flight.get_mut(&request_id) {
                entry.reset_requested = true;
                debug!(request_id = %request_id, "reset requested while in flight");
                return Ok(());
            }
        }
        self.storage.reset_request(request_id).await?;
        Ok(())
    }

    async fn poll_storage(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let entity_types: Vec<String> = self
            .hosted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        if entity_types.is_empty() {
            return Ok(());
        }
        let pending = self.storage.unprocessed_requests(&entity_types).await?;
        if !pending.is_empty() {
            debug!(count = pending.len(), "delivering pending requests from storage");
        }
        for request in pending {
            let _ = self.dispatch(request, true);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for join in self.joins.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            join.abort();
        }
        let drained: Vec<InFlight> = self.lock_in_flight().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.abort.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Stable across processes and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
