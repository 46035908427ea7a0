use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{EntityAddress, MessageStorage, PersistenceError, PrimaryKey, Reply, SaveResult, StoredRequest};
use crate::snowflake::RequestId;

#[derive(Default)]
struct State {
    // Ordered by id, which is time-ordered.
    requests: BTreeMap<RequestId, StoredRequest>,
    by_primary_key: HashMap<PrimaryKey, RequestId>,
    replies: HashMap<RequestId, Vec<Reply>>,
}

impl State {
    fn remove_request(&mut self, id: RequestId) {
        if let Some(request) = self.requests.remove(&id)
            && let Some(key) = request.logical_key()
        {
            self.by_primary_key.remove(&key);
        }
        self.replies.remove(&id);
    }
}

/// In-memory message log for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMessageStorage {
    inner: Mutex<State>,
}

impl InMemoryMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request filed under `address`, oldest first (test utility).
    pub async fn requests_for(&self, address: &EntityAddress) -> Vec<StoredRequest> {
        let g = self.inner.lock().await;
        g.requests.values().filter(|r| &r.address == address).cloned().collect()
    }

    /// Every request with the given operation tag for an entity type (test utility).
    pub async fn requests_with_tag(&self, entity_type: &str, tag: &str) -> Vec<StoredRequest> {
        let g = self.inner.lock().await;
        g.requests
            .values()
            .filter(|r| r.address.entity_type == entity_type && r.tag == tag)
            .cloned()
            .collect()
    }

    /// Return a pretty-printed dump of the whole log (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut out = String::new();
        for (id, request) in g.requests.iter() {
            out.push_str(&format!(
                "request={id} address={} tag={} key={:?}\n",
                request.address, request.tag, request.primary_key
            ));
            for reply in g.replies.get(id).into_iter().flatten() {
                out.push_str(&format!("  {:#?}\n", reply.outcome));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl MessageStorage for InMemoryMessageStorage {
    async fn save_request(&self, request: StoredRequest) -> Result<SaveResult, PersistenceError> {
        let mut g = self.inner.lock().await;
        if let Some(key) = request.logical_key() {
            if let Some(original_id) = g.by_primary_key.get(&key).copied() {
                let original = g
                    .requests
                    .get(&original_id)
                    .cloned()
                    .ok_or_else(|| PersistenceError::permanent("save_request", format!("dangling key for {original_id}")))?;
                let last_reply = g.replies.get(&original_id).and_then(|r| r.last()).cloned();
                return Ok(SaveResult::Duplicate { original, last_reply });
            }
            g.by_primary_key.insert(key, request.id);
        }
        g.requests.insert(request.id, request);
        Ok(SaveResult::Success)
    }

    async fn save_reply(&self, reply: Reply) -> Result<(), PersistenceError> {
        let mut g = self.inner.lock().await;
        if !g.requests.contains_key(&reply.request_id) {
            return Err(PersistenceError::permanent(
                "save_reply",
                format!("unknown request {}", reply.request_id),
            ));
        }
        g.replies.entry(reply.request_id).or_default().push(reply);
        Ok(())
    }

    async fn request_id_for_primary_key(&self, key: &PrimaryKey) -> Result<Option<RequestId>, PersistenceError> {
        Ok(self.inner.lock().await.by_primary_key.get(key).copied())
    }

    async fn replies_for_unfiltered(&self, request_ids: &[RequestId]) -> Result<Vec<Reply>, PersistenceError> {
        let g = self.inner.lock().await;
        let mut replies: Vec<Reply> = request_ids
            .iter()
            .filter_map(|id| g.replies.get(id))
            .flatten()
            .cloned()
            .collect();
        replies.sort_by_key(|r| r.id);
        Ok(replies)
    }

    async fn is_unprocessed(&self, request_id: RequestId) -> Result<bool, PersistenceError> {
        let g = self.inner.lock().await;
        Ok(g.requests.contains_key(&request_id) && g.replies.get(&request_id).is_none_or(Vec::is_empty))
    }

    async fn reset_request(&self, request_id: RequestId) -> Result<(), PersistenceError> {
        self.inner.lock().await.replies.remove(&request_id);
        Ok(())
    }

    async fn unprocessed_requests(&self, entity_types: &[String]) -> Result<Vec<StoredRequest>, PersistenceError> {
        let g = self.inner.lock().await;
        Ok(g.requests
            .values()
            .filter(|r| entity_types.contains(&r.address.entity_type))
            .filter(|r| g.replies.get(&r.id).is_none_or(Vec::is_empty))
            .cloned()
            .collect())
    }

    async fn clear_address(&self, address: &EntityAddress) -> Result<(), PersistenceError> {
        let mut g = self.inner.lock().await;
        let ids: Vec<RequestId> = g
            .requests
            .values()
            .filter(|r| &r.address == address)
            .map(|r| r.id)
            .collect();
        for id in ids {
            g.remove_request(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;
    use crate::providers::ShardId;
    use crate::snowflake::SnowflakeGenerator;
    use serde_json::json;

    fn address(entity_id: &str) -> EntityAddress {
        EntityAddress {
            entity_type: "Workflow/Order".into(),
            entity_id: entity_id.into(),
            shard_id: ShardId {
                group: "default".into(),
                id: 1,
            },
        }
    }

    fn request(ids: &SnowflakeGenerator, entity_id: &str, tag: &str, key: Option<&str>) -> StoredRequest {
        StoredRequest {
            id: ids.next_id(),
            address: address(entity_id),
            tag: tag.into(),
            primary_key: key.map(str::to_string),
            payload: json!({}),
            deliver_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_primary_key_returns_original_and_last_reply() {
        let ids = SnowflakeGenerator::new(0);
        let store = InMemoryMessageStorage::new();
        let first = request(&ids, "E1", "activity", Some("charge-card/0"));
        assert_eq!(store.save_request(first.clone()).await.unwrap(), SaveResult::Success);

        let dup = request(&ids, "E1", "activity", Some("charge-card/0"));
        match store.save_request(dup).await.unwrap() {
            SaveResult::Duplicate { original, last_reply } => {
                assert_eq!(original.id, first.id);
                assert!(last_reply.is_none());
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        store
            .save_reply(Reply {
                id: ids.next_id(),
                request_id: first.id,
                outcome: Outcome::success(json!(1)),
            })
            .await
            .unwrap();
        let dup = request(&ids, "E1", "activity", Some("charge-card/0"));
        match store.save_request(dup).await.unwrap() {
            SaveResult::Duplicate { last_reply, .. } => {
                assert_eq!(last_reply.unwrap().outcome, Outcome::success(json!(1)));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        // Same key on a different entity is a different request.
        let other = request(&ids, "E2", "activity", Some("charge-card/0"));
        assert_eq!(store.save_request(other).await.unwrap(), SaveResult::Success);
    }

    #[tokio::test]
    async fn reset_makes_request_unprocessed_again() {
        let ids = SnowflakeGenerator::new(0);
        let store = InMemoryMessageStorage::new();
        let run = request(&ids, "E1", "run", Some(""));
        store.save_request(run.clone()).await.unwrap();
        assert!(store.is_unprocessed(run.id).await.unwrap());

        store
            .save_reply(Reply {
                id: ids.next_id(),
                request_id: run.id,
                outcome: Outcome::unit(),
            })
            .await
            .unwrap();
        assert!(!store.is_unprocessed(run.id).await.unwrap());
        assert!(store.unprocessed_requests(&["Workflow/Order".into()]).await.unwrap().is_empty());

        store.reset_request(run.id).await.unwrap();
        assert!(store.is_unprocessed(run.id).await.unwrap());
        assert!(store.replies_for_unfiltered(&[run.id]).await.unwrap().is_empty());
        let pending = store.unprocessed_requests(&["Workflow/Order".into()]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, run.id);
    }

    #[tokio::test]
    async fn reply_for_unknown_request_is_permanent_error() {
        let ids = SnowflakeGenerator::new(0);
        let store = InMemoryMessageStorage::new();
        let err = store
            .save_reply(Reply {
                id: ids.next_id(),
                request_id: ids.next_id(),
                outcome: Outcome::unit(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn clear_address_removes_requests_and_keys() {
        let ids = SnowflakeGenerator::new(0);
        let store = InMemoryMessageStorage::new();
        let a = request(&ids, "E1", "run", Some("nap"));
        let b = request(&ids, "E2", "run", Some("nap"));
        store.save_request(a.clone()).await.unwrap();
        store.save_request(b.clone()).await.unwrap();

        store.clear_address(&address("E1")).await.unwrap();
        assert!(store.requests_for(&address("E1")).await.is_empty());
        assert_eq!(store.requests_for(&address("E2")).await.len(), 1);
        assert!(!store.is_unprocessed(a.id).await.unwrap());

        let key = a.logical_key().unwrap();
        assert_eq!(store.request_id_for_primary_key(&key).await.unwrap(), None);
    }
}
