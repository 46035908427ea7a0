//! Resolves a logical request key to the request previously filed under it
//! and that request's latest reply.

use std::sync::Arc;

use crate::WorkflowDefinition;
use crate::error::EngineError;
use crate::providers::{EntityAddress, MessageStorage, PrimaryKey, Reply};
use crate::sharding::Sharding;
use crate::snowflake::RequestId;

/// Logical identity of one durable workflow step.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationKey<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub entity_type: &'a str,
    pub execution_id: &'a str,
    pub tag: &'a str,
    pub id: &'a str,
}

#[derive(Clone)]
pub struct RequestCorrelator {
    sharding: Arc<dyn Sharding>,
    storage: Arc<dyn MessageStorage>,
}

impl RequestCorrelator {
    pub fn new(sharding: Arc<dyn Sharding>, storage: Arc<dyn MessageStorage>) -> Self {
        Self { sharding, storage }
    }

    /// Address of the execution's entity, placed by the workflow's shard-group annotation.
    pub fn address_for(&self, key: &CorrelationKey<'_>) -> EntityAddress {
        let group = key.workflow.annotations().shard_group_for(key.execution_id);
        EntityAddress {
            entity_type: key.entity_type.to_string(),
            entity_id: key.execution_id.to_string(),
            shard_id: self.sharding.get_shard_id(key.execution_id, &group),
        }
    }

    pub async fn request_id_for(&self, key: &CorrelationKey<'_>) -> Result<Option<RequestId>, EngineError> {
        let primary_key = PrimaryKey {
            address: self.address_for(key),
            tag: key.tag.to_string(),
            id: key.id.to_string(),
        };
        Ok(self.storage.request_id_for_primary_key(&primary_key).await?)
    }

    /// Most recent reply recorded for `request_id`.
    pub async fn reply_for_request(&self, request_id: RequestId) -> Result<Option<Reply>, EngineError> {
        let replies = self.storage.replies_for_unfiltered(&[request_id]).await?;
        Ok(replies.into_iter().last())
    }

    /// `None` when nothing was filed under `key` or it has no reply yet.
    pub async fn request_reply(&self, key: &CorrelationKey<'_>) -> Result<Option<Reply>, EngineError> {
        match self.request_id_for(key).await? {
            Some(id) => self.reply_for_request(id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;
    use crate::providers::in_memory::InMemoryMessageStorage;
    use crate::providers::{SaveResult, StoredRequest};
    use crate::sharding::{LocalSharding, ShardingConfig};
    use crate::snowflake::SnowflakeGenerator;
    use serde_json::json;

    #[tokio::test]
    async fn same_key_resolves_to_same_reply() {
        let storage = Arc::new(InMemoryMessageStorage::new());
        let sharding = LocalSharding::new(storage.clone(), ShardingConfig::default());
        let correlator = RequestCorrelator::new(sharding, storage.clone());
        let workflow = WorkflowDefinition::new("Order");
        let key = CorrelationKey {
            workflow: &workflow,
            entity_type: "Workflow/Order",
            execution_id: "E1",
            tag: "activity",
            id: "charge-card/0",
        };
        assert!(correlator.request_reply(&key).await.unwrap().is_none());

        let ids = SnowflakeGenerator::new(0);
        let request = StoredRequest {
            id: ids.next_id(),
            address: correlator.address_for(&key),
            tag: "activity".into(),
            primary_key: Some("charge-card/0".into()),
            payload: json!({"name": "charge-card", "attempt": 0}),
            deliver_at: None,
        };
        assert_eq!(storage.save_request(request.clone()).await.unwrap(), SaveResult::Success);
        assert_eq!(correlator.request_id_for(&key).await.unwrap(), Some(request.id));
        assert!(correlator.request_reply(&key).await.unwrap().is_none());

        for n in [1, 2] {
            storage
                .save_reply(Reply {
                    id: ids.next_id(),
                    request_id: request.id,
                    outcome: Outcome::success(json!(n)),
                })
                .await
                .unwrap();
        }
        let first = correlator.request_reply(&key).await.unwrap().unwrap();
        let second = correlator.request_reply(&key).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.outcome, Outcome::success(json!(2)));
    }

    #[test]
    fn address_follows_shard_group_annotation() {
        let storage = Arc::new(InMemoryMessageStorage::new());
        let sharding = LocalSharding::new(storage.clone(), ShardingConfig::default());
        let correlator = RequestCorrelator::new(sharding, storage);
        let workflow = WorkflowDefinition::new("Order").with_shard_group(|_| "billing".to_string());
        let key = CorrelationKey {
            workflow: &workflow,
            entity_type: "Workflow/Order",
            execution_id: "E1",
            tag: "run",
            id: "",
        };
        let address = correlator.address_for(&key);
        assert_eq!(address.shard_id.group, "billing");
        assert_eq!(address.entity_id, "E1");
    }
}
