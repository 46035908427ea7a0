//! Process-wide table of registered workflows and their entity types.
//!
//! Populated during startup, read-mostly afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::entity::workflow_entity;
use crate::WorkflowDefinition;
use crate::error::EngineError;
use crate::sharding::EntityType;

struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    entity: Arc<EntityType>,
}

#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, RegisteredWorkflow>>,
}

impl WorkflowRegistry {
    /// Record `definition` and build its entity type. Names are unique.
    pub fn insert(&self, definition: &WorkflowDefinition) -> Result<Arc<EntityType>, EngineError> {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        if workflows.contains_key(definition.name()) {
            return Err(EngineError::defect(format!(
                "workflow {} is already registered",
                definition.name()
            )));
        }
        let entity = Arc::new(workflow_entity(definition));
        workflows.insert(
            definition.name().to_string(),
            RegisteredWorkflow {
                definition: definition.clone(),
                entity: entity.clone(),
            },
        );
        Ok(entity)
    }

    pub fn remove(&self, name: &str) {
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn definition(&self, name: &str) -> Option<WorkflowDefinition> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|w| w.definition.clone())
    }

    pub fn entity(&self, name: &str) -> Option<Arc<EntityType>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|w| w.entity.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = WorkflowRegistry::default();
        let entity = registry.insert(&WorkflowDefinition::new("Order")).unwrap();
        assert_eq!(entity.name(), "Workflow/Order");
        assert!(entity.operation("run").is_some_and(|op| op.persisted && op.uninterruptible));

        let err = registry.insert(&WorkflowDefinition::new("Order")).unwrap_err();
        assert!(err.is_defect());

        registry.insert(&WorkflowDefinition::new("Refund")).unwrap();
        assert_eq!(registry.names(), vec!["Order".to_string(), "Refund".to_string()]);
        assert!(registry.definition("Refund").is_some());
        assert!(registry.entity("Missing").is_none());
    }
}
