//! Metadata registry: the catalog of importable entity types.
//!
//! The registry is built once at start-up (via [`EntityRegistry::register`]
//! or [`EntityRegistry::with_builtin_catalog`]) and then shared read-only,
//! typically behind an `Arc`, with the session manager and the executor.

pub mod catalog;
pub mod entity;
pub mod field;
pub mod suggest;

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::CoreError;

pub use entity::{AuditColumns, EntityDescriptor, IdentityColumn, IdentityStrategy};
pub use field::{Choice, FieldDescriptor, FieldGenerator, FieldKind, ReferenceTarget, SequenceGenerator};
pub use suggest::{FieldScore, MappingSuggestion, MatchRule};

/// Catalog of entity descriptors keyed by entity name.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: IndexMap<String, Arc<EntityDescriptor>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in account, product, and
    /// partner entities.
    pub fn with_builtin_catalog() -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for entity in catalog::builtin_entities() {
            registry.register(entity)?;
        }
        Ok(registry)
    }

    /// Register a new entity. Start-up only.
    ///
    /// Rejects duplicate entity names, duplicate field names, business keys
    /// naming unknown or non-key-compatible fields, and enumerated defaults
    /// that are not among the choices.
    pub fn register(&mut self, entity: EntityDescriptor) -> Result<(), CoreError> {
        if self.entities.contains_key(&entity.name) {
            return Err(CoreError::Conflict(format!(
                "Entity '{}' is already registered",
                entity.name
            )));
        }
        validate_descriptor(&entity)?;
        self.entities.insert(entity.name.clone(), Arc::new(entity));
        Ok(())
    }

    /// Look up an entity descriptor by name.
    pub fn describe(&self, name: &str) -> Result<Arc<EntityDescriptor>, CoreError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::EntityNotFound(name.to_string()))
    }

    /// Names of all registered entities, in registration order.
    pub fn list_entities(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }

    /// Suggest a target field for each column of a file.
    pub fn suggest_mapping(
        &self,
        entity_name: &str,
        columns: &[String],
    ) -> Result<Vec<MappingSuggestion>, CoreError> {
        let entity = self.describe(entity_name)?;
        Ok(suggest::suggest_mapping(&entity, columns))
    }
}

fn validate_descriptor(entity: &EntityDescriptor) -> Result<(), CoreError> {
    let mut seen = std::collections::HashSet::new();
    for field in &entity.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(CoreError::Validation(format!(
                "Entity '{}' declares field '{}' twice",
                entity.name, field.name
            )));
        }
        if let (Some(default), true) = (&field.default_value, field.is_enumerated()) {
            let default = default.to_string();
            if !field.choices.iter().any(|c| c.value == default) {
                return Err(CoreError::Validation(format!(
                    "Default '{default}' of '{}.{}' is not one of: {}",
                    entity.name,
                    field.name,
                    field.choice_list()
                )));
            }
        }
        if field.kind == FieldKind::Reference && field.reference.is_none() {
            return Err(CoreError::Validation(format!(
                "Reference field '{}.{}' has no target",
                entity.name, field.name
            )));
        }
    }

    for key in &entity.business_key {
        let field = entity.get_field(key).ok_or_else(|| {
            CoreError::Validation(format!(
                "Business key of '{}' names unknown field '{key}'",
                entity.name
            ))
        })?;
        if !field.kind.is_key_compatible() {
            return Err(CoreError::Validation(format!(
                "Field '{}.{key}' of kind {} cannot be part of a business key",
                entity.name, field.kind
            )));
        }
    }
    Ok(())
}
