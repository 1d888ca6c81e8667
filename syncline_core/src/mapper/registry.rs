use crate::mapper::mapping::FieldMapping;
use crate::mapper::unified::UnifiedEntityName;
use crate::sync::link::{BoxLink, map_data_link};
use crate::sync::operation::DataOp;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps one raw entity of one connector onto a unified schema.
#[derive(Debug, Clone)]
pub struct EntityMapper {
    pub connector_name: String,
    /// Entity name as emitted by the source (e.g. HubSpot `contact`).
    pub entity_name: String,
    pub target: UnifiedEntityName,
    pub mapping: FieldMapping,
}

impl EntityMapper {
    pub fn new(
        connector_name: impl Into<String>,
        entity_name: impl Into<String>,
        target: UnifiedEntityName,
        mapping: FieldMapping,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            entity_name: entity_name.into(),
            target,
            mapping,
        }
    }

    /// Unified fields of `target` the mapping does not declare.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.target
            .fields()
            .iter()
            .copied()
            .filter(|f| !self.mapping.has_field(f))
            .collect()
    }

    pub fn unify(&self, raw: &serde_json::Value) -> serde_json::Value {
        self.mapping.apply(raw)
    }
}

/// Explicit `(connector_name, entity_name) -> mapper` table, built at startup.
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    mappers: HashMap<(String, String), Arc<EntityMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper. Rejects mappings that leave target fields undeclared
    /// and duplicate registrations for the same key.
    #[tracing::instrument(level = "debug", skip(self, mapper), fields(connector = %mapper.connector_name, entity = %mapper.entity_name))]
    pub fn register(&mut self, mapper: EntityMapper) -> Result<()> {
        if mapper.connector_name.trim().is_empty() || mapper.entity_name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "mapper connector_name and entity_name must be set".to_string(),
            ));
        }
        let missing = mapper.missing_fields();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "mapper {}/{} -> {} does not map fields: {}",
                mapper.connector_name,
                mapper.entity_name,
                mapper.target,
                missing.join(", ")
            )));
        }
        let key = (mapper.connector_name.clone(), mapper.entity_name.clone());
        if self.mappers.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "mapper {}/{} already registered",
                key.0, key.1
            )));
        }
        self.mappers.insert(key, Arc::new(mapper));
        Ok(())
    }

    pub fn get(&self, connector_name: &str, entity_name: &str) -> Option<&Arc<EntityMapper>> {
        self.mappers
            .get(&(connector_name.to_string(), entity_name.to_string()))
    }

    pub fn entity_names(&self, connector_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .mappers
            .keys()
            .filter(|(c, _)| c == connector_name)
            .map(|(_, e)| e.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Attach the unified record to `op`, renaming it to the unified entity.
    /// Returns `None` when no mapper exists (the record is skipped, not failed).
    pub fn unify(&self, connector_name: &str, op: DataOp) -> Option<DataOp> {
        let Some(mapper) = self.get(connector_name, &op.entity_name) else {
            tracing::warn!(
                connector = connector_name,
                entity_name = %op.entity_name,
                id = %op.id,
                "no mapper for entity; skipping record"
            );
            return None;
        };
        let unified = mapper.unify(&op.entity.raw);
        Some(DataOp {
            id: op.id,
            entity_name: mapper.target.as_str().to_string(),
            entity: op.entity.with_unified(unified),
            connection_id: op.connection_id,
        })
    }
}

/// Link that unifies data records of `connector_name`; unmapped records are dropped.
pub fn unify_link(registry: Arc<MapperRegistry>, connector_name: impl Into<String>) -> BoxLink {
    let connector_name = connector_name.into();
    map_data_link(move |op| Ok(registry.unify(&connector_name, op)))
}
