//! Resolution of one raw row into a typed record.

use std::sync::Arc;

use serde::Serialize;

use super::ColumnMapping;
use crate::coercion::{coerce, ErrorKind, ValidationError};
use crate::registry::{EntityDescriptor, FieldGenerator};
use crate::value::{CellValue, Record, Row};

/// How one field gets its value.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Read and coerce the named column.
    Column(String),
    /// Unmapped field with a static default.
    Default(CellValue),
    /// Unmapped required field filled by its generator.
    Generated(Arc<dyn FieldGenerator>),
    /// Unmapped required field with no way to fill it.
    Missing,
    /// Unmapped optional field; left out of the record so writes keep
    /// whatever the store already holds.
    Omitted,
}

/// A mapping compiled against an entity, in descriptor field order.
#[derive(Debug, Clone)]
pub struct FieldBindings {
    entity: Arc<EntityDescriptor>,
    bindings: Vec<(String, Binding)>,
}

/// Outcome of resolving one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRow {
    /// 1-based data row number within the file.
    pub row_number: usize,
    pub values: Record,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ResolvedRow {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the row is rejected only for planned-skip reasons, see
    /// [`ErrorKind::is_planned_skip`].
    pub fn is_skip_only(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|e| e.kind.is_planned_skip())
    }

    /// Business-key tuple of this row, `None` if the entity has no key or
    /// any key field is null or absent.
    pub fn key_tuple(&self, entity: &EntityDescriptor) -> Option<Vec<String>> {
        if !entity.has_business_key() {
            return None;
        }
        key_tuple_of(&self.values, &entity.business_key)
    }

    pub fn push_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }
}

/// Key tuple of `record` over `fields`; `None` if any value is missing.
pub fn key_tuple_of(record: &Record, fields: &[String]) -> Option<Vec<String>> {
    fields
        .iter()
        .map(|f| record.get(f).and_then(CellValue::key_text))
        .collect()
}

impl FieldBindings {
    /// Compile `mapping` for `entity`. Assumes the mapping has passed
    /// [`super::validate_mapping`]; fields mapped by several columns take
    /// the first.
    pub fn new(entity: Arc<EntityDescriptor>, mapping: &ColumnMapping) -> Self {
        let bindings = entity
            .fields
            .iter()
            .map(|field| {
                let column = mapping
                    .iter()
                    .find(|(_, target)| target.as_deref() == Some(field.name.as_str()))
                    .map(|(column, _)| column.clone());

                let binding = match (column, &field.default_value, &field.generator) {
                    (Some(column), _, _) => Binding::Column(column),
                    (None, Some(default), _) => Binding::Default(default.clone()),
                    (None, None, Some(generator)) if field.required => {
                        Binding::Generated(Arc::clone(generator))
                    }
                    (None, None, _) if field.required => Binding::Missing,
                    (None, None, _) => Binding::Omitted,
                };
                (field.name.clone(), binding)
            })
            .collect();

        Self { entity, bindings }
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    pub fn binding(&self, field: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, b)| b)
    }

    /// Resolve one raw row.
    ///
    /// With `run_generators` unset, generated fields are left out of the
    /// record and count as satisfied, so validation passes do not consume
    /// sequence values.
    pub fn resolve(&self, row_number: usize, row: &Row, run_generators: bool) -> ResolvedRow {
        let mut resolved = ResolvedRow {
            row_number,
            values: Record::with_capacity(self.bindings.len()),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        for (field_name, binding) in &self.bindings {
            let Some(field) = self.entity.get_field(field_name) else {
                continue;
            };
            match binding {
                Binding::Column(column) => {
                    let raw = row.get(column).unwrap_or(&CellValue::Null);
                    match coerce(raw, field) {
                        Ok(coerced) => {
                            resolved.warnings.extend(coerced.warning);
                            resolved.values.insert(field_name.clone(), coerced.value);
                        }
                        Err(e) => resolved.errors.push(e),
                    }
                }
                Binding::Default(value) => {
                    resolved.values.insert(field_name.clone(), value.clone());
                }
                Binding::Generated(generator) => {
                    if run_generators {
                        resolved
                            .values
                            .insert(field_name.clone(), generator.generate());
                    }
                }
                Binding::Missing => resolved.errors.push(ValidationError::new(
                    field_name,
                    ErrorKind::RequiredFieldMissing,
                    format!("{} is required but no column is mapped to it", field.label),
                    None,
                )),
                Binding::Omitted => {}
            }
        }

        resolved
    }
}
