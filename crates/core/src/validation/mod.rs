//! Row-level validation: column mappings, row resolution, and summaries.
//!
//! A [`ColumnMapping`] is checked once against the entity
//! ([`validate_mapping`]), compiled into [`FieldBindings`], and then applied
//! to every raw row to produce a [`ResolvedRow`].

pub mod row;
pub mod summary;

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::CoreError;
use crate::registry::EntityDescriptor;

pub use row::{key_tuple_of, Binding, FieldBindings, ResolvedRow};
pub use summary::{UniquenessTracker, ValidationSummary};

/// Column name to target field name. `None` means "ignore this column".
pub type ColumnMapping = IndexMap<String, Option<String>>;

/// Check a mapping against an entity and, when known, the file's columns.
///
/// Rejects fields the entity does not declare, two columns mapped to the
/// same field, and columns absent from the file.
pub fn validate_mapping(
    entity: &EntityDescriptor,
    mapping: &ColumnMapping,
    columns: Option<&[String]>,
) -> Result<(), CoreError> {
    let mut targets: HashMap<&str, &str> = HashMap::new();

    for (column, field) in mapping {
        let Some(field) = field else { continue };

        if entity.get_field(field).is_none() {
            return Err(CoreError::InvalidMapping(format!(
                "Column '{column}' maps to unknown field '{field}' of entity '{}'",
                entity.name
            )));
        }
        if let Some(columns) = columns {
            if !columns.iter().any(|c| c == column) {
                return Err(CoreError::InvalidMapping(format!(
                    "Column '{column}' does not exist in the file"
                )));
            }
        }
        if let Some(previous) = targets.insert(field.as_str(), column.as_str()) {
            return Err(CoreError::InvalidMapping(format!(
                "Columns '{previous}' and '{column}' both map to field '{field}'"
            )));
        }
    }
    Ok(())
}

/// Build a mapping from the confident auto-mapping suggestions.
pub fn mapping_from_suggestions(suggestions: &[crate::registry::MappingSuggestion]) -> ColumnMapping {
    let mut taken = std::collections::HashSet::new();
    suggestions
        .iter()
        .map(|s| {
            // A field already claimed by an earlier column is left unmapped.
            let field = s
                .suggested_field
                .clone()
                .filter(|f| taken.insert(f.clone()));
            (s.column.clone(), field)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDescriptor, FieldKind, MappingSuggestion};
    use assert_matches::assert_matches;

    fn make_entity() -> EntityDescriptor {
        EntityDescriptor::new("thing", "Thing")
            .field(FieldDescriptor::new("name", "Name", FieldKind::Text))
            .field(FieldDescriptor::new("code", "Code", FieldKind::Text))
    }

    fn make_mapping(pairs: &[(&str, Option<&str>)]) -> ColumnMapping {
        pairs
            .iter()
            .map(|(c, f)| (c.to_string(), f.map(str::to_string)))
            .collect()
    }

    #[test]
    fn valid_mapping_with_ignored_column() {
        let mapping = make_mapping(&[("Nombre", Some("name")), ("Notes", None)]);
        assert!(validate_mapping(&make_entity(), &mapping, None).is_ok());
    }

    #[test]
    fn unknown_field_rejected() {
        let mapping = make_mapping(&[("Nombre", Some("title"))]);
        assert_matches!(
            validate_mapping(&make_entity(), &mapping, None),
            Err(CoreError::InvalidMapping(msg)) if msg.contains("title")
        );
    }

    #[test]
    fn field_mapped_twice_rejected() {
        let mapping = make_mapping(&[("A", Some("name")), ("B", Some("name"))]);
        assert_matches!(
            validate_mapping(&make_entity(), &mapping, None),
            Err(CoreError::InvalidMapping(_))
        );
    }

    #[test]
    fn column_missing_from_file_rejected() {
        let mapping = make_mapping(&[("A", Some("name"))]);
        let columns = vec!["B".to_string()];
        assert_matches!(
            validate_mapping(&make_entity(), &mapping, Some(columns.as_slice())),
            Err(CoreError::InvalidMapping(_))
        );
    }

    #[test]
    fn suggestions_become_mapping_without_double_claims() {
        let make = |column: &str, field: Option<&str>| MappingSuggestion {
            column: column.to_string(),
            suggested_field: field.map(str::to_string),
            confidence: 1.0,
            candidates: Vec::new(),
        };
        let mapping = mapping_from_suggestions(&[
            make("name", Some("name")),
            make("nombre", Some("name")),
            make("misc", None),
        ]);
        assert_eq!(mapping["name"].as_deref(), Some("name"));
        assert_eq!(mapping["nombre"], None);
        assert_eq!(mapping["misc"], None);
    }
}
