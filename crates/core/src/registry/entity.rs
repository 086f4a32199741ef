//! Entity descriptors: an ordered field list plus key and audit metadata.

use serde::Serialize;

use super::field::FieldDescriptor;

/// How a record's identity column is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// The executor assigns a fresh UUIDv7 when the row carries none.
    Uuid,
    /// The store assigns the identity (serial / identity column).
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityColumn {
    pub column: String,
    pub strategy: IdentityStrategy,
}

/// Creation/update audit columns stamped with the unified batch timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditColumns {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Immutable description of one importable entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub label: String,
    /// Table the store writes to.
    pub table: String,
    pub fields: Vec<FieldDescriptor>,
    /// Field names forming the natural key, in declaration order. Empty
    /// means "create only, no natural key".
    pub business_key: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityColumn>,
    pub audit: AuditColumns,
}

impl EntityDescriptor {
    /// Create a descriptor whose table name equals the entity name.
    pub fn new(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            table: name.to_string(),
            fields: Vec::new(),
            business_key: Vec::new(),
            identity: None,
            audit: AuditColumns::default(),
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn business_key(mut self, fields: &[&str]) -> Self {
        self.business_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn uuid_identity(mut self, column: &str) -> Self {
        self.identity = Some(IdentityColumn {
            column: column.to_string(),
            strategy: IdentityStrategy::Uuid,
        });
        self
    }

    pub fn database_identity(mut self, column: &str) -> Self {
        self.identity = Some(IdentityColumn {
            column: column.to_string(),
            strategy: IdentityStrategy::Database,
        });
        self
    }

    pub fn audit_columns(mut self, created_at: &str, updated_at: &str) -> Self {
        self.audit = AuditColumns {
            created_at: Some(created_at.to_string()),
            updated_at: Some(updated_at.to_string()),
        };
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_business_key(&self) -> bool {
        !self.business_key.is_empty()
    }

    pub fn is_business_key(&self, field: &str) -> bool {
        self.business_key.iter().any(|k| k == field)
    }

    /// Columns never touched by the update half of an upsert: identity,
    /// creation audit, business-key, and generated columns. A generated
    /// code, once assigned, stays with its record.
    pub fn is_update_protected(&self, column: &str) -> bool {
        self.identity.as_ref().is_some_and(|i| i.column == column)
            || self.audit.created_at.as_deref() == Some(column)
            || self.is_business_key(column)
            || self
                .get_field(column)
                .is_some_and(|f| f.generator.is_some())
    }

    /// Names of all fields whose values are timestamps.
    pub fn timestamp_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.kind == super::field::FieldKind::Datetime)
            .map(|f| f.name.as_str())
            .collect();
        columns.extend(self.audit.created_at.as_deref());
        columns.extend(self.audit.updated_at.as_deref());
        columns
    }
}
