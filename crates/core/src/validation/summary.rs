//! Validation summaries and in-file uniqueness tracking.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use super::row::{key_tuple_of, ResolvedRow};
use crate::coercion::{ErrorKind, ValidationError};
use crate::outcome::RowError;
use crate::registry::EntityDescriptor;

/// Aggregate view of a validated row set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    /// Invalid rows rejected only for planned-skip reasons.
    pub skip_only_rows: usize,
    pub warning_count: usize,
    pub error_counts: BTreeMap<ErrorKind, usize>,
    /// Bounded sample of errors, in file order.
    pub errors: Vec<RowError>,
    #[serde(skip)]
    max_errors: usize,
}

impl ValidationSummary {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            ..Default::default()
        }
    }

    pub fn record(&mut self, row: &ResolvedRow) {
        self.total_rows += 1;
        self.warning_count += row.warnings.len();
        if row.is_valid() {
            self.valid_rows += 1;
            return;
        }
        self.invalid_rows += 1;
        if row.is_skip_only() {
            self.skip_only_rows += 1;
        }
        for error in &row.errors {
            *self.error_counts.entry(error.kind).or_insert(0) += 1;
            if self.errors.len() < self.max_errors {
                self.errors.push(RowError::from_validation(row.row_number, error));
            }
        }
    }

    /// Invalid rows that abort an execution without `skip_errors`.
    pub fn blocking_rows(&self) -> usize {
        self.invalid_rows - self.skip_only_rows
    }

    /// Whether an execution without `skip_errors` would write every row.
    pub fn can_proceed(&self) -> bool {
        self.valid_rows > 0 && self.invalid_rows == 0
    }
}

/// Detects repeats of unique fields and business-key tuples within a file.
///
/// The first valid occurrence claims a value; later rows repeating it get
/// `duplicate_key`. Rows that are already invalid claim nothing.
#[derive(Debug, Clone)]
pub struct UniquenessTracker {
    groups: Vec<KeyGroup>,
}

#[derive(Debug, Clone)]
struct KeyGroup {
    fields: Vec<String>,
    seen: HashSet<Vec<String>>,
}

impl UniquenessTracker {
    pub fn new(entity: &EntityDescriptor) -> Self {
        let mut groups: Vec<Vec<String>> = Vec::new();
        if entity.has_business_key() {
            groups.push(entity.business_key.clone());
        }
        for field in entity.fields.iter().filter(|f| f.unique) {
            let single = vec![field.name.clone()];
            if !groups.contains(&single) {
                groups.push(single);
            }
        }
        Self {
            groups: groups
                .into_iter()
                .map(|fields| KeyGroup {
                    fields,
                    seen: HashSet::new(),
                })
                .collect(),
        }
    }

    /// Check `row` and record its keys. Returns `true` if a duplicate was
    /// found (and pushed onto the row's errors).
    pub fn check(&mut self, row: &mut ResolvedRow) -> bool {
        if !row.is_valid() {
            return false;
        }

        let mut duplicates = Vec::new();
        let mut claims = Vec::new();
        for (idx, group) in self.groups.iter().enumerate() {
            let Some(key) = key_tuple_of(&row.values, &group.fields) else {
                continue;
            };
            if group.seen.contains(&key) {
                duplicates.push(ValidationError {
                    field: group.fields.join(","),
                    kind: ErrorKind::DuplicateKey,
                    message: format!(
                        "Duplicate value for {} within the file",
                        group.fields.join(" + ")
                    ),
                    value: Some(key.join(", ")),
                });
            } else {
                claims.push((idx, key));
            }
        }

        if !duplicates.is_empty() {
            row.errors.extend(duplicates);
            return true;
        }
        for (idx, key) in claims {
            self.groups[idx].seen.insert(key);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldDescriptor, FieldKind};
    use crate::value::{CellValue, Record};

    fn make_entity() -> EntityDescriptor {
        EntityDescriptor::new("partner", "Partner")
            .field(FieldDescriptor::new("tax_id", "Tax ID", FieldKind::Text).unique())
            .field(FieldDescriptor::new("email", "Email", FieldKind::Email).unique())
            .business_key(&["tax_id"])
    }

    fn make_row(n: usize, tax_id: &str, email: &str) -> ResolvedRow {
        let mut values = Record::new();
        values.insert("tax_id".into(), CellValue::text(tax_id));
        values.insert("email".into(), CellValue::text(email));
        ResolvedRow {
            row_number: n,
            values,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    // -- uniqueness --

    #[test]
    fn first_occurrence_wins() {
        let mut tracker = UniquenessTracker::new(&make_entity());
        let mut a = make_row(1, "X1", "a@x.io");
        let mut b = make_row(2, "X1", "b@x.io");
        assert!(!tracker.check(&mut a));
        assert!(tracker.check(&mut b));
        assert_eq!(b.errors.len(), 1);
        assert_eq!(b.errors[0].kind, ErrorKind::DuplicateKey);
        assert_eq!(b.errors[0].field, "tax_id");
    }

    #[test]
    fn unique_non_key_field_checked_separately() {
        let mut tracker = UniquenessTracker::new(&make_entity());
        tracker.check(&mut make_row(1, "X1", "a@x.io"));
        let mut b = make_row(2, "X2", "a@x.io");
        assert!(tracker.check(&mut b));
        assert_eq!(b.errors[0].field, "email");
    }

    #[test]
    fn rejected_row_does_not_claim_keys() {
        let mut tracker = UniquenessTracker::new(&make_entity());
        let mut first = make_row(1, "X1", "a@x.io");
        tracker.check(&mut first);
        let mut b = make_row(2, "X2", "a@x.io");
        tracker.check(&mut b);
        // X2 was not claimed by the rejected row.
        let mut c = make_row(3, "X2", "c@x.io");
        assert!(!tracker.check(&mut c));
    }

    #[test]
    fn key_matching_is_case_sensitive() {
        let mut tracker = UniquenessTracker::new(&make_entity());
        tracker.check(&mut make_row(1, "abc", "a@x.io"));
        assert!(!tracker.check(&mut make_row(2, "ABC", "b@x.io")));
    }

    #[test]
    fn null_keys_are_not_tracked() {
        let mut tracker = UniquenessTracker::new(&make_entity());
        let mut a = make_row(1, "X1", "a@x.io");
        a.values.insert("email".into(), CellValue::Null);
        let mut b = make_row(2, "X2", "b@x.io");
        b.values.insert("email".into(), CellValue::Null);
        tracker.check(&mut a);
        assert!(!tracker.check(&mut b));
    }

    // -- summary --

    #[test]
    fn summary_counts_and_can_proceed() {
        let mut summary = ValidationSummary::new(10);
        let ok = make_row(1, "X1", "a@x.io");
        summary.record(&ok);
        assert!(summary.can_proceed());

        let mut bad = make_row(2, "X1", "b@x.io");
        bad.errors.push(ValidationError::new("tax_id", ErrorKind::DuplicateKey, "dup", None));
        bad.warnings.push("odd".into());
        summary.record(&bad);

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.valid_rows, 1);
        assert_eq!(summary.invalid_rows, 1);
        assert_eq!(summary.warning_count, 1);
        assert_eq!(summary.error_counts[&ErrorKind::DuplicateKey], 1);
        assert_eq!(summary.errors[0].row_number, 2);
        assert!(!summary.can_proceed());
        assert_eq!(summary.skip_only_rows, 1);
        assert_eq!(summary.blocking_rows(), 0);
    }

    #[test]
    fn rows_with_other_errors_block() {
        let mut summary = ValidationSummary::new(10);
        let mut missing = make_row(1, "X1", "a@x.io");
        missing.errors.push(ValidationError::new("tax_id", ErrorKind::RecordNotFound, "none", None));
        summary.record(&missing);

        let mut mixed = make_row(2, "X2", "b@x.io");
        mixed.errors.push(ValidationError::new("tax_id", ErrorKind::DuplicateKey, "dup", None));
        mixed.errors.push(ValidationError::new("email", ErrorKind::StringTooLong, "long", None));
        summary.record(&mixed);

        assert_eq!(summary.invalid_rows, 2);
        assert_eq!(summary.skip_only_rows, 1);
        assert_eq!(summary.blocking_rows(), 1);
    }

    #[test]
    fn empty_summary_cannot_proceed() {
        assert!(!ValidationSummary::new(10).can_proceed());
    }
}
