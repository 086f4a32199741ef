//! Column-to-field auto-mapping suggestions.
//!
//! Every (column, field) pair is scored by the first rule that matches, in
//! priority order:
//!
//! | Rule        | Confidence |
//! |-------------|------------|
//! | exact name  | 1.0        |
//! | synonym     | 0.9        |
//! | substring   | 0.7        |
//! | word prefix | 0.4        |
//!
//! The best-scoring field wins (ties keep descriptor order). Matches below
//! [`MIN_SUGGESTION_CONFIDENCE`] are not suggested, but the full score
//! distribution is always returned.

use serde::Serialize;

use super::entity::EntityDescriptor;
use super::field::FieldDescriptor;

pub const CONFIDENCE_EXACT: f64 = 1.0;
pub const CONFIDENCE_SYNONYM: f64 = 0.9;
pub const CONFIDENCE_SUBSTRING: f64 = 0.7;
pub const CONFIDENCE_PREFIX: f64 = 0.4;

/// Below this a best match is reported as "no confident match".
pub const MIN_SUGGESTION_CONFIDENCE: f64 = 0.5;

/// Shortest normalised name considered for substring matching.
const MIN_SUBSTRING_LEN: usize = 3;

/// Shortest word considered for prefix matching.
const MIN_PREFIX_LEN: usize = 2;

/// Synonyms shared by every entity, keyed by field name.
const COMMON_SYNONYMS: &[(&str, &[&str])] = &[
    ("name", &["nombre", "name", "company", "razon_social", "full_name", "descripcion"]),
    ("email", &["correo", "e_mail", "mail", "correo_electronico"]),
    ("phone", &["telefono", "teléfono", "tel", "mobile", "celular", "movil"]),
    ("code", &["codigo", "código", "ref", "reference"]),
    ("tax_id", &["rfc", "nif", "cif", "vat", "vat_number", "tax_number", "ruc"]),
    ("unit_price", &["precio", "price", "cost", "precio_unitario"]),
    ("quantity", &["cantidad", "qty", "stock", "existencias"]),
    ("is_active", &["activo", "active", "enabled", "estado"]),
    ("category", &["categoria", "categoría", "family", "familia"]),
    ("credit_limit", &["limite_credito", "credit"]),
    ("opening_balance", &["saldo_inicial", "balance", "saldo"]),
];

/// Which rule produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    Synonym,
    Substring,
    Prefix,
}

impl MatchRule {
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Exact => CONFIDENCE_EXACT,
            Self::Synonym => CONFIDENCE_SYNONYM,
            Self::Substring => CONFIDENCE_SUBSTRING,
            Self::Prefix => CONFIDENCE_PREFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldScore {
    pub field: String,
    pub confidence: f64,
    pub rule: MatchRule,
}

/// Suggestion for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingSuggestion {
    pub column: String,
    /// Best field, if its confidence reaches [`MIN_SUGGESTION_CONFIDENCE`].
    pub suggested_field: Option<String>,
    /// Confidence of the best match (reported even when not suggested).
    pub confidence: f64,
    /// Every field that matched any rule, best first.
    pub candidates: Vec<FieldScore>,
}

/// Score every column against every field of `entity`.
pub fn suggest_mapping(entity: &EntityDescriptor, columns: &[String]) -> Vec<MappingSuggestion> {
    columns
        .iter()
        .map(|column| suggest_column(entity, column))
        .collect()
}

fn suggest_column(entity: &EntityDescriptor, column: &str) -> MappingSuggestion {
    let mut candidates: Vec<FieldScore> = entity
        .fields
        .iter()
        .filter_map(|field| {
            match_rule(column, field).map(|rule| FieldScore {
                field: field.name.clone(),
                confidence: rule.confidence(),
                rule,
            })
        })
        .collect();

    // Stable sort keeps descriptor order among equal scores.
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let (suggested_field, confidence) = match candidates.first() {
        Some(best) if best.confidence >= MIN_SUGGESTION_CONFIDENCE => {
            (Some(best.field.clone()), best.confidence)
        }
        Some(best) => (None, best.confidence),
        None => (None, 0.0),
    };

    MappingSuggestion {
        column: column.to_string(),
        suggested_field,
        confidence,
        candidates,
    }
}

/// The highest-priority rule matching `column` against `field`.
pub fn match_rule(column: &str, field: &FieldDescriptor) -> Option<MatchRule> {
    let col = normalize(column);
    if col.is_empty() {
        return None;
    }
    let name = normalize(&field.name);
    let label = normalize(&field.label);

    if col == name || col == label {
        return Some(MatchRule::Exact);
    }

    if synonyms_for(field).any(|s| normalize(s) == col) {
        return Some(MatchRule::Synonym);
    }

    if [&name, &label].iter().any(|target| is_substring_match(&col, target)) {
        return Some(MatchRule::Substring);
    }

    if [&name, &label].iter().any(|target| is_prefix_match(&col, target)) {
        return Some(MatchRule::Prefix);
    }

    None
}

fn synonyms_for(field: &FieldDescriptor) -> impl Iterator<Item = &str> {
    let common = COMMON_SYNONYMS
        .iter()
        .find(|(name, _)| *name == field.name)
        .map(|(_, list)| *list)
        .unwrap_or(&[]);
    field
        .synonyms
        .iter()
        .map(String::as_str)
        .chain(common.iter().copied())
}

/// Lowercase, trim, and fold whitespace and hyphens into underscores.
fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn is_substring_match(a: &str, b: &str) -> bool {
    if a.chars().count() < MIN_SUBSTRING_LEN || b.chars().count() < MIN_SUBSTRING_LEN {
        return false;
    }
    a.contains(b) || b.contains(a)
}

fn is_prefix_match(a: &str, b: &str) -> bool {
    let words_a: Vec<&str> = a.split('_').filter(|w| w.len() >= MIN_PREFIX_LEN).collect();
    let words_b: Vec<&str> = b.split('_').filter(|w| w.len() >= MIN_PREFIX_LEN).collect();
    words_a.iter().any(|wa| {
        words_b
            .iter()
            .any(|wb| wa.starts_with(wb) || wb.starts_with(wa))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::field::FieldKind;
    use proptest::prelude::*;

    fn make_entity() -> EntityDescriptor {
        EntityDescriptor::new("partner", "Partner")
            .field(FieldDescriptor::new("name", "Name", FieldKind::Text))
            .field(FieldDescriptor::new("tax_id", "Tax ID", FieldKind::Text))
            .field(FieldDescriptor::new("email", "Email", FieldKind::Email))
            .field(FieldDescriptor::new("credit_limit", "Credit limit", FieldKind::Decimal))
    }

    fn suggest_one(column: &str) -> MappingSuggestion {
        suggest_mapping(&make_entity(), &[column.to_string()]).remove(0)
    }

    // -- rule priority --

    #[test]
    fn exact_match_is_case_insensitive() {
        let s = suggest_one("NAME");
        assert_eq!(s.suggested_field.as_deref(), Some("name"));
        assert_eq!(s.confidence, CONFIDENCE_EXACT);
    }

    #[test]
    fn label_counts_as_exact() {
        let s = suggest_one("Tax ID");
        assert_eq!(s.suggested_field.as_deref(), Some("tax_id"));
        assert_eq!(s.confidence, CONFIDENCE_EXACT);
    }

    #[test]
    fn synonym_match() {
        let s = suggest_one("Nombre");
        assert_eq!(s.suggested_field.as_deref(), Some("name"));
        assert_eq!(s.confidence, CONFIDENCE_SYNONYM);
        assert_eq!(s.candidates[0].rule, MatchRule::Synonym);
    }

    #[test]
    fn substring_match() {
        let s = suggest_one("customer_email_address");
        assert_eq!(s.suggested_field.as_deref(), Some("email"));
        assert_eq!(s.confidence, CONFIDENCE_SUBSTRING);
    }

    #[test]
    fn prefix_match_is_not_suggested() {
        let s = suggest_one("credit card");
        assert!(s.suggested_field.is_none());
        assert_eq!(s.confidence, CONFIDENCE_PREFIX);
        assert_eq!(s.candidates[0].field, "credit_limit");
    }

    #[test]
    fn unmatched_column_has_zero_confidence() {
        let s = suggest_one("zzz");
        assert!(s.suggested_field.is_none());
        assert_eq!(s.confidence, 0.0);
        assert!(s.candidates.is_empty());
    }

    #[test]
    fn ties_keep_descriptor_order() {
        let entity = EntityDescriptor::new("x", "X")
            .field(FieldDescriptor::new("first", "Shared", FieldKind::Text))
            .field(FieldDescriptor::new("second", "Shared", FieldKind::Text));
        let s = suggest_mapping(&entity, &["shared".to_string()]).remove(0);
        assert_eq!(s.suggested_field.as_deref(), Some("first"));
        assert_eq!(s.candidates.len(), 2);
    }

    #[test]
    fn descriptor_synonyms_are_used() {
        let entity = EntityDescriptor::new("x", "X").field(
            FieldDescriptor::new("sku", "SKU", FieldKind::Text).synonyms(&["item code"]),
        );
        let s = suggest_mapping(&entity, &["Item-Code".to_string()]).remove(0);
        assert_eq!(s.suggested_field.as_deref(), Some("sku"));
        assert_eq!(s.confidence, CONFIDENCE_SYNONYM);
    }

    // -- monotonicity --

    proptest! {
        #[test]
        fn exact_never_scores_below_other_rules(name in "[a-z]{3,10}") {
            let field = FieldDescriptor::new(&name, &name, FieldKind::Text)
                .synonyms(&[name.as_str()]);
            prop_assert_eq!(match_rule(&name.to_uppercase(), &field), Some(MatchRule::Exact));
            let extended = format!("{name}_extra");
            let rule = match_rule(&extended, &field).unwrap();
            prop_assert!(rule.confidence() <= CONFIDENCE_EXACT);
        }

        #[test]
        fn synonym_never_scores_below_substring(syn in "[a-z]{4,8}") {
            let field = FieldDescriptor::new("target_field", "Target", FieldKind::Text)
                .synonyms(&[syn.as_str()]);
            let rule = match_rule(&syn, &field).unwrap();
            prop_assert!(rule.confidence() >= CONFIDENCE_SUBSTRING);
        }
    }
}
