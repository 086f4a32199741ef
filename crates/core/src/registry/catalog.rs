//! Built-in importable entities: chart of accounts, products, partners.

use std::sync::Arc;

use super::entity::EntityDescriptor;
use super::field::{Choice, FieldDescriptor, FieldKind, SequenceGenerator};

pub const ACCOUNT: &str = "account";
pub const PRODUCT: &str = "product";
pub const PARTNER: &str = "partner";

pub fn builtin_entities() -> Vec<EntityDescriptor> {
    vec![account(), product(), partner()]
}

/// Chart-of-accounts entries, matched on `code`.
pub fn account() -> EntityDescriptor {
    EntityDescriptor::new(ACCOUNT, "Account")
        .table("accounts")
        .field(
            FieldDescriptor::new("code", "Account code", FieldKind::Text)
                .required()
                .unique()
                .max_length(32)
                .synonyms(&["codigo", "código", "account_number", "cuenta"]),
        )
        .field(
            FieldDescriptor::new("name", "Account name", FieldKind::Text)
                .required()
                .max_length(200),
        )
        .field(
            FieldDescriptor::new("account_type", "Account type", FieldKind::Text)
                .required()
                .choices(vec![
                    Choice::new("asset", "Asset"),
                    Choice::new("liability", "Liability"),
                    Choice::new("equity", "Equity"),
                    Choice::new("income", "Income"),
                    Choice::new("expense", "Expense"),
                ])
                .synonyms(&["tipo", "type", "tipo_cuenta"]),
        )
        .field(
            FieldDescriptor::new("parent_id", "Parent account", FieldKind::Reference)
                .references(ACCOUNT, "code", "id")
                .synonyms(&["parent", "parent_code", "cuenta_padre"]),
        )
        .field(
            FieldDescriptor::new("is_active", "Active", FieldKind::Boolean)
                .default_value(true),
        )
        .field(FieldDescriptor::new(
            "opening_balance",
            "Opening balance",
            FieldKind::Decimal,
        ))
        .field(FieldDescriptor::new("opened_on", "Opened on", FieldKind::Date))
        .business_key(&["code"])
        .uuid_identity("id")
        .audit_columns("created_at", "updated_at")
}

/// Sellable products, matched on `sku`.
pub fn product() -> EntityDescriptor {
    EntityDescriptor::new(PRODUCT, "Product")
        .table("products")
        .field(
            FieldDescriptor::new("sku", "SKU", FieldKind::Text)
                .required()
                .unique()
                .max_length(64)
                .synonyms(&["item_code", "codigo", "referencia"]),
        )
        .field(
            FieldDescriptor::new("name", "Product name", FieldKind::Text)
                .required()
                .max_length(200),
        )
        .field(
            FieldDescriptor::new("unit_price", "Unit price", FieldKind::Decimal)
                .range(Some(0.0), None),
        )
        .field(
            FieldDescriptor::new("quantity", "Quantity on hand", FieldKind::Integer)
                .range(Some(0.0), None)
                .default_value(0_i64),
        )
        .field(
            FieldDescriptor::new("category", "Category", FieldKind::Text).choices(vec![
                Choice::new("goods", "Goods"),
                Choice::new("service", "Service"),
                Choice::new("consumable", "Consumable"),
            ]),
        )
        .field(
            FieldDescriptor::new("is_active", "Active", FieldKind::Boolean)
                .default_value(true),
        )
        .field(FieldDescriptor::new(
            "launched_at",
            "Launched at",
            FieldKind::Datetime,
        ))
        .business_key(&["sku"])
        .uuid_identity("id")
        .audit_columns("created_at", "updated_at")
}

/// Customers and suppliers, matched on `tax_id`. The partner `code` is
/// generated when the file does not provide one.
pub fn partner() -> EntityDescriptor {
    EntityDescriptor::new(PARTNER, "Partner")
        .table("partners")
        .field(
            FieldDescriptor::new("tax_id", "Tax ID", FieldKind::Text)
                .required()
                .unique()
                .max_length(32),
        )
        .field(
            FieldDescriptor::new("code", "Partner code", FieldKind::Text)
                .required()
                .unique()
                .max_length(16)
                .generated_by(Arc::new(SequenceGenerator::new("PRT", 6, 1))),
        )
        .field(
            FieldDescriptor::new("name", "Name", FieldKind::Text)
                .required()
                .max_length(200),
        )
        .field(FieldDescriptor::new("email", "Email", FieldKind::Email).max_length(254))
        .field(FieldDescriptor::new("phone", "Phone", FieldKind::Phone).max_length(32))
        .field(
            FieldDescriptor::new("partner_type", "Partner type", FieldKind::Text)
                .choices(vec![
                    Choice::new("customer", "Customer"),
                    Choice::new("supplier", "Supplier"),
                    Choice::new("both", "Customer and supplier"),
                ])
                .default_value("customer"),
        )
        .field(
            FieldDescriptor::new("credit_limit", "Credit limit", FieldKind::Decimal)
                .range(Some(0.0), None),
        )
        .business_key(&["tax_id"])
        .uuid_identity("id")
        .audit_columns("created_at", "updated_at")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_has_a_business_key() {
        for entity in builtin_entities() {
            assert!(entity.has_business_key(), "{}", entity.name);
            for key in &entity.business_key {
                assert!(entity.get_field(key).is_some());
            }
        }
    }

    #[test]
    fn partner_code_is_generated() {
        let entity = partner();
        let code = entity.get_field("code").unwrap();
        assert!(code.required);
        assert!(code.generator.is_some());
        assert!(code.default_value.is_none());
    }

    #[test]
    fn account_parent_references_account() {
        let entity = account();
        let parent = entity.get_field("parent_id").unwrap();
        let target = parent.reference.as_ref().unwrap();
        assert_eq!(target.entity, ACCOUNT);
        assert_eq!(target.lookup_field, "code");
    }
}
