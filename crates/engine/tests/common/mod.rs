use std::sync::Arc;

use tabload_core::registry::EntityRegistry;
use tabload_core::retry::RetryPolicy;
use tabload_core::validation::ColumnMapping;
use tabload_db::{BulkStore, MemoryStore};
use tabload_engine::{ImportConfig, ImportService};

/// Build an `ImportConfig` staging files under `dir`, otherwise default.
pub fn test_config(dir: &tempfile::TempDir) -> ImportConfig {
    ImportConfig {
        staging_dir: dir.path().to_path_buf(),
        ..ImportConfig::default()
    }
}

/// The built-in account, product, and partner registry.
pub fn builtin_registry() -> EntityRegistry {
    EntityRegistry::with_builtin_catalog().expect("built-in catalog should register")
}

/// Build a service over a fresh in-memory store with retries that do not
/// sleep.
pub fn build_service(
    registry: EntityRegistry,
    config: ImportConfig,
) -> (ImportService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = build_service_on(registry, config, &store);
    (service, store)
}

/// Build a service writing to an existing in-memory store.
pub fn build_service_on(
    registry: EntityRegistry,
    config: ImportConfig,
    store: &Arc<MemoryStore>,
) -> ImportService {
    ImportService::new(
        Arc::new(registry),
        Arc::clone(store) as Arc<dyn BulkStore>,
        config,
    )
    .with_retry(RetryPolicy::without_delay(3))
}

/// Mapping from `(column, field)` pairs.
pub fn mapping(pairs: &[(&str, &str)]) -> ColumnMapping {
    pairs
        .iter()
        .map(|(column, field)| (column.to_string(), Some(field.to_string())))
        .collect()
}

/// A product CSV with `rows` rows: `sku` is `P000`, `P001`, ...
pub fn products_csv(rows: usize) -> Vec<u8> {
    let mut csv = String::from("sku,name,unit_price,quantity\n");
    for i in 0..rows {
        csv.push_str(&format!("P{i:03},Product {i},{}.50,{i}\n", i + 1));
    }
    csv.into_bytes()
}

pub fn product_mapping() -> ColumnMapping {
    mapping(&[
        ("sku", "sku"),
        ("name", "name"),
        ("unit_price", "unit_price"),
        ("quantity", "quantity"),
    ])
}
