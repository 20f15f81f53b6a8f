//! Per-operation query cache and plan fingerprints.
//!
//! Rows fetched while resolving one GraphQL operation are stored under
//! `(table, plan key, primary key)` so that resolving the same node again,
//! typically through `optimize_single`, never re-plans or re-fetches. The
//! plan key is a canonicalized fingerprint of the optimizer tree: two
//! selections producing the same plan shape share cache slots regardless of
//! the order fields appeared in the document.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::optimizer::QueryOptimizer;
use crate::query::Row;
use crate::schema::ModelSchema;

/// Shared handle to one operation's cache.
pub type QueryCacheHandle = Arc<Mutex<QueryCache>>;

/// `table -> plan key -> primary key -> row`, scoped to a single operation.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<String, HashMap<String, HashMap<String, Row>>>,
}

impl QueryCache {
    pub fn new() -> QueryCache {
        QueryCache::default()
    }

    pub fn handle() -> QueryCacheHandle {
        Arc::new(Mutex::new(QueryCache::new()))
    }

    pub fn get(&self, table: &str, plan_key: &str, pk: &Value) -> Option<Row> {
        self.entries
            .get(table)?
            .get(plan_key)?
            .get(&pk.to_string())
            .cloned()
    }

    pub fn insert(&mut self, table: &str, plan_key: &str, pk: &Value, row: Row) {
        self.entries
            .entry(table.to_string())
            .or_default()
            .entry(plan_key.to_string())
            .or_default()
            .insert(pk.to_string(), row);
    }

    /// Total number of cached rows across all tables and plans.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(HashMap::values)
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable fingerprint of an optimizer tree's plan shape.
pub fn plan_key(optimizer: &QueryOptimizer, schema: &ModelSchema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_plan(optimizer, schema));
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

/// Canonical plan description: sorted projections, sorted annotation tokens,
/// sorted relation edges with recursive child plans. Selection order in the
/// source document must not change this string.
fn canonical_plan(optimizer: &QueryOptimizer, schema: &ModelSchema) -> String {
    let model = schema.model(optimizer.model);

    let mut columns: Vec<&str> = optimizer
        .only_fields
        .iter()
        .chain(optimizer.related_fields.iter())
        .map(String::as_str)
        .collect();
    columns.sort_unstable();
    columns.dedup();

    let mut annotations: Vec<String> = optimizer
        .annotations
        .iter()
        .map(|(alias, expr)| format!("{alias}={}", expr.fingerprint_token()))
        .collect();
    annotations.sort_unstable();

    let mut relations: Vec<String> = optimizer
        .select_related
        .iter()
        .map(|(accessor, child)| format!("j:{accessor}:{}", canonical_plan(child, schema)))
        .chain(
            optimizer
                .prefetch_related
                .iter()
                .map(|(accessor, child)| format!("p:{accessor}:{}", canonical_plan(child, schema))),
        )
        .collect();
    relations.sort_unstable();

    format!(
        "{}|{}|{}|{}",
        model.table,
        columns.join(","),
        annotations.join(","),
        relations.join(";")
    )
}

/// Store fetched rows, and recursively their joined and prefetched
/// children, under their optimizers' plan keys.
pub fn store_in_query_cache(
    cache: &QueryCacheHandle,
    rows: &[Row],
    optimizer: &QueryOptimizer,
    schema: &ModelSchema,
) {
    let mut guard = cache.lock();
    store_rows(&mut guard, rows, optimizer, schema);
}

fn store_rows(cache: &mut QueryCache, rows: &[Row], optimizer: &QueryOptimizer, schema: &ModelSchema) {
    let model = schema.model(optimizer.model);
    let key = plan_key(optimizer, schema);

    for row in rows {
        if let Some(pk) = row.pk(&model.primary_key) {
            cache.insert(&model.table, &key, pk, row.clone());
        }
        for (accessor, child) in &optimizer.select_related {
            if let Some(Some(related)) = row.related.get(accessor) {
                store_rows(cache, std::slice::from_ref(related.as_ref()), child, schema);
            }
        }
        for (accessor, child) in &optimizer.prefetch_related {
            let attr = child.to_attr.as_deref().unwrap_or(accessor);
            if let Some(children) = row.prefetched.get(attr) {
                store_rows(cache, children, child, schema);
            }
        }
    }
}

/// Look up a previously fetched row for this plan shape.
pub fn get_from_query_cache(
    cache: &QueryCacheHandle,
    optimizer: &QueryOptimizer,
    schema: &ModelSchema,
    pk: &Value,
) -> Option<Row> {
    let model = schema.model(optimizer.model);
    let key = plan_key(optimizer, schema);
    cache.lock().get(&model.table, &key, pk)
}
