//! Execution boundary between the optimizer and the relational engine.
//!
//! The engine receives a fully specified [`QuerySet`](super::QuerySet) and
//! materializes [`Row`]s. How directives become SQL (or anything else) is
//! entirely the engine's business; the optimizer only relies on the
//! contracts documented on [`Executor`].

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::DatabaseError;
use crate::query::QuerySet;

/// A materialized row returned by an [`Executor`].
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Table the row came from.
    pub table: String,
    /// Projected scalar columns, always including the primary key.
    pub columns: IndexMap<String, Value>,
    /// Joined to-one rows, keyed by relation accessor. `None` records a
    /// null foreign key.
    pub related: IndexMap<String, Option<Box<Row>>>,
    /// Prefetched to-many rows attached by the plan executor.
    pub prefetched: IndexMap<String, Vec<Row>>,
    /// Computed annotations, including the per-partition count alias.
    pub annotations: IndexMap<String, Value>,
    /// Parent key this row belongs to when fetched through a prefetch bind.
    pub partition_key: Option<Value>,
}

impl Row {
    pub fn new(table: impl Into<String>) -> Row {
        Row {
            table: table.into(),
            ..Row::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// The primary key value under the given column name.
    pub fn pk(&self, pk_column: &str) -> Option<&Value> {
        self.columns.get(pk_column)
    }
}

/// The relational engine abstraction.
///
/// Contracts the optimizer depends on:
/// - `fetch` applies directives in this order: prefetch bind, filters,
///   annotations and aliases, window, ordering, slice, projection.
///   Prefetch descriptors on the queryset are NOT the engine's concern; the
///   plan executor issues those itself as separate `fetch` calls.
/// - When a prefetch bind is present, every returned row carries the parent
///   key it belongs to in [`Row::partition_key`].
/// - `count` counts the filtered universe, ignoring any slice directive.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn fetch(&self, queryset: &QuerySet) -> Result<Vec<Row>, DatabaseError>;

    async fn count(&self, queryset: &QuerySet) -> Result<u64, DatabaseError>;
}
