//! The abstract relational query builder.
//!
//! [`QuerySet`] accumulates the directives the plan compiler emits
//! (projection, joins, prefetches, annotations, windows, ordering, slicing)
//! and hands them to an [`Executor`] for materialization. It also acts as
//! the plan executor: prefetch descriptors are issued as separate fetches
//! keyed by the parent rows' primary keys and stitched back onto the
//! parents, which is what keeps to-many relations at one query each.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::OptimizerError;
use crate::optimizer::QueryOptimizer;
use crate::query::executor::{Executor, Row};
use crate::query::expr::{Expr, PartitionWindow};
use crate::schema::{ModelId, ModelMeta, ModelSchema};

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
}

/// One conjunctive filter condition. `path` may traverse relations with
/// `__` separators (`"building__name"`).
#[derive(Debug, Clone)]
pub struct Predicate {
    pub path: String,
    pub lookup: Lookup,
    pub value: Value,
}

/// A to-many relation fetched as a secondary query keyed by parent ids.
#[derive(Debug, Clone)]
pub struct Prefetch {
    /// Relation accessor, possibly dotted through to-one joins
    /// (`"building__apartments"`).
    pub accessor: String,
    pub queryset: QuerySet,
    /// Attribute the results attach under when a custom-named field drove
    /// the prefetch.
    pub to_attr: Option<String>,
}

impl Prefetch {
    pub fn new(accessor: impl Into<String>, queryset: QuerySet) -> Prefetch {
        Prefetch {
            accessor: accessor.into(),
            queryset,
            to_attr: None,
        }
    }

    /// Re-root the accessor under a parent join path.
    pub fn add_prefix(&mut self, prefix: &str) {
        self.accessor = format!("{prefix}__{}", self.accessor);
    }
}

/// Parent-key binding for a prefetch fetch.
#[derive(Debug, Clone)]
pub struct PrefetchBind {
    pub parent_model: ModelId,
    /// Relation accessor on the parent model.
    pub accessor: String,
    pub parent_keys: Vec<Value>,
}

/// Directive accumulator for one model query.
#[derive(Clone)]
pub struct QuerySet {
    schema: Arc<ModelSchema>,
    model: ModelId,
    filters: Vec<Predicate>,
    only: Vec<String>,
    joins: Vec<String>,
    prefetches: Vec<Prefetch>,
    annotations: IndexMap<String, Expr>,
    aliases: IndexMap<String, Expr>,
    ordering: Vec<String>,
    slice: Option<(u64, u64)>,
    distinct: bool,
    window: Option<PartitionWindow>,
    prefetch_bind: Option<PrefetchBind>,
    hints: HashMap<String, bool>,
    result_cache: Option<Vec<Row>>,
    pub(crate) optimizer: Option<Arc<QueryOptimizer>>,
}

impl QuerySet {
    /// An unrestricted queryset over all rows of a model.
    pub fn all(schema: Arc<ModelSchema>, model: ModelId) -> QuerySet {
        QuerySet {
            schema,
            model,
            filters: Vec::new(),
            only: Vec::new(),
            joins: Vec::new(),
            prefetches: Vec::new(),
            annotations: IndexMap::new(),
            aliases: IndexMap::new(),
            ordering: Vec::new(),
            slice: None,
            distinct: false,
            window: None,
            prefetch_bind: None,
            hints: HashMap::new(),
            result_cache: None,
            optimizer: None,
        }
    }

    // ------------------------------------------------------------------
    // Directive builders
    // ------------------------------------------------------------------

    pub fn filter(mut self, path: impl Into<String>, lookup: Lookup, value: Value) -> Self {
        self.filters.push(Predicate {
            path: path.into(),
            lookup,
            value,
        });
        self
    }

    pub fn only<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.only.contains(&column) {
                self.only.push(column);
            }
        }
        self
    }

    pub fn select_related<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if !self.joins.contains(&path) {
                self.joins.push(path);
            }
        }
        self
    }

    pub fn prefetch_related(mut self, prefetch: Prefetch) -> Self {
        self.prefetches.push(prefetch);
        self
    }

    /// Computed column materialized onto fetched rows.
    pub fn annotate(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.annotations.insert(name.into(), expr);
        self
    }

    /// Named expression usable inside the query without being selected.
    pub fn alias(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.aliases.insert(name.into(), expr);
        self
    }

    /// Replace the ordering. `-` prefixes mean descending.
    pub fn order_by<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = names.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the `[start, stop)` row range of the ordered result.
    pub fn slice(mut self, start: u64, stop: u64) -> Self {
        self.slice = Some((start, stop));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn window(mut self, window: PartitionWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub(crate) fn bind_prefetch(&mut self, bind: PrefetchBind) {
        self.prefetch_bind = Some(bind);
    }

    // ------------------------------------------------------------------
    // Optimizer marker
    // ------------------------------------------------------------------

    /// Mark this queryset as optimized so re-entry short-circuits.
    pub fn mark_optimized(&mut self) {
        let mark = self.schema.settings().optimizer_mark.clone();
        self.hints.insert(mark, true);
    }

    pub fn is_optimized(&self) -> bool {
        self.hints
            .get(&self.schema.settings().optimizer_mark)
            .copied()
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Accessors for engines
    // ------------------------------------------------------------------

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn model_id(&self) -> ModelId {
        self.model
    }

    pub fn model(&self) -> &ModelMeta {
        self.schema.model(self.model)
    }

    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    /// Projected columns; empty means all columns.
    pub fn projection(&self) -> &[String] {
        &self.only
    }

    pub fn joins(&self) -> &[String] {
        &self.joins
    }

    pub fn prefetches(&self) -> &[Prefetch] {
        &self.prefetches
    }

    pub fn annotations(&self) -> &IndexMap<String, Expr> {
        &self.annotations
    }

    pub fn aliases(&self) -> &IndexMap<String, Expr> {
        &self.aliases
    }

    pub fn ordering(&self) -> &[String] {
        &self.ordering
    }

    pub fn slice_bounds(&self) -> Option<(u64, u64)> {
        self.slice
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn partition_window(&self) -> Option<&PartitionWindow> {
        self.window.as_ref()
    }

    pub fn prefetch_bind(&self) -> Option<&PrefetchBind> {
        self.prefetch_bind.as_ref()
    }

    pub fn hints(&self) -> &HashMap<String, bool> {
        &self.hints
    }

    /// The compiled plan this queryset was optimized with, if any.
    pub fn optimizer(&self) -> Option<&Arc<QueryOptimizer>> {
        self.optimizer.as_ref()
    }

    /// Rows materialized by a previous [`fetch`](QuerySet::fetch).
    pub fn result_cache(&self) -> Option<&[Row]> {
        self.result_cache.as_deref()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Materialize this queryset, issuing the main fetch plus one fetch per
    /// prefetch descriptor (in declaration order). Results are cached;
    /// calling `fetch` again returns the cached rows without touching the
    /// engine.
    pub async fn fetch(&mut self, executor: &dyn Executor) -> Result<Vec<Row>, OptimizerError> {
        if let Some(rows) = &self.result_cache {
            return Ok(rows.clone());
        }

        tracing::debug!(
            table = %self.model().table,
            only = ?self.only,
            joins = ?self.joins,
            prefetches = self.prefetches.len(),
            "executing query plan"
        );

        let mut rows = executor.fetch(self).await?;
        let prefetches = self.prefetches.clone();
        for prefetch in &prefetches {
            attach_prefetch(&mut rows, prefetch, self.model, &self.schema, executor).await?;
        }

        self.result_cache = Some(rows.clone());
        Ok(rows)
    }

    /// Count the filtered universe, ignoring any slice.
    pub async fn count(&self, executor: &dyn Executor) -> Result<u64, OptimizerError> {
        Ok(executor.count(self).await?)
    }
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model().name)
            .field("filters", &self.filters)
            .field("only", &self.only)
            .field("joins", &self.joins)
            .field("prefetches", &self.prefetches)
            .field("annotations", &self.annotations)
            .field("ordering", &self.ordering)
            .field("slice", &self.slice)
            .field("distinct", &self.distinct)
            .field("window", &self.window)
            .field("prefetch_bind", &self.prefetch_bind)
            .finish_non_exhaustive()
    }
}

/// Fetch one prefetch descriptor for the given parent rows and attach the
/// grouped children. Boxed because prefetch children recurse through
/// [`QuerySet::fetch`].
fn attach_prefetch<'a>(
    rows: &'a mut [Row],
    prefetch: &'a Prefetch,
    parent_model: ModelId,
    schema: &'a Arc<ModelSchema>,
    executor: &'a dyn Executor,
) -> Pin<Box<dyn Future<Output = Result<(), OptimizerError>> + Send + 'a>> {
    Box::pin(async move {
        let segments: Vec<&str> = prefetch.accessor.split("__").collect();
        let (prefix, accessor) = segments.split_at(segments.len() - 1);
        let accessor = accessor[0];

        let target_model = schema
            .resolve_path_model(parent_model, prefix)
            .ok_or_else(|| {
                OptimizerError::Internal(format!(
                    "cannot resolve prefetch path '{}' from model '{}'",
                    prefetch.accessor,
                    schema.model(parent_model).name
                ))
            })?;
        let pk_column = schema.model(target_model).primary_key.clone();

        let targets = rows_at_path(rows, prefix);
        let mut parent_keys: Vec<Value> = Vec::new();
        for target in &targets {
            if let Some(pk) = target.pk(&pk_column) {
                if !parent_keys.contains(pk) {
                    parent_keys.push(pk.clone());
                }
            }
        }
        if parent_keys.is_empty() {
            return Ok(());
        }

        let mut child_queryset = prefetch.queryset.clone();
        child_queryset.bind_prefetch(PrefetchBind {
            parent_model: target_model,
            accessor: accessor.to_string(),
            parent_keys,
        });
        let child_rows = child_queryset.fetch(executor).await?;

        // Group children by the parent key the engine reported.
        let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
        for row in child_rows {
            let Some(key) = row.partition_key.clone() else {
                return Err(OptimizerError::Internal(format!(
                    "engine returned a prefetch row for '{}' without a partition key",
                    prefetch.accessor
                )));
            };
            grouped.entry(key.to_string()).or_default().push(row);
        }

        let attr = prefetch.to_attr.clone().unwrap_or_else(|| accessor.to_string());
        for target in targets {
            let children = target
                .pk(&pk_column)
                .map(|pk| grouped.get(&pk.to_string()).cloned().unwrap_or_default())
                .unwrap_or_default();
            target.prefetched.insert(attr.clone(), children);
        }
        Ok(())
    })
}

/// Mutable references to the rows sitting at the end of a to-one join path.
fn rows_at_path<'a>(rows: &'a mut [Row], path: &[&str]) -> Vec<&'a mut Row> {
    if path.is_empty() {
        return rows.iter_mut().collect();
    }
    let mut out = Vec::new();
    for row in rows {
        if let Some(Some(child)) = row.related.get_mut(path[0]) {
            out.extend(rows_at_path(std::slice::from_mut(child.as_mut()), &path[1..]));
        }
    }
    out
}
