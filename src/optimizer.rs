//! The per-model optimizer tree and plan compiler.
//!
//! A [`QueryOptimizer`] accumulates everything the walker learns about one
//! model's selections: columns to project, to-one relations to join, to-many
//! relations to prefetch, and computed annotations. Compiling flattens the
//! tree into queryset directives, joining child projections under dotted
//! paths and building one optimized child queryset per prefetch.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::error::OptimizerError;
use crate::filters::FilterInfo;
use crate::pagination::{PaginationArgs, partition_slice};
use crate::query::{Expr, PartitionWindow, Prefetch, QuerySet};
use crate::schema::{ModelId, ModelSchema, RelationField};

/// Mutable per-model accumulator for one request's selection walk.
#[derive(Debug, Clone)]
pub struct QueryOptimizer {
    pub model: ModelId,
    /// Scalar columns to project.
    pub only_fields: IndexSet<String>,
    /// FK columns required by child joins and inverse join keys.
    pub related_fields: IndexSet<String>,
    /// Computed columns keyed by output alias.
    pub annotations: IndexMap<String, Expr>,
    /// Helper expressions usable by annotations without being selected.
    pub aliases: IndexMap<String, Expr>,
    /// To-one children fetched by join.
    pub select_related: IndexMap<String, QueryOptimizer>,
    /// To-many children fetched by keyed secondary query.
    pub prefetch_related: IndexMap<String, QueryOptimizer>,
    /// Whether the selection asks for the connection's total count.
    pub total_count: bool,
    /// Attribute prefetch results attach under when a custom-named field
    /// drove this subtree.
    pub to_attr: Option<String>,
}

/// Flattened directives produced for one model context.
#[derive(Debug, Default, Clone)]
pub struct CompilationResults {
    pub only_fields: Vec<String>,
    pub select_related: Vec<String>,
    pub prefetch_related: Vec<Prefetch>,
}

impl QueryOptimizer {
    pub fn new(model: ModelId) -> QueryOptimizer {
        QueryOptimizer {
            model,
            only_fields: IndexSet::new(),
            related_fields: IndexSet::new(),
            annotations: IndexMap::new(),
            aliases: IndexMap::new(),
            select_related: IndexMap::new(),
            prefetch_related: IndexMap::new(),
            total_count: false,
            to_attr: None,
        }
    }

    /// Register a to-one child, merging into an existing subtree when two
    /// selection paths converge on the same accessor.
    pub fn add_select_child(&mut self, accessor: impl Into<String>, child: QueryOptimizer) {
        let accessor = accessor.into();
        if let Some(existing) = self.select_related.get_mut(&accessor) {
            existing.merge(child);
        } else if let Some(existing) = self.prefetch_related.get_mut(&accessor) {
            existing.merge(child);
        } else {
            self.select_related.insert(accessor, child);
        }
    }

    /// Register a to-many child, merging like [`add_select_child`].
    ///
    /// [`add_select_child`]: QueryOptimizer::add_select_child
    pub fn add_prefetch_child(&mut self, accessor: impl Into<String>, child: QueryOptimizer) {
        let accessor = accessor.into();
        if let Some(existing) = self.prefetch_related.get_mut(&accessor) {
            existing.merge(child);
        } else if let Some(existing) = self.select_related.get_mut(&accessor) {
            existing.merge(child);
        } else {
            self.prefetch_related.insert(accessor, child);
        }
    }

    /// Value-level union of two optimizers over the same model.
    pub fn merge(&mut self, other: QueryOptimizer) {
        debug_assert_eq!(self.model, other.model, "merging optimizers of different models");
        self.only_fields.extend(other.only_fields);
        self.related_fields.extend(other.related_fields);
        self.annotations.extend(other.annotations);
        self.aliases.extend(other.aliases);
        for (accessor, child) in other.select_related {
            self.add_select_child(accessor, child);
        }
        for (accessor, child) in other.prefetch_related {
            self.add_prefetch_child(accessor, child);
        }
        self.total_count |= other.total_count;
        if self.to_attr.is_none() {
            self.to_attr = other.to_attr;
        }
    }

    /// Whether this subtree computes row-level annotations anywhere a join
    /// would reach. Such joins must be promoted to prefetches, since a
    /// joined row has nowhere to carry its own computed columns.
    fn requires_row_annotations(&self) -> bool {
        !self.annotations.is_empty()
            || self
                .select_related
                .values()
                .any(QueryOptimizer::requires_row_annotations)
    }

    /// Flatten this node into directives, recursively compiling children.
    pub fn compile(
        &self,
        filter_info: Option<&FilterInfo>,
        schema: &Arc<ModelSchema>,
    ) -> Result<CompilationResults, OptimizerError> {
        let model = schema.model(self.model);

        let mut only_fields: Vec<String> = vec![model.primary_key.clone()];
        for column in self.only_fields.iter().chain(self.related_fields.iter()) {
            if !only_fields.contains(column) {
                only_fields.push(column.clone());
            }
        }
        let mut results = CompilationResults {
            only_fields,
            ..CompilationResults::default()
        };

        for (accessor, child) in &self.select_related {
            if child.requires_row_annotations() {
                self.compile_prefetch(accessor, child, &mut results, filter_info, schema)?;
            } else {
                self.compile_select(accessor, child, &mut results, filter_info, schema)?;
            }
        }
        for (accessor, child) in &self.prefetch_related {
            self.compile_prefetch(accessor, child, &mut results, filter_info, schema)?;
        }

        Ok(results)
    }

    fn compile_select(
        &self,
        accessor: &str,
        child: &QueryOptimizer,
        results: &mut CompilationResults,
        filter_info: Option<&FilterInfo>,
        schema: &Arc<ModelSchema>,
    ) -> Result<(), OptimizerError> {
        results.select_related.push(accessor.to_string());
        let child_filter = filter_info.and_then(|info| info.child(accessor));
        let nested = child.compile(child_filter, schema)?;

        results.only_fields.extend(
            nested
                .only_fields
                .into_iter()
                .map(|column| format!("{accessor}__{column}")),
        );
        results.select_related.extend(
            nested
                .select_related
                .into_iter()
                .map(|path| format!("{accessor}__{path}")),
        );
        for mut prefetch in nested.prefetch_related {
            prefetch.add_prefix(accessor);
            results.prefetch_related.push(prefetch);
        }
        Ok(())
    }

    fn compile_prefetch(
        &self,
        accessor: &str,
        child: &QueryOptimizer,
        results: &mut CompilationResults,
        filter_info: Option<&FilterInfo>,
        schema: &Arc<ModelSchema>,
    ) -> Result<(), OptimizerError> {
        let child_filter = filter_info.and_then(|info| info.child(accessor));
        let queryset = self.prefetch_queryset(accessor, child, child_filter, schema)?;
        let optimized = child.optimize_queryset(queryset, child_filter)?;
        results.prefetch_related.push(Prefetch {
            accessor: accessor.to_string(),
            queryset: optimized,
            to_attr: child.to_attr.clone(),
        });
        Ok(())
    }

    /// Build the base child queryset for a prefetch, windowing it per parent
    /// partition when the nested connection is paginated.
    fn prefetch_queryset(
        &self,
        accessor: &str,
        child: &QueryOptimizer,
        child_filter: Option<&FilterInfo>,
        schema: &Arc<ModelSchema>,
    ) -> Result<QuerySet, OptimizerError> {
        let settings = schema.settings();
        let mut queryset = QuerySet::all(schema.clone(), child.model);

        let explicit_order = child_filter.map(FilterInfo::order_by).unwrap_or_default();
        let order = if explicit_order.is_empty() {
            schema.model(child.model).default_ordering.clone()
        } else {
            explicit_order
        };

        let is_connection = child_filter.is_some_and(|info| info.is_connection);
        if !is_connection {
            if !order.is_empty() {
                queryset = queryset.order_by(order);
            }
            return Ok(queryset);
        }

        let pagination = child_filter
            .map(|info| info.pagination())
            .unwrap_or_default();
        let args = PaginationArgs::validate(&pagination, settings.connection_max_limit)?;

        if child.total_count {
            queryset = queryset.annotate(settings.prefetch_count_key.clone(), Expr::PartitionCount);
        }

        // No pagination argument and no configured limit: leave unwindowed.
        if args.is_unbounded() {
            if !order.is_empty() {
                queryset = queryset.order_by(order);
            }
            return Ok(queryset);
        }

        let Some(partition_by) = self
            .partition_column(accessor, schema)
        else {
            tracing::warn!(
                accessor,
                model = %schema.model(self.model).name,
                "cannot resolve partition column, skipping nested pagination"
            );
            if !order.is_empty() {
                queryset = queryset.order_by(order);
            }
            return Ok(queryset);
        };

        let window_order = if order.is_empty() {
            vec![schema.model(child.model).primary_key.clone()]
        } else {
            order
        };
        let (start, stop) = partition_slice(&args);

        queryset = queryset
            .annotate(settings.prefetch_count_key.clone(), Expr::PartitionCount)
            .window(PartitionWindow {
                partition_by,
                order_by: window_order,
                start,
                stop,
            });
        Ok(queryset)
    }

    /// Column the prefetch partitions on: the inverse FK for reverse
    /// relations, or the join-table source column for many-to-many.
    fn partition_column(&self, accessor: &str, schema: &Arc<ModelSchema>) -> Option<String> {
        let relation: &RelationField = schema.model(self.model).relation(accessor)?;
        if let Some(column) = &relation.related_fk_column {
            return Some(column.clone());
        }
        relation
            .through
            .as_ref()
            .map(|through| format!("{}.{}", through.table, through.source_column))
    }

    /// Apply this optimizer's directives to a queryset.
    pub fn optimize_queryset(
        &self,
        queryset: QuerySet,
        filter_info: Option<&FilterInfo>,
    ) -> Result<QuerySet, OptimizerError> {
        let schema = queryset.schema().clone();
        let results = self.compile(filter_info, &schema)?;
        let mut queryset = queryset;

        if let Some(object_type) = schema.object_type_for_model(self.model) {
            if let Some(hook) = &object_type.filter_queryset {
                queryset = hook(queryset);
            }
        }

        if let Some(info) = filter_info {
            if let Some(filterset) = &info.filterset {
                let args = info.filter_arguments();
                if !args.is_empty() {
                    queryset = filterset.apply(queryset, &args)?;
                }
            }
        }

        for prefetch in results.prefetch_related {
            queryset = queryset.prefetch_related(prefetch);
        }
        if !results.select_related.is_empty() {
            queryset = queryset.select_related(results.select_related.clone());
        }
        if !schema.settings().disable_only_fields_optimization {
            queryset = queryset.only(results.only_fields.clone());
        }
        for (name, expr) in &self.annotations {
            queryset = queryset.annotate(name.clone(), expr.clone());
        }
        for (name, expr) in &self.aliases {
            queryset = queryset.alias(name.clone(), expr.clone());
        }

        queryset.mark_optimized();

        tracing::debug!(
            model = %schema.model(self.model).name,
            only = ?results.only_fields,
            joins = ?results.select_related,
            prefetches = queryset.prefetches().len(),
            "optimized queryset"
        );
        Ok(queryset)
    }
}
