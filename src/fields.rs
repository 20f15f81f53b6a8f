//! Resolver helpers built on the entry API.
//!
//! These are the glue a GraphQL field layer calls into: list fields,
//! Relay connection fields, single-node lookups and union lists. The
//! GraphQL server types themselves (field definitions, wrappers) stay on
//! the host's side.

use crate::cache;
use crate::compile::{OptimizationCompiler, OptimizeInfo, optimize, optimize_single};
use crate::error::OptimizerError;
use crate::filters::get_filter_info;
use crate::pagination::{
    Connection, PaginationArgs, PaginationInput, partition_count_from_rows, queryset_slice,
};
use crate::query::{Executor, QuerySet, Row};
use crate::selection::SelectionField;

/// Resolve a plain list field: optimize, fetch, cache.
pub async fn resolve_list(
    queryset: QuerySet,
    info: &OptimizeInfo,
    executor: &dyn Executor,
) -> Result<Vec<Row>, OptimizerError> {
    let mut optimized = optimize(queryset, info, None)?;
    let rows = optimized.fetch(executor).await?;
    if let Some(optimizer) = optimized.optimizer() {
        cache::store_in_query_cache(info.operation_cache(), &rows, optimizer, info.schema());
    }
    Ok(rows)
}

/// Resolve a single node by primary key through the per-operation cache.
pub async fn resolve_node(
    queryset: QuerySet,
    info: &OptimizeInfo,
    executor: &dyn Executor,
    pk: serde_json::Value,
) -> Result<Option<Row>, OptimizerError> {
    optimize_single(queryset, info, executor, pk, None).await
}

/// Resolve a Relay connection field.
///
/// Pagination arguments come from the resolved root field; `max_limit`
/// overrides the configured connection limit for this field. The filtered
/// universe is counted after optimization, the Relay slice applied, and the
/// page wrapped in a [`Connection`] with offset cursors.
///
/// An already-optimized queryset (a nested connection materialized by a
/// prefetch) is not re-counted or re-sliced: its rows are pre-windowed and
/// carry the partition count annotation.
pub async fn resolve_connection(
    queryset: QuerySet,
    info: &OptimizeInfo,
    executor: &dyn Executor,
    max_limit: Option<u64>,
) -> Result<Connection<Row>, OptimizerError> {
    let settings = info.schema().settings();
    let root = info.root_selection()?;
    let input = PaginationInput::from_filters(&root.arguments);
    let args = PaginationArgs::validate(&input, max_limit.or(settings.connection_max_limit))?;

    let already_optimized = queryset.is_optimized();
    let mut optimized = optimize(queryset, info, None)?;

    let size = if already_optimized {
        let rows = optimized.result_cache().unwrap_or_default();
        partition_count_from_rows(rows, &settings.prefetch_count_key)
    } else {
        optimized.count(executor).await?
    };

    let (start, stop) = queryset_slice(&args, size);
    if !already_optimized {
        if start == stop {
            return Ok(Connection::from_items(Vec::new(), start, size));
        }
        optimized = optimized.slice(start, stop);
    }

    let rows = optimized.fetch(executor).await?;
    if let Some(optimizer) = optimized.optimizer() {
        cache::store_in_query_cache(info.operation_cache(), &rows, optimizer, info.schema());
    }

    debug_assert!(rows.len() as u64 <= stop.saturating_sub(start));
    Ok(Connection::from_items(rows, start, size))
}

/// A row resolved as a member of a GraphQL union.
#[derive(Debug, Clone)]
pub struct UnionMember {
    /// Object type name the row belongs to.
    pub type_name: String,
    pub row: Row,
}

/// Resolve a union list field: one optimized query per concrete member
/// selected through inline fragments, each with its own prefetches.
pub async fn resolve_union_list(
    info: &OptimizeInfo,
    executor: &dyn Executor,
    union_type: &str,
) -> Result<Vec<UnionMember>, OptimizerError> {
    let schema = info.schema().clone();
    let union_meta = schema
        .object_type(union_type)
        .ok_or_else(|| OptimizerError::SchemaMismatch {
            field: info.field_name().to_string(),
            object_type: union_type.to_string(),
        })?;
    let members = union_meta
        .union_members()
        .ok_or_else(|| OptimizerError::SchemaMismatch {
            field: info.field_name().to_string(),
            object_type: union_type.to_string(),
        })?;

    let root = info.root_selection()?;
    let mut results = Vec::new();

    for member_name in members {
        let selections: Vec<SelectionField> = root
            .children
            .iter()
            .filter(|child| child.concrete_type.as_deref() == Some(member_name))
            .cloned()
            .collect();
        if selections.is_empty() {
            continue;
        }

        let member_type =
            schema
                .object_type(member_name)
                .ok_or_else(|| OptimizerError::SchemaMismatch {
                    field: member_name.clone(),
                    object_type: union_type.to_string(),
                })?;
        let model = member_type
            .model_id()
            .ok_or_else(|| OptimizerError::SchemaMismatch {
                field: member_name.clone(),
                object_type: union_type.to_string(),
            })?;

        let mut compiler = OptimizationCompiler::new(info, None);
        let optimizer = compiler.compile_selections(model, member_type, &selections)?;

        // Narrowed view of the root selection for filter extraction.
        let narrowed = SelectionField {
            name: root.name.clone(),
            arguments: root.arguments.clone(),
            children: selections,
            is_connection: false,
            concrete_type: Some(member_name.clone()),
        };
        let filter_info = get_filter_info(&narrowed, member_type, &schema);

        let mut queryset =
            optimizer.optimize_queryset(QuerySet::all(schema.clone(), model), Some(&filter_info))?;
        let default_order = schema.model(model).default_ordering.clone();
        if !default_order.is_empty() {
            queryset = queryset.order_by(default_order);
        }

        let rows = queryset.fetch(executor).await?;
        cache::store_in_query_cache(info.operation_cache(), &rows, &optimizer, &schema);
        results.extend(rows.into_iter().map(|row| UnionMember {
            type_name: member_name.clone(),
            row,
        }));
    }

    Ok(results)
}
