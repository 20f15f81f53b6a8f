//! Selection compilation and the public entry points.
//!
//! [`OptimizationCompiler`] walks the normalized selection tree, classifying
//! every field against the registered schema and accumulating an optimizer
//! tree. [`optimize`] and [`optimize_single`] wrap the walk with filter-info
//! extraction, top-level ordering, error policy and the per-operation query
//! cache.

use std::sync::Arc;

use async_graphql::Variables;
use async_graphql::parser::types::ExecutableDocument;
use serde_json::Value as JsonValue;

use crate::cache::{self, QueryCache, QueryCacheHandle};
use crate::error::OptimizerError;
use crate::filters::get_filter_info;
use crate::optimizer::QueryOptimizer;
use crate::query::{Executor, Lookup, QuerySet, Row};
use crate::schema::{
    FieldKind, GenericRelation, ModelField, ModelId, ModelSchema, ObjectTypeMeta, RelationKind,
};
use crate::selection::{SelectionField, resolve_root};

/// Everything the optimizer needs to know about the resolved GraphQL field:
/// the parsed operation, its variables, the schema registry and the
/// operation-scoped query cache.
pub struct OptimizeInfo {
    schema: Arc<ModelSchema>,
    document: ExecutableDocument,
    operation_name: Option<String>,
    field_name: String,
    variables: Variables,
    cache: QueryCacheHandle,
}

impl OptimizeInfo {
    pub fn new(
        schema: Arc<ModelSchema>,
        document: ExecutableDocument,
        field_name: impl Into<String>,
    ) -> OptimizeInfo {
        OptimizeInfo {
            schema,
            document,
            operation_name: None,
            field_name: field_name.into(),
            variables: Variables::default(),
            cache: QueryCache::handle(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Share a cache across the root fields of one operation.
    pub fn with_cache(mut self, cache: QueryCacheHandle) -> Self {
        self.cache = cache;
        self
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The per-operation query cache.
    pub fn operation_cache(&self) -> &QueryCacheHandle {
        &self.cache
    }

    pub(crate) fn root_selection(&self) -> Result<SelectionField, OptimizerError> {
        resolve_root(
            &self.document,
            self.operation_name.as_deref(),
            &self.field_name,
            &self.variables,
        )
    }
}

/// Walks a selection tree into a [`QueryOptimizer`], guarding relation
/// descent against the complexity budget.
pub struct OptimizationCompiler<'a> {
    info: &'a OptimizeInfo,
    max_complexity: Option<usize>,
    budget: usize,
    complexity: usize,
}

impl<'a> OptimizationCompiler<'a> {
    pub fn new(info: &'a OptimizeInfo, max_complexity: Option<usize>) -> OptimizationCompiler<'a> {
        OptimizationCompiler {
            info,
            max_complexity,
            budget: info.schema.settings().max_complexity,
            complexity: 0,
        }
    }

    /// Compile optimizations for the given queryset, or `None` when the
    /// queryset is already marked optimized.
    pub fn compile(&mut self, queryset: &QuerySet) -> Result<Option<QueryOptimizer>, OptimizerError> {
        if queryset.is_optimized() {
            tracing::debug!(
                model = %queryset.model().name,
                "queryset already optimized, skipping"
            );
            return Ok(None);
        }

        let schema = self.info.schema.clone();
        let model = queryset.model_id();
        let object_type = schema.object_type_for_model(model).ok_or_else(|| {
            OptimizerError::SchemaMismatch {
                field: self.info.field_name.clone(),
                object_type: schema.model(model).name.clone(),
            }
        })?;

        let root = self.info.root_selection()?;
        let (selections, total_count) = if root.is_connection {
            (
                root.connection_children().unwrap_or_default(),
                root.selects_total_count(),
            )
        } else {
            (root.children.as_slice(), false)
        };

        let mut optimizer = self.compile_selections(model, object_type, selections)?;
        optimizer.total_count |= total_count;
        Ok(Some(optimizer))
    }

    /// Walk a selection list against an object type. Also the entry point
    /// for union member compilation, where the caller has already narrowed
    /// the selections.
    pub(crate) fn compile_selections(
        &mut self,
        model: ModelId,
        object_type: &ObjectTypeMeta,
        selections: &[SelectionField],
    ) -> Result<QueryOptimizer, OptimizerError> {
        self.budget = self
            .max_complexity
            .or(object_type.max_complexity)
            .unwrap_or(self.info.schema.settings().max_complexity);
        let mut optimizer = QueryOptimizer::new(model);
        self.walk_selections(&mut optimizer, object_type, selections)?;
        Ok(optimizer)
    }

    fn walk_selections(
        &mut self,
        optimizer: &mut QueryOptimizer,
        object_type: &ObjectTypeMeta,
        selections: &[SelectionField],
    ) -> Result<(), OptimizerError> {
        for selection in selections {
            self.walk_selection(optimizer, object_type, selection)?;
        }
        Ok(())
    }

    fn walk_selection(
        &mut self,
        optimizer: &mut QueryOptimizer,
        object_type: &ObjectTypeMeta,
        selection: &SelectionField,
    ) -> Result<(), OptimizerError> {
        let kind = object_type.fields.get(&selection.name).ok_or_else(|| {
            OptimizerError::SchemaMismatch {
                field: selection.name.clone(),
                object_type: object_type.name.clone(),
            }
        })?;

        match kind {
            FieldKind::Column { column } => {
                optimizer.only_fields.insert(column.clone());
            }
            FieldKind::Relation { field } => {
                let field = field.clone();
                self.walk_relation(optimizer, object_type, selection, &field, None)?;
            }
            FieldKind::TotalCount => {
                optimizer.total_count = true;
            }
            FieldKind::Named { field_name } => {
                let field_name = field_name.clone();
                let schema = self.info.schema.clone();
                match schema.model(optimizer.model).field(&field_name) {
                    Some(ModelField::Column { column }) => {
                        optimizer.only_fields.insert(column.clone());
                    }
                    Some(ModelField::Relation(_)) => {
                        self.walk_relation(
                            optimizer,
                            object_type,
                            selection,
                            &field_name,
                            Some(selection.name.clone()),
                        )?;
                    }
                    None => {
                        return Err(OptimizerError::SchemaMismatch {
                            field: field_name,
                            object_type: object_type.name.clone(),
                        });
                    }
                }
            }
            FieldKind::Annotated {
                expression,
                aliases,
            } => {
                optimizer
                    .annotations
                    .insert(selection.name.clone(), expression.clone());
                optimizer.aliases.extend(aliases.clone());
            }
            FieldKind::Multi { columns } => {
                for column in columns {
                    optimizer.only_fields.insert(column.clone());
                }
            }
        }
        Ok(())
    }

    fn walk_relation(
        &mut self,
        optimizer: &mut QueryOptimizer,
        object_type: &ObjectTypeMeta,
        selection: &SelectionField,
        accessor: &str,
        to_attr: Option<String>,
    ) -> Result<(), OptimizerError> {
        let schema = self.info.schema.clone();
        let model = schema.model(optimizer.model);

        if let Some(generic) = &model.generic_relation {
            if generic.accessor == accessor {
                let generic = generic.clone();
                return self.walk_generic_relation(optimizer, &generic);
            }
        }

        let relation = model
            .relation(accessor)
            .ok_or_else(|| OptimizerError::SchemaMismatch {
                field: accessor.to_string(),
                object_type: object_type.name.clone(),
            })?
            .clone();
        self.increase_complexity()?;

        let child_type = schema
            .object_type_for_model(relation.related_model)
            .ok_or_else(|| OptimizerError::SchemaMismatch {
                field: accessor.to_string(),
                object_type: object_type.name.clone(),
            })?;

        let mut child = QueryOptimizer::new(relation.related_model);
        child.to_attr = to_attr;

        let child_selections: &[SelectionField] = if selection.is_connection {
            child.total_count = selection.selects_total_count();
            selection.connection_children().unwrap_or_default()
        } else {
            &selection.children
        };

        if relation.kind.is_to_one() {
            if let Some(fk_column) = &relation.fk_column {
                optimizer.related_fields.insert(fk_column.clone());
            }
            // The reverse one-to-one join key lives on the child.
            if relation.kind == RelationKind::OneToOneReverse {
                if let Some(related_fk) = &relation.related_fk_column {
                    child.related_fields.insert(related_fk.clone());
                }
            }
            self.walk_selections(&mut child, child_type, child_selections)?;
            optimizer.add_select_child(accessor, child);
        } else {
            if relation.kind == RelationKind::OneToMany {
                if let Some(related_fk) = &relation.related_fk_column {
                    child.related_fields.insert(related_fk.clone());
                }
            }
            self.walk_selections(&mut child, child_type, child_selections)?;
            optimizer.add_prefetch_child(accessor, child);
        }
        Ok(())
    }

    /// Selecting a generic accessor joins the content-type row and projects
    /// the object-id column; the polymorphic target itself is resolved by
    /// the host.
    fn walk_generic_relation(
        &mut self,
        optimizer: &mut QueryOptimizer,
        generic: &GenericRelation,
    ) -> Result<(), OptimizerError> {
        optimizer.related_fields.insert(generic.fk_column.clone());
        if let Some(ct_model) = self.info.schema.content_type_model() {
            self.increase_complexity()?;
            optimizer.add_select_child(generic.ct_accessor.clone(), QueryOptimizer::new(ct_model));
        }
        Ok(())
    }

    fn increase_complexity(&mut self) -> Result<(), OptimizerError> {
        self.complexity += 1;
        if self.complexity > self.budget {
            return Err(OptimizerError::ComplexityExceeded {
                complexity: self.complexity,
                max_complexity: self.budget,
            });
        }
        Ok(())
    }
}

/// Optimize a queryset according to the field selections in `info`.
///
/// Returns the queryset unchanged when it is already marked optimized. With
/// `skip_optimization_on_error` enabled, schema mismatches and internal
/// errors fall back to the unoptimized queryset; complexity, pagination and
/// filter validation errors always surface.
pub fn optimize(
    queryset: QuerySet,
    info: &OptimizeInfo,
    max_complexity: Option<usize>,
) -> Result<QuerySet, OptimizerError> {
    let original = queryset.clone();
    match try_optimize(queryset, info, max_complexity) {
        Ok(optimized) => Ok(optimized),
        Err(err) if err.is_skippable() && info.schema.settings().skip_optimization_on_error => {
            tracing::warn!(error = %err, "optimization failed, returning unoptimized queryset");
            Ok(original)
        }
        Err(err) => Err(err),
    }
}

fn try_optimize(
    queryset: QuerySet,
    info: &OptimizeInfo,
    max_complexity: Option<usize>,
) -> Result<QuerySet, OptimizerError> {
    let mut compiler = OptimizationCompiler::new(info, max_complexity);
    let Some(optimizer) = compiler.compile(&queryset)? else {
        return Ok(queryset);
    };

    let schema = info.schema.clone();
    let object_type = schema
        .object_type_for_model(queryset.model_id())
        .ok_or_else(|| OptimizerError::SchemaMismatch {
            field: info.field_name.clone(),
            object_type: schema.model(queryset.model_id()).name.clone(),
        })?;
    let root = info.root_selection()?;
    let filter_info = get_filter_info(&root, object_type, &schema);

    let mut optimized = optimizer.optimize_queryset(queryset, Some(&filter_info))?;

    // Ordering goes on last so the filters applied above govern the ordered
    // universe.
    let explicit = filter_info.order_by();
    let order = if explicit.is_empty() {
        schema.model(optimized.model_id()).default_ordering.clone()
    } else {
        explicit
    };
    if !order.is_empty() {
        optimized = order_queryset(optimized, &order, &schema);
    }

    optimized.optimizer = Some(Arc::new(optimizer));
    Ok(optimized)
}

/// Optimize for a single row by primary key, consulting the per-operation
/// cache before touching the database. Top-level ordering is never applied;
/// the pk filter already pins the row.
pub async fn optimize_single(
    queryset: QuerySet,
    info: &OptimizeInfo,
    executor: &dyn Executor,
    pk: JsonValue,
    max_complexity: Option<usize>,
) -> Result<Option<Row>, OptimizerError> {
    let schema = info.schema.clone();
    let pk_column = schema.model(queryset.model_id()).primary_key.clone();
    let queryset = queryset.filter(pk_column, Lookup::Exact, pk.clone());
    let original = queryset.clone();

    match try_optimize_single(queryset, info, executor, &pk, max_complexity).await {
        Ok(row) => Ok(row),
        Err(err) if err.is_skippable() && schema.settings().skip_optimization_on_error => {
            tracing::warn!(error = %err, "optimization failed, fetching unoptimized row");
            let mut fallback = original;
            let rows = fallback.fetch(executor).await?;
            Ok(rows.into_iter().next())
        }
        Err(err) => Err(err),
    }
}

async fn try_optimize_single(
    queryset: QuerySet,
    info: &OptimizeInfo,
    executor: &dyn Executor,
    pk: &JsonValue,
    max_complexity: Option<usize>,
) -> Result<Option<Row>, OptimizerError> {
    let mut compiler = OptimizationCompiler::new(info, max_complexity);
    let Some(optimizer) = compiler.compile(&queryset)? else {
        let mut queryset = queryset;
        let rows = queryset.fetch(executor).await?;
        return Ok(rows.into_iter().next());
    };

    let schema = info.schema.clone();
    if let Some(hit) = cache::get_from_query_cache(info.operation_cache(), &optimizer, &schema, pk)
    {
        tracing::debug!(
            model = %schema.model(queryset.model_id()).name,
            "query cache hit"
        );
        return Ok(Some(hit));
    }

    let object_type = schema
        .object_type_for_model(queryset.model_id())
        .ok_or_else(|| OptimizerError::SchemaMismatch {
            field: info.field_name.clone(),
            object_type: schema.model(queryset.model_id()).name.clone(),
        })?;
    let root = info.root_selection()?;
    let filter_info = get_filter_info(&root, object_type, &schema);

    let mut optimized = optimizer.optimize_queryset(queryset, Some(&filter_info))?;
    let rows = optimized.fetch(executor).await?;
    cache::store_in_query_cache(info.operation_cache(), &rows, &optimizer, &schema);
    Ok(rows.into_iter().next())
}

/// Apply top-level ordering, de-duplicating when an order path joins across
/// a to-many relation.
fn order_queryset(queryset: QuerySet, order: &[String], schema: &Arc<ModelSchema>) -> QuerySet {
    let model = queryset.model_id();
    let needs_distinct = order
        .iter()
        .any(|name| orders_across_to_many(name, model, schema));
    let mut queryset = queryset.order_by(order.iter().cloned());
    if needs_distinct {
        queryset = queryset.distinct();
    }
    queryset
}

fn orders_across_to_many(name: &str, model: ModelId, schema: &ModelSchema) -> bool {
    let path = name.trim_start_matches('-');
    let segments: Vec<&str> = path.split("__").collect();
    let mut current = model;
    for segment in &segments[..segments.len().saturating_sub(1)] {
        match schema.model(current).relation(segment) {
            Some(relation) if relation.kind.is_to_many() => return true,
            Some(relation) => current = relation.related_model,
            None => return false,
        }
    }
    false
}
