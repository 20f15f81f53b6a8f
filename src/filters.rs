//! Filter metadata extraction and the filterset layer.
//!
//! [`get_filter_info`] runs over the normalized selection tree and records,
//! per relation, the arguments that will narrow, order or paginate the
//! matching queryset. The plan compiler consumes this tree alongside the
//! optimizer tree so filtering stays aligned with the selections that
//! produced it.

use std::sync::Arc;

use async_graphql::Value;
use indexmap::IndexMap;

use crate::error::OptimizerError;
use crate::pagination::PaginationInput;
use crate::query::{Lookup, QuerySet};
use crate::schema::{FieldKind, ModelSchema, ObjectTypeMeta};
use crate::selection::{SelectionField, to_snake_case};

/// Argument names claimed by pagination and ordering; never passed to a
/// filterset.
pub(crate) const RESERVED_ARGS: &[&str] =
    &["first", "last", "offset", "after", "before", "order_by"];

/// Per-selection filter metadata.
#[derive(Clone)]
pub struct FilterInfo {
    /// Snake-cased selection name.
    pub name: String,
    /// Arguments captured verbatim, including pagination and `order_by`.
    pub filters: IndexMap<String, Value>,
    /// Child filter info keyed by relation accessor.
    pub children: IndexMap<String, FilterInfo>,
    pub filterset: Option<Arc<dyn FilterSet>>,
    pub is_connection: bool,
    pub is_node: bool,
}

impl FilterInfo {
    /// Child info for a relation accessor.
    pub fn child(&self, accessor: &str) -> Option<&FilterInfo> {
        self.children.get(accessor)
    }

    /// Normalized `order_by` names: comma-separated strings or lists,
    /// camelCase converted, `-` prefixes preserved.
    pub fn order_by(&self) -> Vec<String> {
        let raw: Vec<String> = match self.filters.get("order_by") {
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        raw.iter().map(|name| normalize_order_name(name)).collect()
    }

    /// Pagination arguments captured on this selection.
    pub fn pagination(&self) -> PaginationInput {
        PaginationInput::from_filters(&self.filters)
    }

    /// Arguments destined for the filterset: pagination and ordering keys
    /// are stripped, and so is the `id` of a single-node lookup.
    pub fn filter_arguments(&self) -> IndexMap<String, Value> {
        self.filters
            .iter()
            .filter(|(name, _)| {
                !RESERVED_ARGS.contains(&name.as_str()) && !(self.is_node && name.as_str() == "id")
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Whether this node carries nothing worth keeping in the tree.
    pub(crate) fn is_prunable(&self) -> bool {
        self.filters.is_empty() && !self.is_connection && self.children.is_empty()
    }
}

fn normalize_order_name(name: &str) -> String {
    match name.strip_prefix('-') {
        Some(rest) => format!("-{}", to_snake_case(rest)),
        None => to_snake_case(name),
    }
}

/// Build the filter-info tree for a resolved selection.
pub(crate) fn get_filter_info(
    selection: &SelectionField,
    object_type: &ObjectTypeMeta,
    schema: &ModelSchema,
) -> FilterInfo {
    let filterset = object_type
        .filterset
        .clone()
        .or_else(|| schema.settings().default_filterset.clone());

    let mut info = FilterInfo {
        name: selection.name.clone(),
        filters: selection.arguments.clone(),
        children: IndexMap::new(),
        filterset,
        is_connection: selection.is_connection,
        is_node: !selection.is_connection && selection.arguments.contains_key("id"),
    };

    let children: &[SelectionField] = if selection.is_connection {
        selection.connection_children().unwrap_or(&[])
    } else {
        &selection.children
    };

    let Some(model) = object_type.model_id() else {
        return info;
    };
    let model_meta = schema.model(model);

    for child in children {
        let accessor = match object_type.fields.get(&child.name) {
            Some(FieldKind::Relation { field }) => field,
            Some(FieldKind::Named { field_name }) => field_name,
            _ => continue,
        };
        let Some(relation) = model_meta.relation(accessor) else {
            continue;
        };
        let Some(child_type) = schema.object_type_for_model(relation.related_model) else {
            continue;
        };
        let child_info = get_filter_info(child, child_type, schema);
        if !child_info.is_prunable() {
            info.children.insert(accessor.clone(), child_info);
        }
    }

    info
}

/// Applies captured GraphQL arguments to a queryset.
///
/// Implementations validate their inputs; failures surface as
/// [`OptimizerError::FilterValidation`].
pub trait FilterSet: Send + Sync {
    fn apply(
        &self,
        queryset: QuerySet,
        args: &IndexMap<String, Value>,
    ) -> Result<QuerySet, OptimizerError>;
}

/// Declarative filterset mapping exposed argument names to column lookups.
#[derive(Default)]
pub struct ArgumentFilterSet {
    lookups: IndexMap<String, (String, Lookup)>,
}

impl ArgumentFilterSet {
    pub fn new() -> ArgumentFilterSet {
        ArgumentFilterSet::default()
    }

    /// Expose `name` as a filter argument translating to `path lookup value`.
    pub fn arg(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        lookup: Lookup,
    ) -> Self {
        self.lookups.insert(name.into(), (path.into(), lookup));
        self
    }

    /// Shorthand for an exact-match argument filtering its own column.
    pub fn exact(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = name.clone();
        self.arg(name, path, Lookup::Exact)
    }
}

impl FilterSet for ArgumentFilterSet {
    fn apply(
        &self,
        mut queryset: QuerySet,
        args: &IndexMap<String, Value>,
    ) -> Result<QuerySet, OptimizerError> {
        for (name, value) in args {
            if RESERVED_ARGS.contains(&name.as_str()) {
                continue;
            }
            let Some((path, lookup)) = self.lookups.get(name) else {
                return Err(OptimizerError::FilterValidation(format!(
                    "unknown filter argument '{name}'"
                )));
            };
            if matches!(value, Value::Null) {
                continue;
            }
            let json = value.clone().into_json().map_err(|err| {
                OptimizerError::FilterValidation(format!(
                    "argument '{name}' is not a filterable value: {err}"
                ))
            })?;
            queryset = queryset.filter(path.clone(), *lookup, json);
        }
        Ok(queryset)
    }
}
