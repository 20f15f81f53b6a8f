//! Selection normalization.
//!
//! Turns the parsed GraphQL AST into [`SelectionField`] trees: fragment
//! spreads and inline fragments are expanded in place, variables are
//! resolved to concrete values, and field/argument names are snake-cased to
//! match the model layer. The walker and the filter-info extractor both run
//! over this normalized form.

use std::collections::HashMap;

use async_graphql::parser::types::{
    ExecutableDocument, Field, FragmentDefinition, OperationDefinition, Selection,
};
use async_graphql::{Name, Positioned, Value, Variables};
use indexmap::IndexMap;

use crate::error::OptimizerError;

/// A normalized node of the GraphQL selection tree.
#[derive(Debug, Clone)]
pub struct SelectionField {
    /// Snake-cased logical field name.
    pub name: String,
    /// Arguments with variables resolved, keyed by snake-cased name.
    pub arguments: IndexMap<String, Value>,
    /// Child selections in document order, fragments expanded.
    pub children: Vec<SelectionField>,
    /// Whether the children form a Relay connection (`edges { node }`).
    pub is_connection: bool,
    /// Object type this field was narrowed to by an inline fragment or
    /// fragment spread, if any.
    pub concrete_type: Option<String>,
}

impl SelectionField {
    /// Child selection by normalized name.
    pub fn child(&self, name: &str) -> Option<&SelectionField> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The `edges { node { ... } }` sub-selections of a connection field.
    pub fn connection_children(&self) -> Option<&[SelectionField]> {
        let edges = self.child("edges")?;
        let node = edges.child("node")?;
        Some(&node.children)
    }

    /// Whether the connection wrapper selects the total-count sentinel.
    pub fn selects_total_count(&self) -> bool {
        self.is_connection && self.child("total_count").is_some()
    }
}

/// Find the named root field of an operation and normalize it.
pub(crate) fn resolve_root(
    document: &ExecutableDocument,
    operation_name: Option<&str>,
    field_name: &str,
    variables: &Variables,
) -> Result<SelectionField, OptimizerError> {
    let operation = find_operation(document, operation_name)?;
    for item in &operation.selection_set.node.items {
        if let Selection::Field(field) = &item.node {
            let name = field.node.name.node.as_str();
            if name == field_name || to_snake_case(name) == field_name {
                return normalize_field(field, &document.fragments, variables, None);
            }
        }
    }
    Err(OptimizerError::Internal(format!(
        "root field '{field_name}' not found in operation"
    )))
}

fn find_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition, OptimizerError> {
    match operation_name {
        Some(name) => document
            .operations
            .iter()
            .find(|(op_name, _)| op_name.map(Name::as_str) == Some(name))
            .map(|(_, op)| &op.node)
            .ok_or_else(|| OptimizerError::Internal(format!("operation '{name}' not found"))),
        None => document
            .operations
            .iter()
            .next()
            .map(|(_, op)| &op.node)
            .ok_or_else(|| OptimizerError::Internal("document has no operations".to_string())),
    }
}

fn normalize_field(
    field: &Positioned<Field>,
    fragments: &HashMap<Name, Positioned<FragmentDefinition>>,
    variables: &Variables,
    concrete_type: Option<String>,
) -> Result<SelectionField, OptimizerError> {
    let mut arguments = IndexMap::new();
    for (name, value) in &field.node.arguments {
        let resolved = value.node.clone().into_const_with(|var| {
            variables.get(&var).cloned().ok_or_else(|| {
                OptimizerError::Internal(format!("undefined variable '${var}' in query"))
            })
        })?;
        arguments.insert(to_snake_case(name.node.as_str()), resolved);
    }

    let children = normalize_selections(
        &field.node.selection_set.node.items,
        fragments,
        variables,
        None,
    )?;
    let is_connection = children
        .iter()
        .any(|c| c.name == "edges" && c.child("node").is_some());

    Ok(SelectionField {
        name: to_snake_case(field.node.name.node.as_str()),
        arguments,
        children,
        is_connection,
        concrete_type,
    })
}

fn normalize_selections(
    items: &[Positioned<Selection>],
    fragments: &HashMap<Name, Positioned<FragmentDefinition>>,
    variables: &Variables,
    concrete_type: Option<&str>,
) -> Result<Vec<SelectionField>, OptimizerError> {
    let mut fields = Vec::new();
    for item in items {
        match &item.node {
            Selection::Field(field) => {
                // Introspection fields are the executor's business.
                if field.node.name.node.starts_with("__") {
                    continue;
                }
                fields.push(normalize_field(
                    field,
                    fragments,
                    variables,
                    concrete_type.map(str::to_string),
                )?);
            }
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                let fragment = fragments.get(name).ok_or_else(|| {
                    OptimizerError::Internal(format!("unknown fragment '{name}'"))
                })?;
                let condition = fragment.node.type_condition.node.on.node.as_str();
                fields.extend(normalize_selections(
                    &fragment.node.selection_set.node.items,
                    fragments,
                    variables,
                    Some(condition),
                )?);
            }
            Selection::InlineFragment(inline) => {
                let condition = inline
                    .node
                    .type_condition
                    .as_ref()
                    .map(|tc| tc.node.on.node.as_str())
                    .or(concrete_type);
                fields.extend(normalize_selections(
                    &inline.node.selection_set.node.items,
                    fragments,
                    variables,
                    condition,
                )?);
            }
        }
    }
    Ok(fields)
}

/// camelCase and PascalCase to snake_case; leaves snake_case untouched.
pub(crate) fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use async_graphql::parser::parse_query;
    use pretty_assertions::assert_eq;

    use super::*;

    fn root(query: &str, field: &str) -> SelectionField {
        let document = parse_query(query).unwrap();
        resolve_root(&document, None, field, &Variables::default()).unwrap()
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("streetAddress"), "street_address");
        assert_eq!(to_snake_case("pagedBuildings"), "paged_buildings");
        assert_eq!(to_snake_case("name"), "name");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_field_and_argument_names_are_snake_cased() {
        let field = root(
            "query { allApartments(orderBy: \"streetAddress\") { streetAddress } }",
            "all_apartments",
        );
        assert_eq!(field.name, "all_apartments");
        assert!(field.arguments.contains_key("order_by"));
        assert_eq!(field.children[0].name, "street_address");
    }

    #[test]
    fn test_fragment_spread_is_expanded_with_type_condition() {
        let field = root(
            "query { allApartments { ...Shares } } \
             fragment Shares on ApartmentType { sharesStart sharesEnd }",
            "allApartments",
        );
        let names: Vec<_> = field.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["shares_start", "shares_end"]);
        assert_eq!(
            field.children[0].concrete_type.as_deref(),
            Some("ApartmentType")
        );
    }

    #[test]
    fn test_inline_fragments_tag_concrete_type() {
        let field = root(
            "query { allPeople { ... on DeveloperType { name } ... on OwnerType { name } } }",
            "allPeople",
        );
        assert_eq!(field.children.len(), 2);
        assert_eq!(
            field.children[0].concrete_type.as_deref(),
            Some("DeveloperType")
        );
        assert_eq!(field.children[1].concrete_type.as_deref(), Some("OwnerType"));
    }

    #[test]
    fn test_connection_shape_detection() {
        let field = root(
            "query { pagedBuildings(first: 2) { totalCount edges { node { name } } } }",
            "pagedBuildings",
        );
        assert!(field.is_connection);
        assert!(field.selects_total_count());
        let node_children = field.connection_children().unwrap();
        assert_eq!(node_children[0].name, "name");
    }

    #[test]
    fn test_variables_are_resolved() {
        let document =
            parse_query("query Q($count: Int) { pagedBuildings(first: $count) { edges { node { name } } } }")
                .unwrap();
        let variables = Variables::from_json(serde_json::json!({ "count": 2 }));
        let field = resolve_root(&document, None, "pagedBuildings", &variables).unwrap();
        let first = field.arguments.get("first").unwrap().clone();
        assert_eq!(first.into_json().unwrap(), serde_json::json!(2));
    }

    #[test]
    fn test_introspection_fields_are_dropped() {
        let field = root("query { allPeople { __typename } }", "allPeople");
        assert!(field.children.is_empty());
    }
}
