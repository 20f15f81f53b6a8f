//! Shared test fixtures: the housing example schema and an in-memory
//! relational engine implementing the [`Executor`] contract.
//!
//! The engine is deliberately literal-minded. It applies directives in the
//! documented order (prefetch bind, filters, annotations, window, ordering,
//! slice, projection) over plain JSON rows, and logs a one-line description
//! of every query so tests can assert exact query counts and shapes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};

use lookahead_optimizer::query::{Executor, Expr, Lookup, QuerySet, Row};
use lookahead_optimizer::schema::{
    FieldKind, ModelDef, ModelId, ModelSchema, ObjectTypeDef, RelationKind, ThroughTable,
};
use lookahead_optimizer::{ArgumentFilterSet, DatabaseError, OptimizerSettings};

type JsonRow = IndexMap<String, Value>;

/// In-memory tables plus a query log.
pub struct TestDatabase {
    schema: Arc<ModelSchema>,
    tables: Mutex<HashMap<String, Vec<JsonRow>>>,
    log: Mutex<Vec<String>>,
}

impl TestDatabase {
    pub fn new(schema: Arc<ModelSchema>) -> TestDatabase {
        TestDatabase {
            schema,
            tables: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Insert a JSON object as a row.
    pub fn insert(&self, table: &str, row: Value) {
        let Value::Object(map) = row else {
            panic!("rows must be JSON objects");
        };
        let row: JsonRow = map.into_iter().collect();
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn table_rows(&self, table: &str) -> Vec<JsonRow> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Base rows plus the partition key each belongs to, honoring a
    /// prefetch bind when present.
    fn bound_rows(&self, queryset: &QuerySet) -> Vec<(JsonRow, Option<Value>)> {
        let schema = queryset.schema();
        let table = &queryset.model().table;
        let rows = self.table_rows(table);

        let Some(bind) = queryset.prefetch_bind() else {
            return rows.into_iter().map(|row| (row, None)).collect();
        };

        let parent_meta = schema.model(bind.parent_model);
        let relation = parent_meta
            .relation(&bind.accessor)
            .expect("prefetch bind accessor must be a relation");
        let child_meta = queryset.model();
        let mut out = Vec::new();

        match relation.kind {
            RelationKind::OneToMany | RelationKind::OneToOneReverse => {
                let fk = relation
                    .related_fk_column
                    .as_ref()
                    .expect("reverse relation needs an inverse fk column");
                for row in rows {
                    if let Some(key) = row.get(fk) {
                        if bind.parent_keys.contains(key) {
                            let key = key.clone();
                            out.push((row, Some(key)));
                        }
                    }
                }
            }
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                // Promoted to-one prefetch: children are the rows the
                // parents' fk columns point at.
                let fk = relation
                    .fk_column
                    .as_ref()
                    .expect("forward relation needs an fk column");
                let parent_rows = self.table_rows(&parent_meta.table);
                for parent in parent_rows {
                    let Some(parent_pk) = parent.get(&parent_meta.primary_key) else {
                        continue;
                    };
                    if !bind.parent_keys.contains(parent_pk) {
                        continue;
                    }
                    let Some(target) = parent.get(fk) else { continue };
                    for row in &rows {
                        if row.get(&child_meta.primary_key) == Some(target) {
                            out.push((row.clone(), Some(parent_pk.clone())));
                        }
                    }
                }
            }
            RelationKind::ManyToMany | RelationKind::ManyToManyReverse => {
                let through = relation
                    .through
                    .as_ref()
                    .expect("many-to-many relation needs a through table");
                let join_rows = self.table_rows(&through.table);
                for join in join_rows {
                    let Some(source) = join.get(&through.source_column) else {
                        continue;
                    };
                    if !bind.parent_keys.contains(source) {
                        continue;
                    }
                    let Some(target) = join.get(&through.target_column) else {
                        continue;
                    };
                    for row in &rows {
                        if row.get(&child_meta.primary_key) == Some(target) {
                            out.push((row.clone(), Some(source.clone())));
                        }
                    }
                }
            }
        }
        out
    }

    /// Resolve a possibly relation-traversing `__` path to a value.
    fn path_value(&self, model: ModelId, row: &JsonRow, path: &str) -> Value {
        let schema = &self.schema;
        let segments: Vec<&str> = path.split("__").collect();
        let mut current_model = model;
        let mut current_row = row.clone();
        for (index, segment) in segments.iter().enumerate() {
            let meta = schema.model(current_model);
            if index == segments.len() - 1 {
                return current_row.get(*segment).cloned().unwrap_or(Value::Null);
            }
            let Some(relation) = meta.relation(segment) else {
                return Value::Null;
            };
            let related_meta = schema.model(relation.related_model);
            let next = match relation.kind {
                RelationKind::ManyToOne | RelationKind::OneToOne => {
                    let fk = relation.fk_column.as_deref().unwrap_or_default();
                    let target = current_row.get(fk).cloned().unwrap_or(Value::Null);
                    self.table_rows(&related_meta.table)
                        .into_iter()
                        .find(|r| r.get(&related_meta.primary_key) == Some(&target))
                }
                RelationKind::OneToOneReverse => {
                    let fk = relation.related_fk_column.as_deref().unwrap_or_default();
                    let pk = current_row.get(&meta.primary_key).cloned();
                    self.table_rows(&related_meta.table)
                        .into_iter()
                        .find(|r| r.get(fk).cloned() == pk)
                }
                _ => None,
            };
            match next {
                Some(next_row) => {
                    current_model = relation.related_model;
                    current_row = next_row;
                }
                None => return Value::Null,
            }
        }
        Value::Null
    }

    fn apply_filters(&self, queryset: &QuerySet, rows: Vec<(JsonRow, Option<Value>)>) -> Vec<(JsonRow, Option<Value>)> {
        let model = queryset.model_id();
        rows.into_iter()
            .filter(|(row, _)| {
                queryset.filters().iter().all(|predicate| {
                    let actual = self.path_value(model, row, &predicate.path);
                    matches(predicate.lookup, &actual, &predicate.value)
                })
            })
            .collect()
    }

    /// Group by partition key, preserving first-seen partition order.
    fn partitions(rows: Vec<(JsonRow, Option<Value>)>) -> Vec<(Option<Value>, Vec<JsonRow>)> {
        let mut keys: Vec<Option<Value>> = Vec::new();
        let mut groups: Vec<Vec<JsonRow>> = Vec::new();
        for (row, key) in rows {
            match keys.iter().position(|k| *k == key) {
                Some(index) => groups[index].push(row),
                None => {
                    keys.push(key);
                    groups.push(vec![row]);
                }
            }
        }
        keys.into_iter().zip(groups).collect()
    }

    fn materialize(&self, model: ModelId, row: &JsonRow, projection: &[String], joins: &[String]) -> Row {
        let schema = &self.schema;
        let meta = schema.model(model);
        let mut out = Row::new(meta.table.clone());

        if projection.is_empty() {
            for (column, value) in row {
                out.columns.insert(column.clone(), value.clone());
            }
        } else {
            for column in projection {
                if column.contains("__") {
                    continue;
                }
                if let Some(value) = row.get(column) {
                    out.columns.insert(column.clone(), value.clone());
                }
            }
        }

        // Group join paths by their first segment.
        let mut heads: IndexMap<String, Vec<String>> = IndexMap::new();
        for join in joins {
            match join.split_once("__") {
                Some((head, rest)) => heads
                    .entry(head.to_string())
                    .or_default()
                    .push(rest.to_string()),
                None => {
                    heads.entry(join.clone()).or_default();
                }
            }
        }

        for (head, sub_joins) in heads {
            let Some(relation) = meta.relation(&head) else {
                continue;
            };
            let related_meta = schema.model(relation.related_model);
            let target = match relation.kind {
                RelationKind::ManyToOne | RelationKind::OneToOne => {
                    let fk = relation.fk_column.as_deref().unwrap_or_default();
                    let target = row.get(fk).cloned().unwrap_or(Value::Null);
                    self.table_rows(&related_meta.table)
                        .into_iter()
                        .find(|r| r.get(&related_meta.primary_key) == Some(&target))
                }
                RelationKind::OneToOneReverse => {
                    let fk = relation.related_fk_column.as_deref().unwrap_or_default();
                    let pk = row.get(&meta.primary_key).cloned();
                    self.table_rows(&related_meta.table)
                        .into_iter()
                        .find(|r| r.get(fk).cloned() == pk)
                }
                _ => None,
            };

            let prefix = format!("{head}__");
            let sub_projection: Vec<String> = projection
                .iter()
                .filter_map(|c| c.strip_prefix(&prefix))
                .map(str::to_string)
                .collect();

            let materialized = target.map(|target_row| {
                Box::new(self.materialize(
                    relation.related_model,
                    &target_row,
                    &sub_projection,
                    &sub_joins,
                ))
            });
            out.related.insert(head, materialized);
        }

        out
    }

    fn describe(&self, queryset: &QuerySet, verb: &str) -> String {
        let mut parts = vec![format!("{verb} {}", queryset.model().table)];
        if let Some(bind) = queryset.prefetch_bind() {
            parts.push(format!("bind={}", bind.accessor));
        }
        if !queryset.filters().is_empty() {
            let filters: Vec<String> = queryset
                .filters()
                .iter()
                .map(|p| format!("{}:{:?}", p.path, p.lookup))
                .collect();
            parts.push(format!("filters=[{}]", filters.join(",")));
        }
        if !queryset.joins().is_empty() {
            parts.push(format!("joins=[{}]", queryset.joins().join(",")));
        }
        if !queryset.projection().is_empty() {
            parts.push(format!("only=[{}]", queryset.projection().join(",")));
        }
        if let Some(window) = queryset.partition_window() {
            parts.push(format!(
                "window(partition={} order=[{}])",
                window.partition_by,
                window.order_by.join(",")
            ));
        }
        if queryset
            .annotations()
            .values()
            .any(|expr| matches!(expr, Expr::PartitionCount))
        {
            parts.push("partition_count".to_string());
        }
        if !queryset.ordering().is_empty() {
            parts.push(format!("order=[{}]", queryset.ordering().join(",")));
        }
        if let Some((start, stop)) = queryset.slice_bounds() {
            parts.push(format!("slice={start}..{stop}"));
        }
        if queryset.is_distinct() {
            parts.push("distinct".to_string());
        }
        parts.join(" ")
    }
}

#[async_trait]
impl Executor for TestDatabase {
    async fn fetch(&self, queryset: &QuerySet) -> Result<Vec<Row>, DatabaseError> {
        self.log.lock().push(self.describe(queryset, "SELECT"));

        let model = queryset.model_id();
        let rows = self.bound_rows(queryset);
        let rows = self.apply_filters(queryset, rows);

        // Partition-aware phase: windows and per-partition counts.
        let mut survivors: Vec<(JsonRow, Option<Value>, i64)> = Vec::new();
        for (key, mut group) in Self::partitions(rows) {
            let size = group.len() as i64;
            if let Some(window) = queryset.partition_window() {
                sort_rows(&mut group, &window.order_by);
                let start = window.start.evaluate(size).unwrap_or(0);
                let stop = window.stop.evaluate(size).unwrap_or(size);
                group = group
                    .into_iter()
                    .enumerate()
                    .filter(|(index, _)| {
                        let row_number = *index as i64 + 1;
                        row_number > start && row_number <= stop
                    })
                    .map(|(_, row)| row)
                    .collect();
            }
            for row in group {
                survivors.push((row, key.clone(), size));
            }
        }

        if !queryset.ordering().is_empty() {
            let ordering = queryset.ordering().to_vec();
            survivors.sort_by(|a, b| compare_rows(&a.0, &b.0, &ordering));
        }

        let mut survivors = survivors;
        if queryset.is_distinct() {
            let pk = queryset.model().primary_key.clone();
            let mut seen: Vec<Value> = Vec::new();
            survivors.retain(|(row, _, _)| {
                let key = row.get(&pk).cloned().unwrap_or(Value::Null);
                if seen.contains(&key) {
                    false
                } else {
                    seen.push(key);
                    true
                }
            });
        }

        if let Some((start, stop)) = queryset.slice_bounds() {
            let start = (start as usize).min(survivors.len());
            let stop = (stop as usize).min(survivors.len());
            survivors = survivors[start..stop].to_vec();
        }

        let projection = queryset.projection().to_vec();
        let joins = queryset.joins().to_vec();
        let mut out = Vec::new();
        for (json_row, key, size) in survivors {
            let mut row = self.materialize(model, &json_row, &projection, &joins);
            for (alias, expr) in queryset.annotations() {
                row.annotations
                    .insert(alias.clone(), evaluate_annotation(expr, &json_row, size));
            }
            row.partition_key = key;
            out.push(row);
        }
        Ok(out)
    }

    async fn count(&self, queryset: &QuerySet) -> Result<u64, DatabaseError> {
        self.log.lock().push(self.describe(queryset, "COUNT"));
        let rows = self.bound_rows(queryset);
        let rows = self.apply_filters(queryset, rows);
        Ok(rows.len() as u64)
    }
}

/// Evaluate an annotation expression for one row. Raw tokens understand the
/// `upper:<column>` convention used by the annotated-field tests.
fn evaluate_annotation(expr: &Expr, row: &JsonRow, partition_size: i64) -> Value {
    if let Expr::Raw(token) = expr {
        if let Some(column) = token.strip_prefix("upper:") {
            return match row.get(column) {
                Some(Value::String(s)) => Value::String(s.to_uppercase()),
                _ => Value::Null,
            };
        }
        return Value::Null;
    }
    match expr.evaluate(partition_size) {
        Some(value) => json!(value),
        None => Value::Null,
    }
}

fn matches(lookup: Lookup, actual: &Value, expected: &Value) -> bool {
    match lookup {
        Lookup::Exact => actual == expected,
        Lookup::IExact => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        },
        Lookup::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => a.contains(b),
            _ => false,
        },
        Lookup::IContains => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => a.to_lowercase().contains(&b.to_lowercase()),
            _ => false,
        },
        Lookup::In => expected
            .as_array()
            .is_some_and(|values| values.contains(actual)),
        Lookup::Gt => compare_values(actual, expected).is_gt(),
        Lookup::Gte => compare_values(actual, expected).is_ge(),
        Lookup::Lt => compare_values(actual, expected).is_lt(),
        Lookup::Lte => compare_values(actual, expected).is_le(),
        Lookup::IsNull => actual.is_null() == expected.as_bool().unwrap_or(true),
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn compare_rows(a: &JsonRow, b: &JsonRow, ordering: &[String]) -> std::cmp::Ordering {
    for name in ordering {
        let (column, descending) = match name.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (name.as_str(), false),
        };
        let left = a.get(column).cloned().unwrap_or(Value::Null);
        let right = b.get(column).cloned().unwrap_or(Value::Null);
        let cmp = compare_values(&left, &right);
        let cmp = if descending { cmp.reverse() } else { cmp };
        if !cmp.is_eq() {
            return cmp;
        }
    }
    std::cmp::Ordering::Equal
}

fn sort_rows(rows: &mut [JsonRow], ordering: &[String]) {
    rows.sort_by(|a, b| compare_rows(a, b, ordering));
}

// ----------------------------------------------------------------------
// The housing example schema
// ----------------------------------------------------------------------

/// `Building -> Apartment` one-to-many, `HousingCompany <-> Developer`
/// many-to-many, `Apartment -> Sale -> Ownership -> Owner` chains, plus the
/// `People` union over developers, property managers and owners.
pub fn housing_schema() -> Arc<ModelSchema> {
    housing_schema_with(OptimizerSettings::default())
}

pub fn housing_schema_with(settings: OptimizerSettings) -> Arc<ModelSchema> {
    let company_developers = ThroughTable {
        table: "example_housingcompany_developers".to_string(),
        source_column: "housingcompany_id".to_string(),
        target_column: "developer_id".to_string(),
    };
    let developer_companies = ThroughTable {
        table: "example_housingcompany_developers".to_string(),
        source_column: "developer_id".to_string(),
        target_column: "housingcompany_id".to_string(),
    };

    ModelSchema::builder()
        .settings(settings)
        .model(
            ModelDef::new("PostalCode", "example_postalcode")
                .column("id")
                .column("code"),
        )
        .model(
            ModelDef::new("Developer", "example_developer")
                .column("id")
                .column("name")
                .column("description")
                .many_to_many_reverse("housingcompany_set", "HousingCompany", developer_companies),
        )
        .model(
            ModelDef::new("PropertyManager", "example_propertymanager")
                .column("id")
                .column("name")
                .one_to_many("housing_companies", "HousingCompany", "property_manager_id"),
        )
        .model(
            ModelDef::new("HousingCompany", "example_housingcompany")
                .column("id")
                .column("name")
                .column("street_address")
                .column("city")
                .many_to_one("postal_code", "PostalCode", "postal_code_id")
                .many_to_one("property_manager", "PropertyManager", "property_manager_id")
                .many_to_many("developers", "Developer", company_developers)
                .one_to_many("real_estates", "RealEstate", "housing_company_id"),
        )
        .model(
            ModelDef::new("RealEstate", "example_realestate")
                .column("id")
                .column("name")
                .column("surface_area")
                .many_to_one("housing_company", "HousingCompany", "housing_company_id")
                .one_to_many("buildings", "Building", "real_estate_id"),
        )
        .model(
            ModelDef::new("Building", "example_building")
                .column("id")
                .column("name")
                .ordering(["name"])
                .many_to_one("real_estate", "RealEstate", "real_estate_id")
                .one_to_many("apartments", "Apartment", "building_id"),
        )
        .model(
            ModelDef::new("Apartment", "example_apartment")
                .column("id")
                .column("street_address")
                .column("stair")
                .column("apartment_number")
                .column("shares_start")
                .column("shares_end")
                .many_to_one("building", "Building", "building_id")
                .one_to_many("sales", "Sale", "apartment_id"),
        )
        .model(
            ModelDef::new("Sale", "example_sale")
                .column("id")
                .column("purchase_date")
                .many_to_one("apartment", "Apartment", "apartment_id")
                .one_to_many("ownerships", "Ownership", "sale_id"),
        )
        .model(
            ModelDef::new("Owner", "example_owner")
                .column("id")
                .column("name")
                .one_to_many("ownerships", "Ownership", "owner_id"),
        )
        .model(
            ModelDef::new("Ownership", "example_ownership")
                .column("id")
                .column("percentage")
                .many_to_one("owner", "Owner", "owner_id")
                .many_to_one("sale", "Sale", "sale_id"),
        )
        .object_type(ObjectTypeDef::model("PostalCodeType", "PostalCode"))
        .object_type(ObjectTypeDef::model("DeveloperType", "Developer"))
        .object_type(ObjectTypeDef::model("PropertyManagerType", "PropertyManager"))
        .object_type(
            ObjectTypeDef::model("HousingCompanyType", "HousingCompany").filterset(Arc::new(
                ArgumentFilterSet::new()
                    .exact("name")
                    .arg("city", "city", Lookup::IExact),
            )),
        )
        .object_type(ObjectTypeDef::model("RealEstateType", "RealEstate"))
        .object_type(
            ObjectTypeDef::model("BuildingType", "Building")
                // Computed and renamed fields in the style of the GraphQL
                // layer's custom field declarations.
                .field(
                    "upper_name",
                    FieldKind::Annotated {
                        expression: Expr::Raw("upper:name".to_string()),
                        aliases: IndexMap::new(),
                    },
                )
                .field(
                    "flats",
                    FieldKind::Named {
                        field_name: "apartments".to_string(),
                    },
                ),
        )
        .object_type(
            ObjectTypeDef::model("ApartmentType", "Apartment")
                .max_complexity(10)
                .field(
                    "address",
                    FieldKind::Multi {
                        columns: vec![
                            "street_address".to_string(),
                            "stair".to_string(),
                            "apartment_number".to_string(),
                        ],
                    },
                )
                .filterset(Arc::new(
                    ArgumentFilterSet::new()
                        .exact("street_address")
                        .arg("building_name", "building__name", Lookup::Exact),
                )),
        )
        .object_type(ObjectTypeDef::model("SaleType", "Sale"))
        .object_type(ObjectTypeDef::model("OwnerType", "Owner"))
        .object_type(ObjectTypeDef::model("OwnershipType", "Ownership"))
        .object_type(ObjectTypeDef::union(
            "People",
            ["DeveloperType", "PropertyManagerType", "OwnerType"],
        ))
        .build()
        .expect("housing schema is valid")
}

/// Seed `count` buildings named "1".."count".
pub fn seed_buildings(db: &TestDatabase, count: u64) {
    for index in 1..=count {
        db.insert(
            "example_building",
            json!({ "id": index, "name": index.to_string() }),
        );
    }
}

/// Seed apartments spread over buildings: `per_building[i]` apartments for
/// building `i + 1`. Apartment ids and street addresses count up from 1.
pub fn seed_apartments(db: &TestDatabase, per_building: &[u64]) {
    let mut next_id = 1u64;
    for (index, count) in per_building.iter().enumerate() {
        let building_id = index as u64 + 1;
        for _ in 0..*count {
            db.insert(
                "example_apartment",
                json!({
                    "id": next_id,
                    "street_address": next_id.to_string(),
                    "stair": "A",
                    "apartment_number": next_id,
                    "shares_start": next_id * 10,
                    "shares_end": next_id * 10 + 9,
                    "building_id": building_id,
                }),
            );
            next_id += 1;
        }
    }
}
