//! Model and object-type metadata registry.
//!
//! The optimizer never talks to a concrete ORM or GraphQL type system.
//! Instead the host registers its models (tables, columns, relations) and
//! object types (GraphQL field name to field kind mappings) in a
//! [`ModelSchema`] once at startup. The walker dispatches on the closed
//! [`FieldKind`] sum, so adding a new field behavior means adding a variant
//! here rather than reflecting over host types.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::OptimizerError;
use crate::filters::FilterSet;
use crate::query::{Expr, QuerySet};
use crate::settings::OptimizerSettings;

/// Index of a model inside its [`ModelSchema`].
pub type ModelId = usize;

/// Hook applied to every queryset for a given object type, ahead of any
/// filterset. Used for things like visibility scoping.
pub type FilterHook = Arc<dyn Fn(QuerySet) -> QuerySet + Send + Sync>;

/// Direction and cardinality of a model relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Forward FK: many rows here point at one row there.
    ManyToOne,
    /// Forward one-to-one, FK stored on this side.
    OneToOne,
    /// Reverse side of a one-to-one, FK stored on the related model.
    OneToOneReverse,
    /// Reverse FK: one row here is pointed at by many rows there.
    OneToMany,
    ManyToMany,
    /// Reverse side of a many-to-many declared on the related model.
    ManyToManyReverse,
}

impl RelationKind {
    /// Relations fetched by joining inside the parent query.
    pub fn is_to_one(self) -> bool {
        matches!(
            self,
            RelationKind::ManyToOne | RelationKind::OneToOne | RelationKind::OneToOneReverse
        )
    }

    /// Relations fetched as a secondary query keyed by parent ids.
    pub fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

/// Join table metadata for many-to-many relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughTable {
    pub table: String,
    /// Column referencing the owning side of the relation.
    pub source_column: String,
    /// Column referencing the related side.
    pub target_column: String,
}

/// Generic (content-type driven) relation declared on a model.
///
/// When the generic accessor is selected, the optimizer joins the
/// content-type accessor and projects the object-id column so the host can
/// resolve the polymorphic target without extra queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericRelation {
    /// Field name under which the generic target is selected.
    pub accessor: String,
    /// To-one accessor for the content-type row.
    pub ct_accessor: String,
    /// Column holding the target row's primary key.
    pub fk_column: String,
}

/// A concrete relation between two registered models.
#[derive(Debug, Clone)]
pub struct RelationField {
    pub kind: RelationKind,
    pub related_model: ModelId,
    /// FK column stored on this model (forward relations).
    pub fk_column: Option<String>,
    /// FK column on the related model pointing back here (reverse relations).
    pub related_fk_column: Option<String>,
    /// Join table, for many-to-many relations.
    pub through: Option<ThroughTable>,
}

/// A field stored on or reachable from a model.
#[derive(Debug, Clone)]
pub enum ModelField {
    Column { column: String },
    Relation(RelationField),
}

/// Metadata for one registered model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub fields: IndexMap<String, ModelField>,
    /// Ordering applied when a selection carries no explicit `order_by`.
    pub default_ordering: Vec<String>,
    pub generic_relation: Option<GenericRelation>,
}

impl ModelMeta {
    pub fn field(&self, name: &str) -> Option<&ModelField> {
        self.fields.get(name)
    }

    /// The relation stored under `name`, if the field is one.
    pub fn relation(&self, name: &str) -> Option<&RelationField> {
        match self.fields.get(name) {
            Some(ModelField::Relation(rel)) => Some(rel),
            _ => None,
        }
    }
}

/// What an object type resolves to.
#[derive(Debug, Clone)]
pub enum ObjectTypeShape {
    Model(ModelId),
    /// GraphQL union; members are object type names. Selections narrow to a
    /// member through inline fragments.
    Union { members: Vec<String> },
}

/// How a selected GraphQL field maps onto the model layer.
///
/// This is the closed sum the selection walker dispatches on.
#[derive(Clone)]
pub enum FieldKind {
    /// Plain scalar column.
    Column { column: String },
    /// Model relation under the same accessor name.
    Relation { field: String },
    /// Connection total-count sentinel exposed as a direct field.
    TotalCount,
    /// Custom field backed by a differently named model field. The result is
    /// attached under the selection name on the parent row.
    Named { field_name: String },
    /// Computed column the optimizer annotates onto the queryset.
    Annotated {
        expression: Expr,
        aliases: IndexMap<String, Expr>,
    },
    /// Custom field that needs several stored columns to resolve.
    Multi { columns: Vec<String> },
}

/// Metadata for one registered GraphQL object type.
#[derive(Clone)]
pub struct ObjectTypeMeta {
    pub name: String,
    pub shape: ObjectTypeShape,
    pub fields: IndexMap<String, FieldKind>,
    pub filterset: Option<Arc<dyn FilterSet>>,
    pub filter_queryset: Option<FilterHook>,
    /// Per-type override of the global complexity budget.
    pub max_complexity: Option<usize>,
}

impl ObjectTypeMeta {
    pub fn model_id(&self) -> Option<ModelId> {
        match self.shape {
            ObjectTypeShape::Model(id) => Some(id),
            ObjectTypeShape::Union { .. } => None,
        }
    }

    pub fn union_members(&self) -> Option<&[String]> {
        match &self.shape {
            ObjectTypeShape::Union { members } => Some(members),
            ObjectTypeShape::Model(_) => None,
        }
    }
}

/// The registry the optimizer resolves selections against.
///
/// Built once at startup and shared as `Arc<ModelSchema>`; read-only during
/// request handling.
pub struct ModelSchema {
    models: Vec<ModelMeta>,
    object_types: IndexMap<String, ObjectTypeMeta>,
    type_for_model: HashMap<ModelId, String>,
    content_type_model: Option<ModelId>,
    settings: OptimizerSettings,
}

impl ModelSchema {
    pub fn builder() -> ModelSchemaBuilder {
        ModelSchemaBuilder::default()
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn model(&self, id: ModelId) -> &ModelMeta {
        &self.models[id]
    }

    pub fn model_id(&self, name: &str) -> Option<ModelId> {
        self.models.iter().position(|m| m.name == name)
    }

    pub fn object_type(&self, name: &str) -> Option<&ObjectTypeMeta> {
        self.object_types.get(name)
    }

    /// The object type registered for a model, if any.
    pub fn object_type_for_model(&self, id: ModelId) -> Option<&ObjectTypeMeta> {
        self.type_for_model
            .get(&id)
            .and_then(|name| self.object_types.get(name))
    }

    /// Model registered for content-type rows, for generic relations.
    pub fn content_type_model(&self) -> Option<ModelId> {
        self.content_type_model
    }

    /// Follow a `__`-separated relation path from `model`, returning the
    /// model the final segment lands on.
    pub fn resolve_path_model(&self, model: ModelId, path: &[&str]) -> Option<ModelId> {
        let mut current = model;
        for segment in path {
            current = self.model(current).relation(segment)?.related_model;
        }
        Some(current)
    }
}

/// Model definition fed to [`ModelSchemaBuilder`]. Relations reference their
/// target models by name; the builder resolves names to ids.
pub struct ModelDef {
    name: String,
    table: String,
    primary_key: String,
    fields: IndexMap<String, FieldDef>,
    default_ordering: Vec<String>,
    generic_relation: Option<GenericRelation>,
}

enum FieldDef {
    Column {
        column: String,
    },
    Relation {
        kind: RelationKind,
        related: String,
        fk_column: Option<String>,
        related_fk_column: Option<String>,
        through: Option<ThroughTable>,
    },
}

impl ModelDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        ModelDef {
            name: name.into(),
            table: table.into(),
            primary_key: "id".to_string(),
            fields: IndexMap::new(),
            default_ordering: Vec::new(),
            generic_relation: None,
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn ordering<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_ordering = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.insert(
            name.clone(),
            FieldDef::Column { column: name },
        );
        self
    }

    /// Forward FK relation. `fk_column` is stored on this model.
    pub fn many_to_one(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::ManyToOne,
                related: related.into(),
                fk_column: Some(fk_column.into()),
                related_fk_column: None,
                through: None,
            },
        );
        self
    }

    pub fn one_to_one(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::OneToOne,
                related: related.into(),
                fk_column: Some(fk_column.into()),
                related_fk_column: None,
                through: None,
            },
        );
        self
    }

    /// Reverse side of a one-to-one; the FK lives on the related model.
    pub fn one_to_one_reverse(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        related_fk_column: impl Into<String>,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::OneToOneReverse,
                related: related.into(),
                fk_column: None,
                related_fk_column: Some(related_fk_column.into()),
                through: None,
            },
        );
        self
    }

    /// Reverse FK relation: the related model holds `related_fk_column`
    /// pointing back at this model.
    pub fn one_to_many(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        related_fk_column: impl Into<String>,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::OneToMany,
                related: related.into(),
                fk_column: None,
                related_fk_column: Some(related_fk_column.into()),
                through: None,
            },
        );
        self
    }

    pub fn many_to_many(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        through: ThroughTable,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::ManyToMany,
                related: related.into(),
                fk_column: None,
                related_fk_column: None,
                through: Some(through),
            },
        );
        self
    }

    pub fn many_to_many_reverse(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        through: ThroughTable,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldDef::Relation {
                kind: RelationKind::ManyToManyReverse,
                related: related.into(),
                fk_column: None,
                related_fk_column: None,
                through: Some(through),
            },
        );
        self
    }

    pub fn generic_relation(
        mut self,
        accessor: impl Into<String>,
        ct_accessor: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        self.generic_relation = Some(GenericRelation {
            accessor: accessor.into(),
            ct_accessor: ct_accessor.into(),
            fk_column: fk_column.into(),
        });
        self
    }
}

/// Object type definition fed to [`ModelSchemaBuilder`].
pub struct ObjectTypeDef {
    name: String,
    model: Option<String>,
    union_members: Vec<String>,
    fields: IndexMap<String, FieldKind>,
    filterset: Option<Arc<dyn FilterSet>>,
    filter_queryset: Option<FilterHook>,
    max_complexity: Option<usize>,
}

impl ObjectTypeDef {
    /// Object type backed by a model. Scalar columns and relations of the
    /// model are mirrored as fields automatically; explicit [`field`]
    /// registrations override or extend the mirror.
    ///
    /// [`field`]: ObjectTypeDef::field
    pub fn model(name: impl Into<String>, model: impl Into<String>) -> Self {
        ObjectTypeDef {
            name: name.into(),
            model: Some(model.into()),
            union_members: Vec::new(),
            fields: IndexMap::new(),
            filterset: None,
            filter_queryset: None,
            max_complexity: None,
        }
    }

    /// Union of previously registered object types.
    pub fn union<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ObjectTypeDef {
            name: name.into(),
            model: None,
            union_members: members.into_iter().map(Into::into).collect(),
            fields: IndexMap::new(),
            filterset: None,
            filter_queryset: None,
            max_complexity: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn filterset(mut self, filterset: Arc<dyn FilterSet>) -> Self {
        self.filterset = Some(filterset);
        self
    }

    pub fn filter_queryset(mut self, hook: FilterHook) -> Self {
        self.filter_queryset = Some(hook);
        self
    }

    pub fn max_complexity(mut self, max: usize) -> Self {
        self.max_complexity = Some(max);
        self
    }
}

/// Two-phase builder: register all models and object types by name, then
/// [`build`](ModelSchemaBuilder::build) resolves cross-references.
#[derive(Default)]
pub struct ModelSchemaBuilder {
    models: Vec<ModelDef>,
    object_types: Vec<ObjectTypeDef>,
    content_type_model: Option<String>,
    settings: Option<OptimizerSettings>,
}

impl ModelSchemaBuilder {
    pub fn settings(mut self, settings: OptimizerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn model(mut self, model: ModelDef) -> Self {
        self.models.push(model);
        self
    }

    pub fn object_type(mut self, object_type: ObjectTypeDef) -> Self {
        self.object_types.push(object_type);
        self
    }

    /// Register which model stores content-type rows.
    pub fn content_type_model(mut self, name: impl Into<String>) -> Self {
        self.content_type_model = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Arc<ModelSchema>, OptimizerError> {
        let ids: HashMap<String, ModelId> = self
            .models
            .iter()
            .enumerate()
            .map(|(id, def)| (def.name.clone(), id))
            .collect();
        let lookup = |name: &str| -> Result<ModelId, OptimizerError> {
            ids.get(name).copied().ok_or_else(|| {
                OptimizerError::Internal(format!("unknown model '{name}' in schema definition"))
            })
        };

        let mut models = Vec::with_capacity(self.models.len());
        for def in self.models {
            let mut fields = IndexMap::new();
            for (name, field) in def.fields {
                let resolved = match field {
                    FieldDef::Column { column } => ModelField::Column { column },
                    FieldDef::Relation {
                        kind,
                        related,
                        fk_column,
                        related_fk_column,
                        through,
                    } => ModelField::Relation(RelationField {
                        kind,
                        related_model: lookup(&related)?,
                        fk_column,
                        related_fk_column,
                        through,
                    }),
                };
                fields.insert(name, resolved);
            }
            models.push(ModelMeta {
                name: def.name,
                table: def.table,
                primary_key: def.primary_key,
                fields,
                default_ordering: def.default_ordering,
                generic_relation: def.generic_relation,
            });
        }

        let mut object_types = IndexMap::new();
        let mut type_for_model = HashMap::new();
        for def in self.object_types {
            let shape = match (&def.model, def.union_members.is_empty()) {
                (Some(model), _) => ObjectTypeShape::Model(lookup(model)?),
                (None, false) => ObjectTypeShape::Union {
                    members: def.union_members.clone(),
                },
                (None, true) => {
                    return Err(OptimizerError::Internal(format!(
                        "object type '{}' has neither a model nor union members",
                        def.name
                    )));
                }
            };

            // Mirror the model's own fields, then let explicit registrations
            // override.
            let mut fields = IndexMap::new();
            if let ObjectTypeShape::Model(id) = shape {
                for (name, field) in &models[id].fields {
                    let kind = match field {
                        ModelField::Column { column } => FieldKind::Column {
                            column: column.clone(),
                        },
                        ModelField::Relation(_) => FieldKind::Relation {
                            field: name.clone(),
                        },
                    };
                    fields.insert(name.clone(), kind);
                }
                if let Some(generic) = &models[id].generic_relation {
                    fields.insert(
                        generic.accessor.clone(),
                        FieldKind::Relation {
                            field: generic.accessor.clone(),
                        },
                    );
                }
                type_for_model.entry(id).or_insert_with(|| def.name.clone());
            }
            fields.extend(def.fields);

            object_types.insert(
                def.name.clone(),
                ObjectTypeMeta {
                    name: def.name,
                    shape,
                    fields,
                    filterset: def.filterset,
                    filter_queryset: def.filter_queryset,
                    max_complexity: def.max_complexity,
                },
            );
        }

        let content_type_model = match self.content_type_model {
            Some(name) => Some(lookup(&name)?),
            None => None,
        };

        Ok(Arc::new(ModelSchema {
            models,
            object_types,
            type_for_model,
            content_type_model,
            settings: self.settings.unwrap_or_default(),
        }))
    }
}
