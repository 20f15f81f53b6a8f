//! GraphQL look-ahead query optimizer.
//!
//! Compiles a GraphQL selection over an object-relational schema into a
//! minimal set of relational fetches: scalar columns become projections,
//! to-one relations become joins, to-many relations become keyed prefetch
//! queries, and nested connection pagination becomes per-partition
//! row-number windows. One GraphQL operation resolves in `1 + P` queries,
//! where `P` is the number of distinct to-many relations selected.
//!
//! The crate is engine-agnostic: it consumes a parsed operation plus a
//! [`ModelSchema`] registry and emits directives through [`QuerySet`] to an
//! [`Executor`] implemented by the host.
//!
//! # Usage
//!
//! ```rust,ignore
//! let schema = ModelSchema::builder()
//!     .model(ModelDef::new("Building", "building").column("id").column("name"))
//!     .object_type(ObjectTypeDef::model("BuildingType", "Building"))
//!     .build()?;
//!
//! let document = async_graphql::parser::parse_query(query)?;
//! let info = OptimizeInfo::new(schema.clone(), document, "allBuildings");
//! let queryset = QuerySet::all(schema.clone(), building_model);
//! let rows = resolve_list(queryset, &info, &executor).await?;
//! ```

pub mod cache;
mod compile;
mod error;
pub mod fields;
pub mod filters;
mod optimizer;
pub mod pagination;
pub mod query;
pub mod schema;
pub mod selection;
mod settings;

pub use cache::{QueryCache, QueryCacheHandle};
pub use compile::{OptimizationCompiler, OptimizeInfo, optimize, optimize_single};
pub use error::{DatabaseError, OptimizerError};
pub use fields::{UnionMember, resolve_connection, resolve_list, resolve_node, resolve_union_list};
pub use filters::{ArgumentFilterSet, FilterInfo, FilterSet};
pub use optimizer::{CompilationResults, QueryOptimizer};
pub use pagination::{Connection, Edge, PageInfo, PaginationArgs, PaginationError, PaginationInput};
pub use query::{Cond, Executor, Expr, Lookup, PartitionWindow, Prefetch, QuerySet, Row};
pub use schema::{
    FieldKind, GenericRelation, ModelDef, ModelId, ModelMeta, ModelSchema, ObjectTypeDef,
    ObjectTypeMeta, RelationKind, ThroughTable,
};
pub use settings::{OptimizerSettings, default_settings};
