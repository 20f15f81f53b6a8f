//! Optimizer configuration.
//!
//! Settings are process-wide and read-only during request handling. A
//! [`ModelSchema`](crate::schema::ModelSchema) owns one settings instance;
//! hosts that need non-default behavior build the schema with a customized
//! copy of [`default_settings`].

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::filters::FilterSet;

/// Configuration knobs recognized by the optimizer core.
#[derive(Clone)]
pub struct OptimizerSettings {
    /// Key under which the per-operation query cache is attached.
    pub query_cache_key: String,
    /// Hint key marking a queryset as already optimized.
    pub optimizer_mark: String,
    /// Annotation alias used for a nested connection's per-partition count.
    pub prefetch_count_key: String,
    /// Annotation alias for the row number within a prefetch partition.
    pub prefetch_partition_index: String,
    /// Skip projection narrowing with `only()` entirely.
    pub disable_only_fields_optimization: bool,
    /// Default join/prefetch budget. Object types may override this.
    pub max_complexity: usize,
    /// On unexpected errors, fall back to the unoptimized queryset instead
    /// of surfacing the error.
    pub skip_optimization_on_error: bool,
    /// Global cap applied to connection `first`/`last` arguments. `None`
    /// leaves unpaginated connections unwindowed.
    pub connection_max_limit: Option<u64>,
    /// Filterset applied to object types that do not declare their own.
    pub default_filterset: Option<Arc<dyn FilterSet>>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            query_cache_key: "_query_cache".to_string(),
            optimizer_mark: "_optimized".to_string(),
            prefetch_count_key: "_optimizer_count".to_string(),
            prefetch_partition_index: "_optimizer_partition_index".to_string(),
            disable_only_fields_optimization: false,
            max_complexity: 10,
            skip_optimization_on_error: false,
            connection_max_limit: None,
            default_filterset: None,
        }
    }
}

impl fmt::Debug for OptimizerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizerSettings")
            .field("query_cache_key", &self.query_cache_key)
            .field("optimizer_mark", &self.optimizer_mark)
            .field("prefetch_count_key", &self.prefetch_count_key)
            .field("prefetch_partition_index", &self.prefetch_partition_index)
            .field(
                "disable_only_fields_optimization",
                &self.disable_only_fields_optimization,
            )
            .field("max_complexity", &self.max_complexity)
            .field("skip_optimization_on_error", &self.skip_optimization_on_error)
            .field("connection_max_limit", &self.connection_max_limit)
            .field("default_filterset", &self.default_filterset.is_some())
            .finish()
    }
}

static DEFAULTS: Lazy<OptimizerSettings> = Lazy::new(OptimizerSettings::default);

/// The shared default settings instance.
pub fn default_settings() -> &'static OptimizerSettings {
    &DEFAULTS
}
