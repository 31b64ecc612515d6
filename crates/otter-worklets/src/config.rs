//! Configuration for the worklet module.
//!
//! Embedders normally construct [`WorkletConfig`] in code, but it also
//! deserializes from JSON so it can live next to the rest of an app's
//! runtime settings.

use serde::{Deserialize, Serialize};

/// Default cap on mapper passes within a single frame tick.
pub const DEFAULT_MAX_MAPPER_PASSES: usize = 8;

/// Default number of consecutive failures after which a mapper is disabled.
pub const DEFAULT_MAX_CONSECUTIVE_MAPPER_FAILURES: u32 = 3;

/// Worklet module configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkletConfig {
    /// Maximum number of mapper passes per tick. Mapper graphs with cycles
    /// stop propagating once this is reached; leftover work stays dirty and
    /// is picked up on the next frame.
    /// Default: 8
    pub max_mapper_passes: usize,

    /// Disable a mapper after this many consecutive failed executions.
    /// `None` keeps retrying forever.
    /// Default: Some(3)
    pub max_consecutive_mapper_failures: Option<u32>,

    /// Request another frame when a tick ends with mappers still dirty.
    /// Default: true
    pub rerender_on_pending_mappers: bool,
}

impl Default for WorkletConfig {
    fn default() -> Self {
        Self {
            max_mapper_passes: DEFAULT_MAX_MAPPER_PASSES,
            max_consecutive_mapper_failures: Some(DEFAULT_MAX_CONSECUTIVE_MAPPER_FAILURES),
            rerender_on_pending_mappers: true,
        }
    }
}

impl WorkletConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-tick mapper pass cap. Values below 1 are raised to 1.
    pub fn max_mapper_passes(mut self, passes: usize) -> Self {
        self.max_mapper_passes = passes.max(1);
        self
    }

    /// Set the consecutive failure limit (`None` never disables).
    pub fn max_consecutive_mapper_failures(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_mapper_failures = limit;
        self
    }

    /// Enable or disable requesting another frame while mappers are pending.
    pub fn rerender_on_pending_mappers(mut self, enabled: bool) -> Self {
        self.rerender_on_pending_mappers = enabled;
        self
    }

    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(json)?;
        config.max_mapper_passes = config.max_mapper_passes.max(1);
        Ok(config)
    }
}
