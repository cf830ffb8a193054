//! Zone configuration.

/// Dense worker index in `[0, workers)`, assigned at zone creation and
/// stable for the zone's lifetime.
pub type WorkerId = usize;

/// Immutable configuration for a zone.
///
/// `id` and `workers` drive scheduling; the remaining knobs are passed
/// through to the engine factory and do not alter scheduling semantics.
#[derive(Debug, Clone)]
pub struct ZoneSettings {
    /// Registry key; non-empty and unique among live zones.
    pub id: String,

    /// Number of worker VMs; fixed for the zone lifetime.
    pub workers: usize,

    /// Maximum engine heap size in bytes (None = engine default).
    pub max_heap_size: Option<usize>,

    /// Initial engine heap size in bytes (None = engine default).
    pub initial_heap_size: Option<usize>,

    /// Source evaluated on every worker during the bootstrap barrier.
    /// Falls back to `EngineFactory::bootstrap_source` when unset.
    pub bootstrap_script: Option<String>,

    /// Per-worker task queue bound. `None` (the default) leaves queues
    /// unbounded; with a bound, submission returns a queue-full error.
    pub max_queue_depth: Option<usize>,
}

impl ZoneSettings {
    /// Create settings for a zone with the given id and worker count.
    ///
    /// # Panics
    ///
    /// Panics if `id` is empty or `workers` is zero.
    pub fn new(id: impl Into<String>, workers: usize) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "zone id must be non-empty");
        assert!(workers > 0, "zone must have at least one worker");
        Self {
            id,
            workers,
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            max_queue_depth: None,
        }
    }

    /// Set the maximum engine heap size in bytes.
    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    /// Set the initial engine heap size in bytes.
    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    /// Set the bootstrap script evaluated on every worker at creation.
    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    /// Bound each worker's task queue.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = ZoneSettings::new("zone-a", 4)
            .with_max_heap_size(64 * 1024 * 1024)
            .with_bootstrap("bootstrap")
            .with_max_queue_depth(128);

        assert_eq!(settings.id, "zone-a");
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.max_heap_size, Some(64 * 1024 * 1024));
        assert_eq!(settings.bootstrap_script.as_deref(), Some("bootstrap"));
        assert_eq!(settings.max_queue_depth, Some(128));
        assert!(settings.initial_heap_size.is_none());
    }

    #[test]
    #[should_panic(expected = "at least one worker")]
    fn test_zero_workers_rejected() {
        let _ = ZoneSettings::new("zone-a", 0);
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn test_empty_id_rejected() {
        let _ = ZoneSettings::new("", 1);
    }
}
