//! Resource limits applied to an isolate's engine.

use serde::{Deserialize, Serialize};

/// Approximate size of one engine value slot, used to turn a byte budget
/// into element counts for arrays and maps.
pub(crate) const VALUE_SLOT_BYTES: usize = 16;

/// Approximate stack bytes consumed per script call level.
pub(crate) const CALL_FRAME_BYTES: usize = 4096;

/// Default script call depth when no stack limit is configured.
pub const DEFAULT_MAX_CALL_LEVELS: usize = 64;

/// Isolate resource limits configuration
///
/// Byte sizes of 0 mean "unlimited". Limits must be set before the isolate
/// allocates anything (first context or first compile); afterwards
/// `Isolate::set_memory_limit` rejects changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolateLimits {
    /// Budget for short-lived values in bytes
    pub max_young_space_size: usize,
    /// Budget for long-lived values in bytes
    pub max_old_space_size: usize,
    /// Maximum size of compiled source in bytes
    pub max_executable_size: usize,
    /// Maximum script call depth
    pub max_call_levels: usize,
    /// Maximum engine operations per evaluation (0 = unlimited)
    pub max_operations: u64,
    /// Wall-clock budget per evaluation in milliseconds (0 = disabled)
    pub max_wall_clock_time_ms: u64,
}

impl Default for IsolateLimits {
    fn default() -> Self {
        Self {
            max_young_space_size: 0,
            max_old_space_size: 0,
            max_executable_size: 0,
            max_call_levels: DEFAULT_MAX_CALL_LEVELS,
            max_operations: 0,
            max_wall_clock_time_ms: 0,
        }
    }
}

impl IsolateLimits {
    /// Total heap budget in bytes (young + old), 0 when unlimited.
    pub fn heap_budget(&self) -> usize {
        self.max_young_space_size
            .saturating_add(self.max_old_space_size)
    }

    /// Merge a memory-limit request: zero values leave the current setting unchanged.
    pub(crate) fn merge_memory(&mut self, young: usize, old: usize, executable: usize) {
        if young != 0 {
            self.max_young_space_size = young;
        }
        if old != 0 {
            self.max_old_space_size = old;
        }
        if executable != 0 {
            self.max_executable_size = executable;
        }
    }

    /// Push the limits into an engine instance.
    pub(crate) fn apply(&self, engine: &mut rhai::Engine) {
        let budget = self.heap_budget();

        engine.set_max_string_size(budget);
        engine.set_max_array_size(budget / VALUE_SLOT_BYTES);
        engine.set_max_map_size(budget / VALUE_SLOT_BYTES);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_operations(self.max_operations);
    }
}
