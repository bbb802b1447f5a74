//! Centralized default constants for the label calculation engine.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// Source tag written on every diagnostic log entry produced by this engine.
pub const LOG_SOURCE: &str = "labels";

// =============================================================================
// LABEL FUNCTIONS
// =============================================================================

/// Wall-clock budget for a single label function invocation (milliseconds).
pub const FUNCTION_TIMEOUT_MS: u64 = 5_000;

/// Heap limit for a single label function runtime (bytes).
pub const FUNCTION_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Maximum native stack a label function may use (bytes).
pub const FUNCTION_MAX_STACK: usize = 512 * 1024;

// =============================================================================
// WORKER
// =============================================================================

/// Bound of the recalculation trigger queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// Broadcast buffer for label events and worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// NOTIFICATION CHANNELS
// =============================================================================

/// PostgreSQL channel carrying `"<datasetId>;<labelId>"` payloads.
pub const CHANNEL_CALCULATE_LABELS: &str = "calculate_labels";

/// PostgreSQL channel carrying `"<datasetId>;<isRecalculation>"` payloads.
pub const CHANNEL_DATASET_NEW: &str = "dataset_new";
