//! # labeler-core
//!
//! Core types, traits, and abstractions for the label calculation engine.
//!
//! This crate provides the domain model (datasets, labels, extractors, label
//! values, diagnostic log entries), the storage traits that concrete backends
//! implement, and the event bus used to announce freshly computed labels.

pub mod defaults;
pub mod error;
pub mod events;
pub mod extract;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, LabelEvent};
pub use extract::{extract, Extraction};
pub use models::*;
pub use traits::*;
