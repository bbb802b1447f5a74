//! # labeler-jobs
//!
//! Label recalculation for datasets.
//!
//! A recalculation resolves which labels apply to a dataset, extracts each
//! label's inputs with JSONPath, aggregates them, optionally runs the label's
//! JavaScript function, and persists results and diagnostics in a single
//! transaction. A "labels updated" event is published after commit.
//!
//! This crate provides:
//! - The pure pipeline stages ([`resolver`], [`aggregate`])
//! - Function evaluators ([`NoOpEvaluator`], [`QuickJsEvaluator`])
//! - [`LabelCalculator`] running the pipeline inside a store transaction
//! - [`RecalculationController`] serializing recalculations process-wide
//! - [`RecalculationWorker`] draining a trigger queue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use labeler_db::Database;
//! use labeler_jobs::{
//!     EventBus, LabelCalculator, QuickJsEvaluator, RecalculationController,
//!     RecalculationWorker, WorkerConfig,
//! };
//!
//! let db = Database::connect("postgres://...").await?;
//! let calculator = LabelCalculator::new(Arc::new(QuickJsEvaluator::default()));
//! let controller = RecalculationController::new(db.labels.clone(), calculator, EventBus::default());
//!
//! let handle = RecalculationWorker::new(Arc::new(controller), WorkerConfig::from_env()).start();
//! db.trigger_listener().await?.spawn(handle.sender());
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod aggregate;
pub mod calculator;
pub mod controller;
pub mod evaluator;
pub mod resolver;
pub mod worker;

// Re-export core types
pub use labeler_core::*;

pub use aggregate::aggregate;
pub use calculator::{CalculationReport, LabelCalculator};
pub use controller::{ControllerState, RecalculationController};
pub use evaluator::{
    build_evaluator, Evaluation, EvaluationError, EvaluatorConfig, LabelEvaluator, NoOpEvaluator,
    QuickJsEvaluator,
};
pub use resolver::{resolve_labels, ResolvedLabel};
pub use worker::{RecalculationWorker, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default capacity of the trigger queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = labeler_core::defaults::QUEUE_CAPACITY;

/// Default wall-clock limit for a single label function (milliseconds).
pub const DEFAULT_FUNCTION_TIMEOUT_MS: u64 = labeler_core::defaults::FUNCTION_TIMEOUT_MS;
