//! Label function evaluation.
//!
//! A label may carry a JavaScript function that transforms its aggregated
//! input. Evaluators implement [`LabelEvaluator`]; which one is used is a
//! deployment decision made through [`EvaluatorConfig`].

mod quickjs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use quickjs::QuickJsEvaluator;

/// Reasons a label function can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// The source did not compile.
    #[error("{0}")]
    Syntax(String),
    /// The source evaluated to something other than a function.
    #[error("source does not evaluate to a function")]
    NotAFunction,
    /// The function threw.
    #[error("{0}")]
    Exception(String),
    /// The function ran past its deadline.
    #[error("function exceeded timeout of {0}ms")]
    Timeout(u64),
    /// The runtime could not be created or values could not be converted.
    #[error("{0}")]
    Runtime(String),
}

/// Outcome of one function invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: std::result::Result<JsonValue, EvaluationError>,
    /// Console output produced while running, newline separated.
    pub output: String,
}

impl Evaluation {
    pub fn ok(value: JsonValue) -> Self {
        Self {
            result: Ok(value),
            output: String::new(),
        }
    }

    pub fn failed(error: EvaluationError) -> Self {
        Self {
            result: Err(error),
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Runs label functions against aggregated inputs.
#[async_trait]
pub trait LabelEvaluator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Invoke `function` with `input`. Failures are reported in the returned
    /// [`Evaluation`], never as a panic.
    async fn evaluate(&self, function: &str, input: JsonValue) -> Evaluation;
}

/// Evaluator that returns its input unchanged.
///
/// Used when label functions are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEvaluator;

#[async_trait]
impl LabelEvaluator for NoOpEvaluator {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn evaluate(&self, _function: &str, input: JsonValue) -> Evaluation {
        Evaluation::ok(input)
    }
}

/// Configuration for label function evaluation.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Run functions at all; when false [`NoOpEvaluator`] is used.
    pub enabled: bool,
    /// Wall-clock limit per invocation.
    pub timeout: Duration,
    /// Heap limit of the JavaScript runtime in bytes.
    pub memory_limit: usize,
    /// Stack limit of the JavaScript runtime in bytes.
    pub max_stack_size: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(labeler_core::defaults::FUNCTION_TIMEOUT_MS),
            memory_limit: labeler_core::defaults::FUNCTION_MEMORY_LIMIT,
            max_stack_size: labeler_core::defaults::FUNCTION_MAX_STACK,
        }
    }
}

impl EvaluatorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LABEL_FUNCTIONS_ENABLED` | `true` | Run label functions |
    /// | `LABEL_FUNCTION_TIMEOUT_MS` | `5000` | Per-invocation deadline |
    /// | `LABEL_FUNCTION_MEMORY_LIMIT` | `67108864` | Heap limit in bytes |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("LABEL_FUNCTIONS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let timeout = std::env::var("LABEL_FUNCTION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);

        let memory_limit = std::env::var("LABEL_FUNCTION_MEMORY_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.memory_limit);

        Self {
            enabled,
            timeout,
            memory_limit,
            ..defaults
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }
}

/// Build the evaluator selected by `config`.
pub fn build_evaluator(config: EvaluatorConfig) -> Arc<dyn LabelEvaluator> {
    if config.enabled {
        Arc::new(QuickJsEvaluator::new(config))
    } else {
        Arc::new(NoOpEvaluator)
    }
}
