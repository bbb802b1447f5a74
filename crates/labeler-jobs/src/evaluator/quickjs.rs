//! QuickJS evaluator for label functions.
//!
//! Every invocation gets its own runtime and context, so no state survives
//! between labels. The function source is evaluated as `(<source>)` and the
//! resulting function is called with the aggregated input.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rquickjs::function::{Func, Rest};
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Object, Runtime, Value};
use serde_json::Value as JsonValue;
use tracing::trace;

use super::{Evaluation, EvaluationError, EvaluatorConfig, LabelEvaluator};

type OutputBuffer = Arc<Mutex<Vec<String>>>;

/// Sandboxed JavaScript evaluator.
#[derive(Debug, Clone, Default)]
pub struct QuickJsEvaluator {
    config: EvaluatorConfig,
}

impl QuickJsEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }
}

#[async_trait]
impl LabelEvaluator for QuickJsEvaluator {
    fn name(&self) -> &'static str {
        "quickjs"
    }

    async fn evaluate(&self, function: &str, input: JsonValue) -> Evaluation {
        let source = function.to_string();
        let config = self.config.clone();
        let start = Instant::now();

        let evaluation =
            match tokio::task::spawn_blocking(move || run_function(&source, &input, &config))
                .await
            {
                Ok(evaluation) => evaluation,
                Err(e) => Evaluation::failed(EvaluationError::Runtime(format!(
                    "evaluation task failed: {}",
                    e
                ))),
            };

        trace!(
            subsystem = "jobs",
            component = "quickjs",
            duration_ms = start.elapsed().as_millis() as u64,
            success = evaluation.result.is_ok(),
            "Evaluated label function"
        );
        evaluation
    }
}

fn run_function(source: &str, input: &JsonValue, config: &EvaluatorConfig) -> Evaluation {
    let output: OutputBuffer = Arc::default();
    let result = invoke(source, input, config, &output);
    let output = output
        .lock()
        .map(|lines| lines.join("\n"))
        .unwrap_or_default();

    match result {
        Ok(value) => Evaluation::ok(value).with_output(output),
        Err(error) => Evaluation::failed(error).with_output(output),
    }
}

fn invoke(
    source: &str,
    input: &JsonValue,
    config: &EvaluatorConfig,
    output: &OutputBuffer,
) -> Result<JsonValue, EvaluationError> {
    let runtime = Runtime::new().map_err(runtime_error)?;
    runtime.set_memory_limit(config.memory_limit);
    runtime.set_max_stack_size(config.max_stack_size);
    let deadline = Instant::now() + config.timeout;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
    let context = Context::full(&runtime).map_err(runtime_error)?;
    let timeout = config.timeout;

    context.with(|ctx| {
        install_console(&ctx, output).map_err(runtime_error)?;

        let function: Value = ctx
            .eval(format!("({})", source))
            .catch(&ctx)
            .map_err(|e| failure(e, deadline, timeout, EvaluationError::Syntax))?;
        let function = function
            .into_function()
            .ok_or(EvaluationError::NotAFunction)?;

        let argument = ctx.json_parse(input.to_string()).map_err(runtime_error)?;
        let result: Value = function
            .call((argument,))
            .catch(&ctx)
            .map_err(|e| failure(e, deadline, timeout, EvaluationError::Exception))?;

        // Serialized inside the runtime so cycles and runaway nesting raise a
        // JavaScript error bounded by the stack and memory limits.
        let json = ctx
            .json_stringify(result)
            .catch(&ctx)
            .map_err(|e| failure(e, deadline, timeout, EvaluationError::Exception))?;
        parse_result(json)
    })
}

/// `undefined`, functions and symbols serialize to nothing and become `null`.
fn parse_result(json: Option<rquickjs::String<'_>>) -> Result<JsonValue, EvaluationError> {
    let Some(json) = json else {
        return Ok(JsonValue::Null);
    };
    let json = json.to_string().map_err(runtime_error)?;
    serde_json::from_str(&json)
        .map_err(|e| EvaluationError::Runtime(format!("unsupported function result: {}", e)))
}

fn failure(
    error: CaughtError<'_>,
    deadline: Instant,
    timeout: Duration,
    wrap: fn(String) -> EvaluationError,
) -> EvaluationError {
    // The interrupt handler surfaces as an uncatchable "interrupted" error
    if Instant::now() >= deadline {
        return EvaluationError::Timeout(timeout.as_millis() as u64);
    }
    wrap(caught_message(error))
}

fn caught_message(error: CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => exception
            .message()
            .unwrap_or_else(|| exception.to_string()),
        CaughtError::Value(value) => format_arg(value),
        CaughtError::Error(e) => e.to_string(),
    }
}

fn runtime_error(e: rquickjs::Error) -> EvaluationError {
    EvaluationError::Runtime(format!("QuickJS: {}", e))
}

/// Install `console.*` and `print`, appending each call as one output line.
fn install_console<'js>(ctx: &Ctx<'js>, output: &OutputBuffer) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for method in ["log", "info", "warn", "error", "debug"] {
        let sink = output.clone();
        console.set(
            method,
            Func::from(move |args: Rest<Value<'js>>| record(&sink, args.0)),
        )?;
    }

    let globals = ctx.globals();
    globals.set("console", console)?;
    let sink = output.clone();
    globals.set(
        "print",
        Func::from(move |args: Rest<Value<'js>>| record(&sink, args.0)),
    )?;
    Ok(())
}

fn record(output: &OutputBuffer, args: Vec<Value<'_>>) {
    let line = args
        .into_iter()
        .map(format_arg)
        .collect::<Vec<_>>()
        .join(" ");
    if let Ok(mut lines) = output.lock() {
        lines.push(line);
    }
}

fn format_arg(value: Value<'_>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    let ctx = value.ctx().clone();
    match ctx.json_stringify(value).catch(&ctx) {
        Ok(Some(json)) => json.to_string().unwrap_or_default(),
        Ok(None) => "undefined".to_string(),
        Err(_) => "[unprintable]".to_string(),
    }
}
