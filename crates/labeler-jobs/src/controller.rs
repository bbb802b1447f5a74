//! Process-wide serialization of label recalculations.
//!
//! Every recalculation, whatever triggered it, runs begin → compute →
//! commit → publish while holding a single async mutex. Waiters are served in
//! FIFO order and wait without a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use labeler_core::{
    EventBus, LabelEvent, LabelStore, LabelTransaction, RecalculationTrigger, Result,
};

use crate::calculator::{CalculationReport, LabelCalculator};

/// Observable state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
}

/// Runs recalculations one at a time against a [`LabelStore`].
pub struct RecalculationController<S: LabelStore> {
    store: S,
    calculator: LabelCalculator,
    events: EventBus,
    gate: Mutex<()>,
    running: AtomicBool,
}

/// Resets the running flag even if the recalculation future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: LabelStore> RecalculationController<S> {
    pub fn new(store: S, calculator: LabelCalculator, events: EventBus) -> Self {
        Self {
            store,
            calculator,
            events,
            gate: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.running.load(Ordering::SeqCst) {
            ControllerState::Running
        } else {
            ControllerState::Idle
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Recalculate the labels named by `trigger`.
    ///
    /// Waits for any recalculation in progress to finish first. On success
    /// the transaction is committed and a `LabelsUpdated` event is published;
    /// on failure the transaction is rolled back and nothing is published.
    pub async fn run(&self, trigger: RecalculationTrigger) -> Result<CalculationReport> {
        let _permit = self.gate.lock().await;
        let _running = RunningGuard::enter(&self.running);
        let start = Instant::now();
        let dataset_id = trigger.dataset_id();

        debug!(
            subsystem = "jobs",
            component = "controller",
            op = "run",
            trigger = trigger.kind(),
            dataset_id,
            "Recalculation started"
        );

        match self.run_locked(trigger).await {
            Ok(report) => {
                info!(
                    subsystem = "jobs",
                    component = "controller",
                    op = "run",
                    trigger = trigger.kind(),
                    dataset_id,
                    label_count = report.resolved,
                    failed_count = report.failed.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Recalculation committed"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "controller",
                    op = "run",
                    trigger = trigger.kind(),
                    dataset_id,
                    serialization_conflict = e.is_serialization_conflict(),
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Recalculation failed"
                );
                Err(e)
            }
        }
    }

    async fn run_locked(&self, trigger: RecalculationTrigger) -> Result<CalculationReport> {
        let mut tx = self.store.begin().await?;
        let report = self
            .calculator
            .calculate(&mut tx, trigger.dataset_id(), trigger.selector())
            .await?;
        tx.commit().await?;

        self.events.emit(LabelEvent::LabelsUpdated {
            dataset_id: trigger.dataset_id(),
            is_recalculation: trigger.is_recalculation(),
        });
        Ok(report)
    }
}
