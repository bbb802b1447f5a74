//! Queue worker feeding triggers to the recalculation controller.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use labeler_core::{Error, LabelStore, RecalculationTrigger, Result};

use crate::calculator::CalculationReport;
use crate::controller::RecalculationController;
use crate::DEFAULT_QUEUE_CAPACITY;

/// Configuration for the recalculation worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound of the trigger queue; producers wait when it is full.
    pub queue_capacity: usize,
    /// Whether to process triggers at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LABEL_WORKER_ENABLED` | `true` | Enable/disable trigger processing |
    /// | `LABEL_QUEUE_CAPACITY` | `1024` | Trigger queue bound |
    pub fn from_env() -> Self {
        let enabled = std::env::var("LABEL_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let queue_capacity = std::env::var("LABEL_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
            .max(1);

        Self {
            queue_capacity,
            enabled,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Enable or disable trigger processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the recalculation worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// A trigger was recalculated and committed.
    TriggerCompleted {
        trigger: RecalculationTrigger,
        report: CalculationReport,
    },
    /// A trigger failed; its transaction was rolled back.
    TriggerFailed {
        trigger: RecalculationTrigger,
        error: String,
    },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for submitting triggers to and controlling a running worker.
pub struct WorkerHandle {
    trigger_tx: mpsc::Sender<RecalculationTrigger>,
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue a trigger, waiting while the queue is full.
    pub async fn submit(&self, trigger: RecalculationTrigger) -> Result<()> {
        self.trigger_tx
            .send(trigger)
            .await
            .map_err(|_| Error::Internal("Recalculation worker is not running".into()))
    }

    /// A sender for producers such as the database listener.
    pub fn sender(&self) -> mpsc::Sender<RecalculationTrigger> {
        self.trigger_tx.clone()
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Signal the worker to shut down gracefully.
    ///
    /// The trigger being processed, if any, is finished first.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Recalculation worker panicked: {}", e)))
    }
}

/// Single-consumer worker processing triggers in arrival order.
pub struct RecalculationWorker<S: LabelStore> {
    controller: Arc<RecalculationController<S>>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl<S: LabelStore> RecalculationWorker<S> {
    pub fn new(controller: Arc<RecalculationController<S>>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(labeler_core::defaults::EVENT_BUS_CAPACITY);
        Self {
            controller,
            config,
            event_tx,
        }
    }

    pub fn controller(&self) -> &Arc<RecalculationController<S>> {
        &self.controller
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(self.config.queue_capacity);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut trigger_rx, &mut shutdown_rx).await;
        });

        WorkerHandle {
            trigger_tx,
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip_all)]
    async fn run(
        &self,
        trigger_rx: &mut mpsc::Receiver<RecalculationTrigger>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) {
        if !self.config.enabled {
            info!("Recalculation worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            queue_capacity = self.config.queue_capacity,
            "Recalculation worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Recalculation worker received shutdown signal");
                    break;
                }
                trigger = trigger_rx.recv() => match trigger {
                    Some(trigger) => self.process(trigger).await,
                    None => {
                        info!("Trigger queue closed");
                        break;
                    }
                },
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Recalculation worker stopped");
    }

    async fn process(&self, trigger: RecalculationTrigger) {
        match self.controller.run(trigger).await {
            Ok(report) => {
                let _ = self
                    .event_tx
                    .send(WorkerEvent::TriggerCompleted { trigger, report });
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    trigger = trigger.kind(),
                    dataset_id = trigger.dataset_id(),
                    serialization_conflict = e.is_serialization_conflict(),
                    error = %e,
                    "Recalculation trigger failed"
                );
                let _ = self.event_tx.send(WorkerEvent::TriggerFailed {
                    trigger,
                    error: e.to_string(),
                });
            }
        }
    }
}
