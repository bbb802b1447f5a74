//! PostgreSQL LISTEN/NOTIFY source of recalculation triggers.
//!
//! Two channels are consumed:
//!
//! | Channel | Payload | Trigger |
//! |---------|---------|---------|
//! | `calculate_labels` | `<datasetId>;<labelId>` | label definition changed |
//! | `dataset_new` | `<datasetId>;<isRecalculation>` | dataset created |
//!
//! Malformed payloads are logged and dropped.

use sqlx::postgres::PgListener;
use sqlx::{Pool, Postgres};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use labeler_core::defaults::{CHANNEL_CALCULATE_LABELS, CHANNEL_DATASET_NEW};
use labeler_core::{
    Error, LabelChangedEvent, NewDatasetEvent, RecalculationTrigger, Result,
};

/// Parse a notification into a trigger.
pub fn parse_notification(channel: &str, payload: &str) -> Result<RecalculationTrigger> {
    match channel {
        CHANNEL_CALCULATE_LABELS => Ok(payload.parse::<LabelChangedEvent>()?.into()),
        CHANNEL_DATASET_NEW => Ok(payload.parse::<NewDatasetEvent>()?.into()),
        other => Err(Error::InvalidTrigger(format!(
            "unexpected channel {}: {}",
            other, payload
        ))),
    }
}

/// Forwards database notifications into a trigger queue.
pub struct PgTriggerListener {
    listener: PgListener,
}

impl PgTriggerListener {
    /// Connect and subscribe to both trigger channels.
    pub async fn connect(pool: &Pool<Postgres>) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(Error::Database)?;
        listener
            .listen_all([CHANNEL_CALCULATE_LABELS, CHANNEL_DATASET_NEW])
            .await
            .map_err(Error::Database)?;
        info!(
            subsystem = "db",
            component = "listener",
            op = "listen",
            "Listening for label recalculation triggers"
        );
        Ok(Self { listener })
    }

    /// Run until the sink is closed or the connection fails permanently.
    pub async fn run(mut self, sink: mpsc::Sender<RecalculationTrigger>) -> Result<()> {
        loop {
            let notification = self.listener.recv().await.map_err(Error::Database)?;
            let channel = notification.channel();
            let payload = notification.payload();

            let trigger = match parse_notification(channel, payload) {
                Ok(trigger) => trigger,
                Err(e) => {
                    error!(
                        subsystem = "db",
                        component = "listener",
                        channel,
                        error = %e,
                        "Dropping malformed trigger"
                    );
                    continue;
                }
            };

            debug!(
                subsystem = "db",
                component = "listener",
                channel,
                dataset_id = trigger.dataset_id(),
                "Received trigger"
            );

            if sink.send(trigger).await.is_err() {
                warn!(
                    subsystem = "db",
                    component = "listener",
                    "Trigger queue closed, stopping listener"
                );
                return Ok(());
            }
        }
    }

    pub fn spawn(self, sink: mpsc::Sender<RecalculationTrigger>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labeler_core::LabelSelector;

    #[test]
    fn test_parse_calculate_labels_notification() {
        let trigger = parse_notification("calculate_labels", "3;8").unwrap();
        assert_eq!(trigger.dataset_id(), 3);
        assert_eq!(trigger.selector(), LabelSelector::Single(8));
        assert!(trigger.is_recalculation());
    }

    #[test]
    fn test_parse_dataset_new_notification() {
        let trigger = parse_notification("dataset_new", "4;false").unwrap();
        assert_eq!(trigger.dataset_id(), 4);
        assert_eq!(trigger.selector(), LabelSelector::All);
        assert!(!trigger.is_recalculation());
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(parse_notification("calculate_labels", "3").is_err());
        assert!(parse_notification("calculate_labels", "a;b").is_err());
        assert!(parse_notification("dataset_new", "x").is_err());
        assert!(matches!(
            parse_notification("other", "1;2"),
            Err(Error::InvalidTrigger(_))
        ));
    }
}
