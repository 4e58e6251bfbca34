use crate::device_registry::DeviceRegistry;
use crate::mqtt_connection::InboundMessage;
use crate::sensor_store::{SensorReading, SensorStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument, Span};

/// Telemetry message published by a field sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub install_code: String,
    /// Temperature in degrees Celsius
    pub suhu: f64,
    /// Relative humidity in percent
    pub kelembaban: f64,
    /// RFC 3339 capture time; arrival time is used when absent or malformed
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Why a message was dropped
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to decode telemetry payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("telemetry payload has an empty install_code")]
    MissingInstallCode,

    #[error("unknown install code {0}")]
    UnknownDevice(String),

    #[error("device lookup failed: {0:#}")]
    Lookup(anyhow::Error),

    #[error("failed to store reading: {0:#}")]
    Store(anyhow::Error),
}

impl IngestError {
    /// Metric label for the drop reason
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Decode(_) | IngestError::MissingInstallCode => "decode",
            IngestError::UnknownDevice(_) => "unknown_device",
            IngestError::Lookup(_) => "lookup",
            IngestError::Store(_) => "store",
        }
    }
}

/// Decodes, authorizes and persists telemetry, one message at a time.
///
/// Delivery is at-most-once: every failure drops the message after logging it.
pub struct TelemetryIngestor {
    registry: Arc<dyn DeviceRegistry>,
    store: Arc<dyn SensorStore>,
}

impl TelemetryIngestor {
    pub fn new(registry: Arc<dyn DeviceRegistry>, store: Arc<dyn SensorStore>) -> Self {
        Self { registry, store }
    }

    /// Consume inbound messages until the channel closes or `shutdown` fires
    pub async fn run(&self, mut messages: mpsc::Receiver<InboundMessage>, shutdown: CancellationToken) {
        info!("Telemetry ingestion started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Telemetry ingestion cancelled");
                    break;
                }
                message = messages.recv() => {
                    match message {
                        Some(message) => self.process(&message).await,
                        None => {
                            debug!("Inbound channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("Telemetry ingestion stopped");
    }

    /// Handle one message, logging instead of returning the failure
    pub async fn process(&self, message: &InboundMessage) {
        // Root span per message, independent of the ingestion task
        let span = info_span!(
            parent: Span::none(),
            "telemetry_message",
            topic = %message.topic,
            payload_size = message.payload.len(),
        );

        async {
            metrics::counter!("telemetry.messages.received").increment(1);

            match self.handle(message).await {
                Ok(reading) => {
                    metrics::counter!("telemetry.messages.stored").increment(1);
                    debug!(
                        install_code = %reading.install_code,
                        timestamp = %reading.timestamp,
                        "Telemetry reading stored"
                    );
                }
                Err(e) => {
                    metrics::counter!("telemetry.messages.dropped", "reason" => e.reason())
                        .increment(1);
                    warn!(error = %e, reason = e.reason(), "Dropping telemetry message");
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Decode, authorize and append one message
    #[instrument(skip(self, message), fields(install_code = tracing::field::Empty))]
    pub async fn handle(&self, message: &InboundMessage) -> Result<SensorReading, IngestError> {
        let payload: TelemetryPayload = serde_json::from_slice(&message.payload)?;

        let install_code = payload.install_code.trim();
        if install_code.is_empty() {
            return Err(IngestError::MissingInstallCode);
        }
        Span::current().record("install_code", install_code);

        let registered = self
            .registry
            .is_registered(install_code)
            .await
            .map_err(IngestError::Lookup)?;
        if !registered {
            return Err(IngestError::UnknownDevice(install_code.to_string()));
        }

        let reading = SensorReading {
            install_code: install_code.to_string(),
            temperature: payload.suhu,
            humidity: payload.kelembaban,
            timestamp: resolve_timestamp(payload.timestamp.as_deref(), message.received_at),
        };

        self.store
            .append(&reading)
            .await
            .map_err(IngestError::Store)?;

        Ok(reading)
    }
}

/// Payload timestamp if it parses as RFC 3339, otherwise the arrival time
pub fn resolve_timestamp(raw: Option<&str>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match raw {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                debug!(timestamp = raw, error = %e, "Unparseable timestamp, using arrival time");
                received_at
            }
        },
        None => received_at,
    }
}
