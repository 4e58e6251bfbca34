//! Outbound device commands.
//!
//! Commands go to one topic per device, derived from the configured template, at QoS 1 and
//! never retained. Failures are returned to the caller; retry policy belongs there.

use crate::mqtt_connection::{MessagePublisher, MqttError};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const INSTALL_CODE_PLACEHOLDER: &str = "{install_code}";

/// Errors that can occur while publishing a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid install code {0:?}")]
    InvalidInstallCode(String),

    #[error("failed to serialize command: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] MqttError),
}

/// Publishes JSON commands to individual devices
pub struct CommandPublisher {
    publisher: Arc<dyn MessagePublisher>,
    topic_template: String,
}

impl CommandPublisher {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic_template: impl Into<String>) -> Self {
        Self {
            publisher,
            topic_template: topic_template.into(),
        }
    }

    /// Topic a device listens on for commands.
    ///
    /// Codes that would widen or split the topic (`/`, `+`, `#`) are rejected.
    pub fn command_topic(&self, install_code: &str) -> Result<String, CommandError> {
        if install_code.is_empty()
            || install_code
                .chars()
                .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
        {
            return Err(CommandError::InvalidInstallCode(install_code.to_string()));
        }

        Ok(self
            .topic_template
            .replace(INSTALL_CODE_PLACEHOLDER, install_code))
    }

    /// Serialize `command` and publish it to the device's command topic
    #[instrument(skip(self, command))]
    pub async fn publish<C>(&self, install_code: &str, command: &C) -> Result<(), CommandError>
    where
        C: Serialize + ?Sized,
    {
        let topic = self.command_topic(install_code)?;
        let payload = serde_json::to_vec(command)?;

        match self
            .publisher
            .publish(&topic, payload, QoS::AtLeastOnce, false)
            .await
        {
            Ok(()) => {
                metrics::counter!("mqtt.commands.published").increment(1);
                debug!(topic = %topic, "Command published");
                Ok(())
            }
            Err(e) => {
                metrics::counter!("mqtt.commands.failed").increment(1);
                warn!(topic = %topic, error = %e, "Failed to publish command");
                Err(e.into())
            }
        }
    }

    /// Whether the underlying connection can currently publish
    pub fn is_available(&self) -> bool {
        self.publisher.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_connection::MockMessagePublisher;
    use serde_json::json;

    const TEMPLATE: &str = "control/{install_code}/command";

    #[test]
    fn test_command_topic() {
        let publisher = CommandPublisher::new(Arc::new(MockMessagePublisher::new()), TEMPLATE);

        assert_eq!(
            publisher.command_topic("SWF-0042").unwrap(),
            "control/SWF-0042/command"
        );

        for code in ["", "a/b", "+", "#", "with space"] {
            assert!(matches!(
                publisher.command_topic(code),
                Err(CommandError::InvalidInstallCode(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_publish_uses_qos1_not_retained() {
        let mut mock = MockMessagePublisher::new();
        mock.expect_publish()
            .withf(|topic, payload, qos, retain| {
                let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
                topic == "control/SWF-0042/command"
                    && body == json!({"action": "mist", "duration_secs": 30})
                    && *qos == QoS::AtLeastOnce
                    && !*retain
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = CommandPublisher::new(Arc::new(mock), TEMPLATE);

        publisher
            .publish("SWF-0042", &json!({"action": "mist", "duration_secs": 30}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let mut mock = MockMessagePublisher::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(MqttError::NotConnected));

        let publisher = CommandPublisher::new(Arc::new(mock), TEMPLATE);

        let err = publisher
            .publish("SWF-0042", &json!({"action": "fan_on"}))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Publish(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_invalid_code_never_publishes() {
        let mut mock = MockMessagePublisher::new();
        mock.expect_publish().never();

        let publisher = CommandPublisher::new(Arc::new(mock), TEMPLATE);

        let err = publisher
            .publish("sensors/#", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidInstallCode(_)));
    }
}
