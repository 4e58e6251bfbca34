use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the bridge service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Relational database (accounts, content, device registrations)
    pub database: DatabaseConfig,
    /// Time-series database (sensor readings)
    pub timescale: DatabaseConfig,
    /// Upload validation and consistency configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker address (tcp://host:port, mqtt://host:port or host:port)
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Optional username
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password
    #[serde(default)]
    pub password: Option<String>,
    /// Topic pattern for inbound sensor telemetry, wildcarded by device
    #[serde(default = "default_sensor_topic")]
    pub sensor_topic: String,
    /// Per-device command topic; `{install_code}` is substituted
    #[serde(default = "default_command_topic_template")]
    pub command_topic_template: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Timeout for a single connect attempt in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Timeout for queueing a publish in seconds
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Number of startup connection attempts
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    /// First startup retry delay in seconds
    #[serde(default = "default_connect_retry_initial_secs")]
    pub connect_retry_initial_secs: u64,
    /// Cap on the startup retry delay in seconds
    #[serde(default = "default_connect_retry_max_secs")]
    pub connect_retry_max_secs: u64,
    /// First delay before an automatic reconnect in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Cap on the automatic reconnect delay in seconds
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    /// Grace period for in-flight acknowledgments on disconnect in milliseconds
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Capacity of the client request queue and the inbound message channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploads
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; falls back to the default credential chain when unset
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
    /// Default presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_db_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Upload validation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Ceiling for images, videos and anything that is not a document
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Ceiling for documents (pdf, epub, ...)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
    /// Upper bound on the compensating delete after a failed record write
    #[serde(default = "default_compensation_timeout_secs")]
    pub compensation_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "swiflet-bridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "swiflet-backend".to_string()
}

fn default_sensor_topic() -> String {
    "sensors/+/data".to_string()
}

fn default_command_topic_template() -> String {
    "control/{install_code}/command".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_publish_timeout_secs() -> u64 {
    10
}

fn default_connect_max_attempts() -> u32 {
    5
}

fn default_connect_retry_initial_secs() -> u64 {
    1
}

fn default_connect_retry_max_secs() -> u64 {
    30
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_secs() -> u64 {
    600 // 10 minutes
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

fn default_channel_capacity() -> usize {
    100
}

fn default_bucket() -> String {
    "swiftlead-storage".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    2
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_document_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_compensation_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "swiflet-bridge")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/bridge").required(false))
            .add_source(config::File::with_name("/etc/swiflet/bridge").required(false))
            // SWIFLET__MQTT__BROKER -> mqtt.broker
            .add_source(
                config::Environment::with_prefix("SWIFLET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get the compensating delete bound as Duration
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.compensation_timeout_secs)
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn connect_retry_initial(&self) -> Duration {
        Duration::from_secs(self.connect_retry_initial_secs)
    }

    pub fn connect_retry_max(&self) -> Duration {
        Duration::from_secs(self.connect_retry_max_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            username: None,
            password: None,
            sensor_topic: default_sensor_topic(),
            command_topic_template: default_command_topic_template(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_retry_initial_secs: default_connect_retry_initial_secs(),
            connect_retry_max_secs: default_connect_retry_max_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            access_key: None,
            secret_key: None,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_document_bytes: default_max_document_bytes(),
            compensation_timeout_secs: default_compensation_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let mqtt = MqttConfig::default();
        assert_eq!(mqtt.sensor_topic, "sensors/+/data");
        assert_eq!(mqtt.command_topic_template, "control/{install_code}/command");
        assert_eq!(mqtt.connect_retry_initial(), Duration::from_secs(1));
        assert_eq!(mqtt.connect_retry_max(), Duration::from_secs(30));
        assert_eq!(mqtt.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(mqtt.reconnect_max_delay(), Duration::from_secs(600));
        assert_eq!(mqtt.disconnect_grace(), Duration::from_millis(250));
    }

    #[test]
    fn test_upload_ceilings() {
        let upload = UploadConfig::default();
        assert_eq!(upload.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(upload.max_document_bytes, 50 * 1024 * 1024);
        assert!(upload.max_document_bytes > upload.max_file_bytes);
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_override("database.url", "postgres://localhost/swiflet_db")
            .unwrap()
            .set_override("timescale.url", "postgres://localhost/swiflet_timeseries")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.s3.bucket, "swiftlead-storage");
        assert_eq!(config.mqtt.client_id, "swiflet-backend");
        assert_eq!(config.database.max_connections, 25);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.compensation_timeout(), Duration::from_secs(10));
    }
}
