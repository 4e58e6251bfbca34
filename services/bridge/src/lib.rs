//! Swiflet Bridge
//!
//! Connects the Swiflet facility backend to its two unreliable external resources: the MQTT
//! broker carrying sensor telemetry and device commands, and the S3-compatible object store
//! holding user uploads.
//!
//! ## Features
//!
//! - **Broker Lifecycle**: startup connect with bounded exponential backoff, automatic
//!   reconnection afterwards, resubscription on every reconnect, graceful disconnect
//! - **Telemetry Ingestion**: decode, device authorization and append to TimescaleDB,
//!   at-most-once
//! - **Device Commands**: JSON commands on one topic per device, QoS 1, not retained
//! - **Uploads**: extension allow-lists, per-category size ceilings, unique object keys,
//!   multipart uploads for large files, presigned read URLs
//! - **Compensating Writes**: an uploaded object is deleted again when the database record
//!   that should reference it cannot be written
//!
//! ## Architecture
//!
//! ```text
//! Devices ──▶ MQTT Broker ──▶ ConnectionManager ──channel──▶ TelemetryIngestor ──▶ TimescaleDB
//!                 ▲                                               │
//!                 │                                               ▼
//!          CommandPublisher                                 DeviceRegistry (PostgreSQL)
//!                 ▲
//!                 │
//! HTTP ──▶ Upload API ──▶ UploadCoordinator ──▶ ObjectStorageGateway ──▶ S3 / MinIO
//!                               │                    (validate, key, put/delete/presign)
//!                               ▼
//!                         ContentRecords (PostgreSQL)
//! ```

pub mod command_publisher;
pub mod config;
pub mod content_records;
pub mod database;
pub mod device_registry;
pub mod mqtt_connection;
pub mod object_key;
pub mod object_store;
pub mod sensor_store;
pub mod storage_gateway;
pub mod telemetry_ingest;
pub mod upload_api;
pub mod upload_coordinator;
pub mod upload_validator;

pub use command_publisher::{CommandError, CommandPublisher};
pub use config::Config;
pub use content_records::{ContentRecords, PgContentRecords, RecordNotFound};
pub use database::Databases;
pub use device_registry::{DeviceRegistry, PgDeviceRegistry};
pub use mqtt_connection::{
    ConnectionManager, ConnectionState, InboundMessage, MessagePublisher, MqttError,
};
pub use object_key::KeyGenerator;
pub use object_store::{ObjectStore, S3ObjectStore};
pub use sensor_store::{SensorReading, SensorStore, TimescaleSensorStore};
pub use storage_gateway::{ObjectStorageGateway, PresignedUrl, UploadError, UploadResult};
pub use telemetry_ingest::{IngestError, TelemetryIngestor, TelemetryPayload};
pub use upload_api::{ApiError, AppState};
pub use upload_coordinator::{CoordinatorError, IncomingFile, UploadCoordinator};
pub use upload_validator::{FileCategory, UploadValidator, ValidationError};
