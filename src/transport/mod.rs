//! Partitioned log transport.
//!
//! The RPC layer only needs a small slice of a Kafka-like log: keyed
//! sends, consumer-group polling, and topic create/delete. Backends:
//! - memory: in-process partitioned log (default, used by tests)
//! - kafka: Apache Kafka via rdkafka (`--features kafka`)

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
mod partitioner;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
pub use memory::MemoryLog;
pub use partitioner::compute_partition;

/// Errors from the log transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("send to '{topic}' failed: {message}")]
    Send { topic: String, message: String },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("topic administration failed: {0}")]
    Admin(String),

    #[error("backend not available: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Traits
// ============================================================================

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Sends records. Records sharing a key land on the same partition.
pub trait LogProducer: Send + Sync {
    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> Result<()>;
}

/// Reads records for one consumer group member.
///
/// Polls block for at most `timeout` and may return an empty batch.
pub trait LogConsumer: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>>;
}

/// Factory for producers and consumers plus topic administration.
pub trait Log: Send + Sync {
    fn producer(&self) -> Result<Arc<dyn LogProducer>>;

    /// Joins `group` on `topic`. Partitions are shared among the group's members.
    fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>>;

    fn create_topic(&self, topic: &str) -> Result<()>;

    fn delete_topic(&self, topic: &str) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Log backend discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process log.
    #[default]
    Memory,
    /// Apache Kafka.
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Topic the server consumes requests from.
    pub request_topic: String,
    pub memory: MemoryConfig,
    pub kafka: KafkaConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Memory,
            request_topic: "request_topic".to_string(),
            memory: MemoryConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

/// In-process log configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Partitions per topic.
    pub partitions: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { partitions: 4 }
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Partitions for topics this process creates.
    pub partitions: i32,
    pub replication_factor: i32,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            partitions: 3,
            replication_factor: 1,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the log backend named by `config.messaging_type`.
///
/// Kafka requires `--features kafka`.
pub fn init_log(config: &MessagingConfig) -> Result<Arc<dyn Log>> {
    match config.messaging_type {
        MessagingType::Memory => {
            let log = MemoryLog::new(config.memory.partitions);
            info!(messaging_type = "memory", partitions = config.memory.partitions, "Log initialized");
            Ok(Arc::new(log))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let log = KafkaLog::new(config.kafka.clone())?;
                info!(messaging_type = "kafka", "Log initialized");
                Ok(Arc::new(log))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(TransportError::Unavailable(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
    }
}
