//! Kafka log backend.
//!
//! Sends block until the broker acknowledges the record, so a returned
//! `Ok` means the record is durable at `acks=all`. Keys go to Kafka
//! unchanged; the broker's default partitioner applies the same murmur2
//! routing as the in-process log.

use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, info};

use super::{KafkaConfig, Log, LogConsumer, LogProducer, LogRecord, Result, TransportError};

/// Upper bound on records returned by one poll.
const MAX_POLL_RECORDS: usize = 500;

pub struct KafkaLog {
    config: KafkaConfig,
    producer: Arc<KafkaProducer>,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaLog {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = build_producer_config(&config).create().map_err(|e| {
            TransportError::Connection(format!("Failed to create Kafka producer: {}", e))
        })?;
        let admin: AdminClient<DefaultClientContext> =
            base_config(&config).create().map_err(|e| {
                TransportError::Connection(format!("Failed to create Kafka admin client: {}", e))
            })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Connected to Kafka"
        );

        Ok(Self {
            config,
            producer: Arc::new(KafkaProducer { producer }),
            admin,
        })
    }
}

impl Log for KafkaLog {
    fn producer(&self) -> Result<Arc<dyn LogProducer>> {
        let producer: Arc<dyn LogProducer> = self.producer.clone();
        Ok(producer)
    }

    fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>> {
        let mut client = base_config(&self.config);
        client.set("group.id", group);
        client.set("enable.auto.commit", "true");
        client.set("auto.offset.reset", "earliest");

        let consumer: BaseConsumer = client.create().map_err(|e| {
            TransportError::Connection(format!("Failed to create Kafka consumer: {}", e))
        })?;
        consumer.subscribe(&[topic]).map_err(|e| {
            TransportError::Connection(format!("Failed to subscribe to {}: {}", topic, e))
        })?;

        debug!(topic = %topic, group = %group, "Kafka consumer subscribed");
        Ok(Box::new(KafkaConsumer { consumer }))
    }

    fn create_topic(&self, topic: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic,
            self.config.partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let results = block_on(self.admin.create_topics(&[new_topic], &AdminOptions::new()))
            .map_err(|e| TransportError::Admin(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(TransportError::Admin(format!("create {}: {}", name, code)))
                }
            }
        }
        debug!(topic = %topic, "Kafka topic ready");
        Ok(())
    }

    fn delete_topic(&self, topic: &str) -> Result<()> {
        let results = block_on(self.admin.delete_topics(&[topic], &AdminOptions::new()))
            .map_err(|e| TransportError::Admin(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
                Err((name, code)) => {
                    return Err(TransportError::Admin(format!("delete {}: {}", name, code)))
                }
            }
        }
        debug!(topic = %topic, "Kafka topic deleted");
        Ok(())
    }
}

// ============================================================================
// Producer / Consumer
// ============================================================================

struct KafkaProducer {
    producer: FutureProducer,
}

impl LogProducer for KafkaProducer {
    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> Result<()> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(&payload[..]);
        if let Some(key) = key {
            record = record.key(key);
        }

        let send_error = |message: String| TransportError::Send {
            topic: topic.to_string(),
            message,
        };

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| send_error(e.to_string()))?;

        match block_on(delivery) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(send_error(e.to_string())),
            Err(_) => Err(send_error("delivery cancelled".to_string())),
        }
    }
}

struct KafkaConsumer {
    consumer: BaseConsumer,
}

impl LogConsumer for KafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>> {
        let mut batch = Vec::new();
        let mut wait = timeout;
        while batch.len() < MAX_POLL_RECORDS {
            let Some(next) = self.consumer.poll(wait) else {
                break;
            };
            let message = next.map_err(|e| TransportError::Receive(e.to_string()))?;
            batch.push(LogRecord {
                topic: message.topic().to_string(),
                partition: message.partition().max(0) as u32,
                offset: message.offset().max(0) as u64,
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            });
            wait = Duration::ZERO;
        }
        Ok(batch)
    }
}

// ============================================================================
// Client configuration
// ============================================================================

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    apply_security_config(config, &mut client);
    client
}

fn build_producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = base_config(config);
    client.set("message.timeout.ms", "5000");
    client.set("acks", "all");
    client.set("enable.idempotence", "true");
    client
}

fn apply_security_config(config: &KafkaConfig, client: &mut ClientConfig) {
    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }
    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }
    if let Some(ref ca_location) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }
}
