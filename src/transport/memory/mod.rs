//! In-process partitioned log.
//!
//! Behaves like a single-broker Kafka cluster: topics are split into
//! partitions, keyed records are routed with murmur2, and each consumer
//! group keeps its own offsets. Partitions are divided among a group's
//! live members (member `k` of `n` owns partitions `p` with `p % n == k`),
//! so records sharing a key are always read by one member, in order.
//!
//! Topics are created on first use, as with `auto.create.topics.enable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{compute_partition, Log, LogConsumer, LogProducer, LogRecord, Result, TransportError};

/// Upper bound on records returned by one poll.
const MAX_POLL_RECORDS: usize = 500;

struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

struct Group {
    offsets: Vec<u64>,
    members: Vec<u64>,
}

struct Topic {
    partitions: Vec<Vec<StoredRecord>>,
    groups: HashMap<String, Group>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
        }
    }
}

struct Shared {
    partitions: u32,
    topics: Mutex<HashMap<String, Topic>>,
    signal: Condvar,
    fail_sends: AtomicBool,
    next_member: AtomicU64,
}

impl Shared {
    fn notify(&self) {
        self.signal.notify_all();
    }
}

/// In-process log backend.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                topics: Mutex::new(HashMap::new()),
                signal: Condvar::new(),
                fail_sends: AtomicBool::new(false),
                next_member: AtomicU64::new(0),
            }),
        }
    }

    /// Makes every subsequent send fail (for testing error paths).
    pub fn set_fail_on_send(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.shared.topics.lock().contains_key(topic)
    }

    /// Records written to `topic` across all partitions.
    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map(|t| t.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Live members of `group` on `topic`.
    pub fn group_members(&self, topic: &str, group: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(super::MemoryConfig::default().partitions)
    }
}

impl Log for MemoryLog {
    fn producer(&self) -> Result<Arc<dyn LogProducer>> {
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>> {
        let member = self.shared.next_member.fetch_add(1, Ordering::Relaxed);
        let consumer = MemoryConsumer {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.to_string(),
            member,
        };
        consumer.join();
        Ok(Box::new(consumer))
    }

    fn create_topic(&self, topic: &str) -> Result<()> {
        let partitions = self.shared.partitions;
        self.shared
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(partitions));
        debug!(topic = %topic, "Topic created");
        Ok(())
    }

    fn delete_topic(&self, topic: &str) -> Result<()> {
        self.shared.topics.lock().remove(topic);
        self.shared.notify();
        debug!(topic = %topic, "Topic deleted");
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    shared: Arc<Shared>,
}

impl LogProducer for MemoryProducer {
    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> Result<()> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send {
                topic: topic.to_string(),
                message: "simulated send failure".to_string(),
            });
        }

        let partitions = self.shared.partitions;
        let partition = compute_partition(key.map(str::as_bytes), partitions) as usize;
        {
            let mut topics = self.shared.topics.lock();
            let state = topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(partitions));
            state.partitions[partition].push(StoredRecord {
                key: key.map(str::to_string),
                payload,
            });
        }
        self.shared.notify();
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    member: u64,
}

impl MemoryConsumer {
    fn join(&self) {
        let mut topics = self.shared.topics.lock();
        self.fetch(&mut topics, 0);
    }

    /// Reads up to `max` records from the partitions this member owns,
    /// rejoining the group if the topic was recreated underneath it.
    fn fetch(&self, topics: &mut HashMap<String, Topic>, max: usize) -> Vec<LogRecord> {
        let partitions = self.shared.partitions;
        let Topic {
            partitions: logs,
            groups,
        } = topics
            .entry(self.topic.clone())
            .or_insert_with(|| Topic::new(partitions));
        let group = groups.entry(self.group.clone()).or_insert_with(|| Group {
            offsets: vec![0; logs.len()],
            members: Vec::new(),
        });
        if !group.members.contains(&self.member) {
            group.members.push(self.member);
        }

        let members = group.members.len();
        let Some(slot) = group.members.iter().position(|m| *m == self.member) else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        for (partition, log) in logs.iter().enumerate() {
            if partition % members != slot {
                continue;
            }
            let offset = &mut group.offsets[partition];
            while batch.len() < max && (*offset as usize) < log.len() {
                let record = &log[*offset as usize];
                batch.push(LogRecord {
                    topic: self.topic.clone(),
                    partition: partition as u32,
                    offset: *offset,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
                *offset += 1;
            }
        }
        batch
    }
}

impl LogConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>> {
        let deadline = Instant::now() + timeout;
        let mut topics = self.shared.topics.lock();
        loop {
            let batch = self.fetch(&mut topics, MAX_POLL_RECORDS);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            self.shared.signal.wait_until(&mut topics, deadline);
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        {
            let mut topics = self.shared.topics.lock();
            if let Some(group) = topics
                .get_mut(&self.topic)
                .and_then(|t| t.groups.get_mut(&self.group))
            {
                group.members.retain(|m| *m != self.member);
            }
        }
        self.shared.notify();
    }
}
