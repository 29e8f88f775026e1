//! RPC server: request consumers feeding a handler worker pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backon::BackoffBuilder;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use super::{codes, HandlerTable, ResponseDispatcher, Result, RpcServerConfig};
use crate::model::{DecodeError, Request, RequestType, Response};
use crate::ring::{ProducerMode, RingBuffer, WorkHandler, WorkerPool};
use crate::transport::{Log, LogConsumer};
use crate::utils::retry::poll_backoff;

/// A decoded request, or what could be salvaged from an undecodable one.
type Inbound = std::result::Result<Request, DecodeError>;

/// Consumes the request topic and answers through each caller's reply topic.
///
/// Consumer threads decode records and publish them into a ring; worker
/// threads take them off the ring, run the handler registered for the
/// action, and send the response. With one consumer thread the ring runs
/// in single-producer mode.
pub struct RpcServer {
    request_topic: String,
    running: Arc<AtomicBool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    workers: WorkerPool<Inbound>,
    dispatcher: ResponseDispatcher,
}

impl RpcServer {
    pub fn start(
        config: &RpcServerConfig,
        request_topic: &str,
        log: Arc<dyn Log>,
        table: HandlerTable,
    ) -> Result<Self> {
        log.create_topic(request_topic)?;
        let dispatcher = ResponseDispatcher::new(log.producer()?);

        let mode = if config.consumer_threads <= 1 {
            ProducerMode::Single
        } else {
            ProducerMode::Multi
        };
        let ring = Arc::new(RingBuffer::from_config(&config.ring, mode)?);

        let table = Arc::new(table);
        let handlers = (0..config.worker_threads)
            .map(|_| RequestWorker::new(Arc::clone(&table), dispatcher.clone()))
            .collect::<Result<Vec<_>>>()?;
        let workers = WorkerPool::start("rpc-worker", Arc::clone(&ring), handlers)?;

        let mut readers = Vec::with_capacity(config.consumer_threads);
        for _ in 0..config.consumer_threads.max(1) {
            readers.push(log.consumer(request_topic, &config.group_id)?);
        }

        let running = Arc::new(AtomicBool::new(true));
        let server = Self {
            request_topic: request_topic.to_string(),
            running: Arc::clone(&running),
            consumers: Mutex::new(Vec::new()),
            workers,
            dispatcher,
        };

        for (i, consumer) in readers.into_iter().enumerate() {
            let reader = RequestReader {
                log: Arc::clone(&log),
                topic: request_topic.to_string(),
                group: config.group_id.clone(),
                consumer,
                ring: Arc::clone(&ring),
                running: Arc::clone(&running),
                poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            };
            let handle = thread::Builder::new()
                .name(format!("rpc-consumer-{i}"))
                .spawn(move || reader.run())?;
            server.consumers.lock().push(handle);
        }

        info!(
            request_topic = %request_topic,
            consumer_threads = config.consumer_threads.max(1),
            worker_threads = config.worker_threads,
            actions = table.len(),
            "RPC server started"
        );
        Ok(server)
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Dispatcher for sending extra responses outside the handler path.
    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }

    /// Stops consuming, lets workers finish queued requests, and joins all threads.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            if consumer.join().is_err() {
                error!("Request consumer thread panicked");
            }
        }
        self.workers.shutdown();
        info!(request_topic = %self.request_topic, "RPC server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

// ============================================================================
// Consumer side
// ============================================================================

struct RequestReader {
    log: Arc<dyn Log>,
    topic: String,
    group: String,
    consumer: Box<dyn LogConsumer>,
    ring: Arc<RingBuffer<Inbound>>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl RequestReader {
    fn run(mut self) {
        let mut backoff = poll_backoff().build();
        while self.running.load(Ordering::Acquire) {
            match self.consumer.poll(self.poll_timeout) {
                Ok(records) => {
                    backoff = poll_backoff().build();
                    for record in records {
                        if let Err(e) = self.ring.publish(Request::decode(&record.payload)) {
                            warn!(error = %e, "Request ring rejected record, stopping consumer");
                            return;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(5));
                    warn!(topic = %self.topic, error = %e, ?delay, "Request poll failed, reconnecting");
                    thread::sleep(delay);
                    match self.log.consumer(&self.topic, &self.group) {
                        Ok(consumer) => self.consumer = consumer,
                        Err(e) => warn!(topic = %self.topic, error = %e, "Reconnect failed"),
                    }
                }
            }
        }
        debug!(topic = %self.topic, "Request consumer stopped");
    }
}

// ============================================================================
// Worker side
// ============================================================================

struct RequestWorker {
    table: Arc<HandlerTable>,
    dispatcher: ResponseDispatcher,
    runtime: tokio::runtime::Runtime,
}

impl RequestWorker {
    fn new(table: Arc<HandlerTable>, dispatcher: ResponseDispatcher) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            table,
            dispatcher,
            runtime,
        })
    }

    /// Produces the response for `request`, or `None` for pushes.
    fn process(&self, request: Request) -> Option<Response> {
        let correlation_id = request.correlation_id.clone();
        let request_type = request.request_type;

        if request_type == RequestType::Ping {
            return Some(Response::empty(correlation_id));
        }

        let response = match request.action() {
            None => Response::error(
                correlation_id.clone(),
                codes::BAD_REQUEST,
                "request has no body",
            ),
            Some(action) => match self.table.resolve(action) {
                None => {
                    warn!(action = %action, "No handler registered for action");
                    Response::error(
                        correlation_id.clone(),
                        codes::UNSUPPORTED,
                        format!("unsupported action {action}"),
                    )
                }
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    let outcome = self
                        .runtime
                        .block_on(AssertUnwindSafe(handler.handle(request)).catch_unwind());
                    match outcome {
                        Ok(Ok(mut response)) => {
                            response.correlation_id = correlation_id.clone();
                            response
                        }
                        Ok(Err(e)) => {
                            debug!(action = %action, error = %e, "Handler rejected request");
                            Response::error(correlation_id.clone(), e.code(), e.to_string())
                        }
                        Err(_) => {
                            error!(action = %action, "Handler panicked");
                            Response::error(
                                correlation_id.clone(),
                                codes::INTERNAL,
                                "handler panicked",
                            )
                        }
                    }
                }
            },
        };

        (request_type != RequestType::Push).then_some(response)
    }

    fn reply(&self, reply_to: Option<&str>, key: Option<&str>, response: Response) {
        let Some(reply_to) = reply_to else {
            debug!(correlation_id = %response.correlation_id, "No reply topic, dropping response");
            return;
        };
        if let Err(e) = self.dispatcher.send(reply_to, &response, key) {
            error!(
                reply_to = %reply_to,
                correlation_id = %response.correlation_id,
                error = %e,
                "Failed to send response"
            );
        }
    }
}

impl WorkHandler<Inbound> for RequestWorker {
    fn on_event(&mut self, inbound: Inbound) {
        match inbound {
            Ok(request) => {
                let span = info_span!(
                    "rpc.request",
                    correlation_id = %request.correlation_id,
                    action = ?request.action(),
                );
                let _entered = span.enter();

                let reply_to = request.reply_to.clone();
                let key = request.partition_key.clone();
                if let Some(response) = self.process(request) {
                    self.reply(reply_to.as_deref(), key.as_deref(), response);
                }
            }
            Err(rejected) => {
                warn!(
                    correlation_id = ?rejected.correlation_id,
                    error = %rejected.source,
                    "Undecodable request"
                );
                if rejected.request_type == RequestType::Push {
                    return;
                }
                let Some(correlation_id) = rejected.correlation_id.clone() else {
                    return;
                };
                let code = if rejected.is_unknown_action() {
                    codes::UNSUPPORTED
                } else {
                    codes::BAD_REQUEST
                };
                let response = Response::error(correlation_id, code, rejected.source.to_string());
                self.reply(
                    rejected.reply_to.as_deref(),
                    rejected.partition_key.as_deref(),
                    response,
                );
            }
        }
    }
}
