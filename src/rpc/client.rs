//! RPC client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backon::BackoffBuilder;
use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{RequestResponseMatcher, Result, RpcClientConfig, RpcError};
use crate::model::{Request, RequestType, Response};
use crate::transport::{Log, LogConsumer, LogProducer};
use crate::utils::retry::poll_backoff;

/// Lifecycle of an [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connecting,
    Running,
    /// The startup ping never got an answer. Terminal.
    Unreachable,
    Stopped,
}

/// Sends requests to the server and routes responses back to callers.
///
/// ```ignore
/// let client = RpcClient::new(log, "request_topic", RpcClientConfig::default())?;
/// client.start()?;
/// let response = client.call_with_timeout(request, Duration::from_secs(5)).await?;
/// ```
pub struct RpcClient {
    log: Arc<dyn Log>,
    producer: Arc<dyn LogProducer>,
    request_topic: String,
    reply_topic: String,
    config: RpcClientConfig,
    matcher: Arc<RequestResponseMatcher>,
    state: Mutex<ClientState>,
    listener: Mutex<Option<ResponseListener>>,
}

impl RpcClient {
    pub fn new(log: Arc<dyn Log>, request_topic: impl Into<String>, config: RpcClientConfig) -> Result<Self> {
        let producer = log.producer()?;
        let reply_topic = config
            .reply_topic
            .clone()
            .unwrap_or_else(|| format!("{}{}", config.reply_topic_prefix, Uuid::new_v4()));
        Ok(Self {
            log,
            producer,
            request_topic: request_topic.into(),
            reply_topic,
            config,
            matcher: Arc::new(RequestResponseMatcher::new()),
            state: Mutex::new(ClientState::Created),
            listener: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Calls still waiting for their final response.
    pub fn pending_count(&self) -> usize {
        self.matcher.len()
    }

    /// Creates the reply topic, starts the response listeners, and pings the
    /// server until it answers.
    ///
    /// Blocks for up to `ping.max_attempts * ping.timeout_ms`. If the server
    /// never answers the client becomes [`ClientState::Unreachable`] and
    /// cannot be used.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Created {
                return Err(RpcError::NotRunning(*state));
            }
            *state = ClientState::Connecting;
        }

        if let Err(e) = self.connect() {
            *self.state.lock() = ClientState::Unreachable;
            self.stop_listener();
            return Err(e);
        }

        *self.state.lock() = ClientState::Running;
        info!(reply_topic = %self.reply_topic, "RPC client started");
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        self.log.create_topic(&self.request_topic)?;
        self.log.create_topic(&self.reply_topic)?;
        self.start_listener()?;

        let attempts = self.config.ping.max_attempts.max(1);
        let timeout = Duration::from_millis(self.config.ping.timeout_ms);
        for attempt in 1..=attempts {
            info!(attempt, max_attempts = attempts, "Pinging RPC server");
            if self.ping(timeout) {
                info!(attempt, "RPC server responded to ping");
                return Ok(());
            }
            if attempt < attempts {
                self.stop_listener();
                self.start_listener()?;
            }
        }

        error!(attempts, "RPC server is not reachable");
        Err(RpcError::Unreachable { attempts })
    }

    /// One ping round trip. True when the server answered successfully.
    fn ping(&self, timeout: Duration) -> bool {
        let request = Request::ping().with_reply_to(self.reply_topic.clone());
        let correlation_id = request.correlation_id.clone();
        let (tx, rx) = channel::bounded(1);
        self.matcher.register(correlation_id.clone(), move |response| {
            let _ = tx.try_send(response);
        });

        if let Err(e) = self.send(&request) {
            warn!(error = %e, "Ping send failed");
            self.matcher.remove(&correlation_id);
            return false;
        }

        let outcome = rx.recv_timeout(timeout);
        self.matcher.remove(&correlation_id);
        match outcome {
            Ok(response) if !response.is_failed() => true,
            Ok(response) => {
                warn!(error = ?response.error_message, "Ping answered with an error");
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "RPC server did not answer ping");
                false
            }
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Sends a request without registering for a response.
    pub fn push(&self, request: Request) -> Result<()> {
        self.ensure_running()?;
        let request = self.prepare(request, RequestType::Push)?;
        self.send(&request)
    }

    /// Sends a call; `callback` receives every response for it.
    ///
    /// The callback is registered before the request leaves, and removed
    /// again if sending fails. It runs on a response listener thread and
    /// must not block.
    pub fn call<F>(&self, request: Request, callback: F) -> Result<()>
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let request = self.prepare(request, RequestType::Call)?;
        let correlation_id = request.correlation_id.clone();

        self.matcher.register(correlation_id.clone(), callback);
        if let Err(e) = self.send(&request) {
            self.matcher.remove(&correlation_id);
            return Err(e);
        }
        Ok(())
    }

    /// Sends a call and waits for its first response.
    ///
    /// On timeout the pending call is removed, so a late response is dropped.
    pub async fn call_with_timeout(&self, request: Request, timeout: Duration) -> Result<Response> {
        let correlation_id = request.correlation_id.clone();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        self.call(request, move |response| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(response);
            }
        })?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.matcher.remove(&correlation_id);
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcError::Cancelled(correlation_id)),
            Err(_) => {
                debug!(correlation_id = %correlation_id, "Call timed out");
                Err(RpcError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    /// [`call_with_timeout`](Self::call_with_timeout) using the configured default.
    pub async fn call_default(&self, request: Request) -> Result<Response> {
        let timeout = self.config.call_timeout();
        self.call_with_timeout(request, timeout).await
    }

    /// Blocking variant of [`call_with_timeout`](Self::call_with_timeout)
    /// for callers outside an async runtime.
    pub fn call_blocking(&self, request: Request, timeout: Duration) -> Result<Response> {
        let correlation_id = request.correlation_id.clone();
        let (tx, rx) = channel::bounded(1);
        self.call(request, move |response| {
            let _ = tx.try_send(response);
        })?;

        let outcome = rx.recv_timeout(timeout);
        self.matcher.remove(&correlation_id);
        match outcome {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout {
                correlation_id,
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Cancelled(correlation_id)),
        }
    }

    /// Stops routing responses for `correlation_id`. Closes streaming calls.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.matcher.remove(correlation_id)
    }

    /// Stops the listeners, drops pending calls, and deletes the reply topic.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == ClientState::Stopped {
                return;
            }
            *state = ClientState::Stopped;
        }
        self.stop_listener();
        self.matcher.clear();
        if let Err(e) = self.log.delete_topic(&self.reply_topic) {
            warn!(reply_topic = %self.reply_topic, error = %e, "Failed to delete reply topic");
        }
        info!(reply_topic = %self.reply_topic, "RPC client stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            ClientState::Running => Ok(()),
            other => Err(RpcError::NotRunning(other)),
        }
    }

    fn prepare(&self, mut request: Request, request_type: RequestType) -> Result<Request> {
        if request.body.is_none() {
            return Err(RpcError::EmptyBody);
        }
        request.reply_to = Some(self.reply_topic.clone());
        request.request_type = request_type;
        Ok(request)
    }

    fn send(&self, request: &Request) -> Result<()> {
        let payload = request.encode()?;
        self.producer
            .send(&self.request_topic, request.partition_key.as_deref(), payload)?;
        Ok(())
    }

    fn start_listener(&self) -> Result<()> {
        let listener = ResponseListener::start(
            Arc::clone(&self.log),
            &self.reply_topic,
            self.config.response_consumer_threads.max(1),
            Duration::from_millis(self.config.poll_timeout_ms),
            Arc::clone(&self.matcher),
        )?;
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn stop_listener(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.shutdown();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().as_ref() {
            listener.running.store(false, Ordering::Release);
        }
    }
}

// ============================================================================
// Response listener
// ============================================================================

/// Threads polling the reply topic and feeding the matcher.
struct ResponseListener {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ResponseListener {
    fn start(
        log: Arc<dyn Log>,
        topic: &str,
        threads: usize,
        poll_timeout: Duration,
        matcher: Arc<RequestResponseMatcher>,
    ) -> Result<Self> {
        // The reply topic is private, so its name doubles as the group id.
        let consumers = (0..threads)
            .map(|_| log.consumer(topic, topic))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let running = Arc::new(AtomicBool::new(true));
        let mut listener = Self {
            running: Arc::clone(&running),
            threads: Vec::with_capacity(threads),
        };

        for (i, consumer) in consumers.into_iter().enumerate() {
            let reader = ResponseReader {
                log: Arc::clone(&log),
                topic: topic.to_string(),
                consumer,
                matcher: Arc::clone(&matcher),
                running: Arc::clone(&running),
                poll_timeout,
            };
            let spawned = thread::Builder::new()
                .name(format!("rpc-response-{i}"))
                .spawn(move || reader.run());
            match spawned {
                Ok(handle) => listener.threads.push(handle),
                Err(e) => {
                    listener.shutdown();
                    return Err(e.into());
                }
            }
        }
        Ok(listener)
    }

    fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Response listener thread panicked");
            }
        }
    }
}

struct ResponseReader {
    log: Arc<dyn Log>,
    topic: String,
    consumer: Box<dyn LogConsumer>,
    matcher: Arc<RequestResponseMatcher>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl ResponseReader {
    fn run(mut self) {
        let mut backoff = poll_backoff().build();
        while self.running.load(Ordering::Acquire) {
            match self.consumer.poll(self.poll_timeout) {
                Ok(records) => {
                    backoff = poll_backoff().build();
                    for record in records {
                        match Response::decode(&record.payload) {
                            Ok(response) => {
                                self.matcher.offer(response);
                            }
                            Err(e) => warn!(topic = %self.topic, error = %e, "Undecodable response"),
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(5));
                    warn!(topic = %self.topic, error = %e, ?delay, "Response poll failed, reconnecting");
                    thread::sleep(delay);
                    match self.log.consumer(&self.topic, &self.topic) {
                        Ok(consumer) => self.consumer = consumer,
                        Err(e) => warn!(topic = %self.topic, error = %e, "Reconnect failed"),
                    }
                }
            }
        }
        debug!(topic = %self.topic, "Response listener stopped");
    }
}
