use super::*;
use crate::model::{
    Action, Body, CommandPayload, DeviceCommand, DeviceDeleteRequest, DeviceNotification,
    NotificationPayload, Request, Response, ResponseStatus,
};
use crate::transport::memory::MemoryLog;
use crate::transport::Log;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REQUEST_TOPIC: &str = "request_topic";

fn client_config(timeout_ms: u64, max_attempts: u32) -> RpcClientConfig {
    RpcClientConfig {
        poll_timeout_ms: 10,
        call_timeout_ms: 2_000,
        ping: PingConfig {
            timeout_ms,
            max_attempts,
        },
        ..RpcClientConfig::default()
    }
}

fn server_config() -> RpcServerConfig {
    RpcServerConfig {
        worker_threads: 2,
        poll_timeout_ms: 10,
        ..RpcServerConfig::default()
    }
}

fn insert(device: &str, name: &str) -> Request {
    Request::new(Body::NotificationInsertRequest(NotificationPayload {
        notification: DeviceNotification::new(device, name),
    }))
}

fn command(device: &str, name: &str) -> Request {
    Request::new(Body::CommandInsertRequest(CommandPayload {
        command: DeviceCommand::new(device, name),
    }))
}

fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Server with a handful of test handlers, plus a started client.
struct Harness {
    memory: MemoryLog,
    server: RpcServer,
    client: RpcClient,
    pushes: Arc<AtomicUsize>,
}

impl Harness {
    fn start() -> Self {
        let memory = MemoryLog::new(2);
        let log: Arc<dyn Log> = Arc::new(memory.clone());
        let pushes = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&pushes);
        let table = HandlerTable::builder()
            .register(
                Action::NotificationInsertRequest,
                handler_fn(move |request: Request| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    let Some(Body::NotificationInsertRequest(payload)) = request.body else {
                        return Err(HandlerError::BadRequest("wrong body".to_string()));
                    };
                    // Correlation id is deliberately wrong; the server restores it.
                    Ok(Response::success(
                        "not-the-caller",
                        Body::NotificationInsertResponse(payload),
                    ))
                }),
            )
            .register(
                Action::CommandInsertRequest,
                handler_fn(|request: Request| match request.body {
                    Some(Body::CommandInsertRequest(payload)) if payload.command.command == "panic" => {
                        panic!("handler blew up")
                    }
                    Some(Body::CommandInsertRequest(payload)) if payload.command.command == "slow" => {
                        thread::sleep(Duration::from_millis(300));
                        Ok(Response::success(
                            request.correlation_id,
                            Body::CommandInsertResponse(payload),
                        ))
                    }
                    _ => Err(HandlerError::NotFound("no such device".to_string())),
                }),
            )
            .build();

        let server = RpcServer::start(&server_config(), REQUEST_TOPIC, Arc::clone(&log), table).unwrap();
        let client = RpcClient::new(log, REQUEST_TOPIC, client_config(500, 5)).unwrap();
        client.start().unwrap();

        Self {
            memory,
            server,
            client,
            pushes,
        }
    }

    fn stop(self) {
        self.client.shutdown();
        self.server.shutdown();
    }
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_start_reaches_running_state() {
    let harness = Harness::start();

    assert_eq!(harness.client.state(), ClientState::Running);
    assert!(harness.client.reply_topic().starts_with("response_topic_"));
    assert_eq!(harness.client.pending_count(), 0);
    assert_eq!(harness.server.request_topic(), REQUEST_TOPIC);

    harness.stop();
}

#[tokio::test]
async fn test_call_returns_handler_response_with_echoed_correlation_id() {
    let harness = Harness::start();
    let request = insert("d1", "alarm");
    let correlation_id = request.correlation_id.clone();

    let response = harness
        .client
        .call_with_timeout(request, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.correlation_id, correlation_id);
    assert_eq!(response.status, ResponseStatus::Success);
    assert!(response.last);
    let Some(Body::NotificationInsertResponse(payload)) = response.body else {
        panic!("unexpected body");
    };
    assert_eq!(payload.notification.notification, "alarm");
    assert_eq!(harness.client.pending_count(), 0);

    harness.stop();
}

#[test]
fn test_call_blocking_round_trip() {
    let harness = Harness::start();

    let response = harness
        .client
        .call_blocking(insert("d1", "alarm").with_partition_key("d1"), Duration::from_secs(2))
        .unwrap();

    assert!(!response.is_failed());
    harness.stop();
}

#[tokio::test]
async fn test_handler_error_becomes_error_response() {
    let harness = Harness::start();

    let response = harness
        .client
        .call_with_timeout(command("d1", "reboot"), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(response.is_failed());
    assert_eq!(response.error_code, Some(codes::NOT_FOUND));
    assert!(response.error_message.unwrap().contains("no such device"));

    harness.stop();
}

#[tokio::test]
async fn test_handler_panic_becomes_internal_error_and_server_survives() {
    let harness = Harness::start();

    let response = harness
        .client
        .call_with_timeout(command("d1", "panic"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.error_code, Some(codes::INTERNAL));

    let response = harness
        .client
        .call_with_timeout(insert("d1", "alarm"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!response.is_failed());

    harness.stop();
}

#[tokio::test]
async fn test_unrouted_action_is_unsupported() {
    let harness = Harness::start();
    let request = Request::new(Body::DeviceDeleteRequest(DeviceDeleteRequest {
        device_id: "d1".to_string(),
    }));

    let response = harness
        .client
        .call_with_timeout(request, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.error_code, Some(codes::UNSUPPORTED));
    harness.stop();
}

#[test]
fn test_unknown_action_on_the_wire_gets_error_reply() {
    let harness = Harness::start();
    let log: Arc<dyn Log> = Arc::new(harness.memory.clone());
    let mut replies = log.consumer("raw_replies", "raw").unwrap();
    let raw = br#"{"action":"DEVICE_EXPLODE_REQUEST","correlationId":"raw-1","replyTo":"raw_replies","type":"call","body":{}}"#;

    log.producer()
        .unwrap()
        .send(REQUEST_TOPIC, None, raw.to_vec())
        .unwrap();

    let mut received = Vec::new();
    let start = Instant::now();
    while received.is_empty() && start.elapsed() < Duration::from_secs(2) {
        received = replies.poll(Duration::from_millis(50)).unwrap();
    }
    let response = Response::decode(&received[0].payload).unwrap();
    assert_eq!(response.correlation_id, "raw-1");
    assert_eq!(response.error_code, Some(codes::UNSUPPORTED));

    harness.stop();
}

#[test]
fn test_push_runs_handler_without_response() {
    let harness = Harness::start();
    let reply_topic = harness.client.reply_topic().to_string();
    let replies_before = harness.memory.record_count(&reply_topic);

    harness.client.push(insert("d1", "alarm")).unwrap();

    let pushes = Arc::clone(&harness.pushes);
    assert!(wait_until(Duration::from_secs(2), || pushes.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.memory.record_count(&reply_topic), replies_before);
    assert_eq!(harness.client.pending_count(), 0);

    harness.stop();
}

// ============================================================================
// Pending call table
// ============================================================================

#[tokio::test]
async fn test_timeout_leaves_no_pending_entry() {
    let harness = Harness::start();

    let result = harness
        .client
        .call_with_timeout(command("d1", "slow"), Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(RpcError::Timeout { .. })));
    assert_eq!(harness.client.pending_count(), 0);

    // The late response is discarded and later calls are unaffected.
    let response = harness
        .client
        .call_with_timeout(insert("d1", "alarm"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(matches!(response.body, Some(Body::NotificationInsertResponse(_))));

    harness.stop();
}

#[test]
fn test_callback_runs_once_for_final_response() {
    let harness = Harness::start();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    harness
        .client
        .call(insert("d1", "alarm"), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
    assert!(wait_until(Duration::from_secs(1), || harness.client.pending_count() == 0));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.stop();
}

#[test]
fn test_send_failure_unregisters_callback() {
    let harness = Harness::start();
    harness.memory.set_fail_on_send(true);

    let result = harness.client.call(insert("d1", "alarm"), |_| {});

    assert!(matches!(result, Err(RpcError::Transport(_))));
    assert_eq!(harness.client.pending_count(), 0);

    harness.memory.set_fail_on_send(false);
    harness.stop();
}

#[test]
fn test_cancel_is_idempotent() {
    let harness = Harness::start();
    let request = command("d1", "slow");
    let correlation_id = request.correlation_id.clone();
    harness.client.call(request, |_| {}).unwrap();
    assert_eq!(harness.client.pending_count(), 1);

    assert!(harness.client.cancel(&correlation_id));
    assert!(!harness.client.cancel(&correlation_id));
    assert_eq!(harness.client.pending_count(), 0);

    harness.stop();
}

#[test]
fn test_empty_body_is_rejected() {
    let harness = Harness::start();

    assert!(matches!(
        harness.client.call(Request::empty(), |_| {}),
        Err(RpcError::EmptyBody)
    ));
    assert!(matches!(
        harness.client.push(Request::empty()),
        Err(RpcError::EmptyBody)
    ));
    assert_eq!(harness.client.pending_count(), 0);

    harness.stop();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_calls_before_start_are_refused() {
    let log: Arc<dyn Log> = Arc::new(MemoryLog::new(1));
    let client = RpcClient::new(log, REQUEST_TOPIC, client_config(50, 1)).unwrap();

    assert!(matches!(
        client.push(insert("d1", "alarm")),
        Err(RpcError::NotRunning(ClientState::Created))
    ));
}

#[test]
fn test_exhausted_ping_is_fatal() {
    let memory = MemoryLog::new(1);
    let log: Arc<dyn Log> = Arc::new(memory.clone());
    let client = RpcClient::new(log, REQUEST_TOPIC, client_config(30, 3)).unwrap();

    let result = client.start();

    assert!(matches!(result, Err(RpcError::Unreachable { attempts: 3 })));
    assert_eq!(client.state(), ClientState::Unreachable);
    assert_eq!(memory.record_count(REQUEST_TOPIC), 3);
    assert_eq!(client.pending_count(), 0);
    assert!(matches!(
        client.call(insert("d1", "alarm"), |_| {}),
        Err(RpcError::NotRunning(ClientState::Unreachable))
    ));
    assert!(matches!(
        client.push(insert("d1", "alarm")),
        Err(RpcError::NotRunning(ClientState::Unreachable))
    ));
    assert!(client.start().is_err());
}

#[test]
fn test_late_server_is_found_by_retry() {
    let memory = MemoryLog::new(1);
    let log: Arc<dyn Log> = Arc::new(memory.clone());
    let client = Arc::new(RpcClient::new(Arc::clone(&log), REQUEST_TOPIC, client_config(100, 20)).unwrap());

    let starting = Arc::clone(&client);
    let started = thread::spawn(move || starting.start());
    thread::sleep(Duration::from_millis(150));
    let server = RpcServer::start(&server_config(), REQUEST_TOPIC, log, HandlerTable::default()).unwrap();

    started.join().unwrap().unwrap();
    assert_eq!(client.state(), ClientState::Running);

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_shutdown_deletes_reply_topic() {
    let harness = Harness::start();
    let reply_topic = harness.client.reply_topic().to_string();
    assert!(harness.memory.topic_exists(&reply_topic));

    harness.client.shutdown();

    assert!(!harness.memory.topic_exists(&reply_topic));
    assert_eq!(harness.client.state(), ClientState::Stopped);
    assert!(matches!(
        harness.client.push(insert("d1", "alarm")),
        Err(RpcError::NotRunning(ClientState::Stopped))
    ));
    harness.server.shutdown();
}

#[test]
fn test_configured_reply_topic_is_used() {
    let log: Arc<dyn Log> = Arc::new(MemoryLog::new(1));
    let config = RpcClientConfig {
        reply_topic: Some("node-a-replies".to_string()),
        ..client_config(50, 1)
    };

    let client = RpcClient::new(log, REQUEST_TOPIC, config).unwrap();

    assert_eq!(client.reply_topic(), "node-a-replies");
}
