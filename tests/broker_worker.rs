//! End-to-end request delegation between a RequestBroker and a WorkerLoop
//! over the in-process bus.

use market_relay::error::{BrokerError, ToolError};
use market_relay::pubsub::{handler_fn, ChannelConfig, InMemoryBus, MessageBus, RequestBroker, WorkerLoop};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const REQUESTS: &str = "test:requests";
const RESPONSES: &str = "test:responses";

fn channels() -> ChannelConfig {
    ChannelConfig::new(REQUESTS, RESPONSES)
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn test_worker(bus: &InMemoryBus) -> WorkerLoop {
    let mut worker = WorkerLoop::new(Arc::new(bus.clone()), channels());
    worker
        .register_handler(
            "echo",
            handler_fn(|args| async move {
                let message = args.get("message").cloned().unwrap_or(Value::Null);
                Ok::<_, ToolError>(json!({ "echo": message }))
            }),
        )
        .register_handler(
            "slow_tool",
            handler_fn(|args| async move {
                let value = args.get("value").and_then(Value::as_i64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ToolError>(json!({ "result": value * 2 }))
            }),
        )
        .register_handler(
            "sleepy",
            handler_fn(|_| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, ToolError>(json!("sleepy done"))
            }),
        )
        .register_handler(
            "quick",
            handler_fn(|_| async move { Ok::<_, ToolError>(json!("quick done")) }),
        )
        .register_handler(
            "failing_tool",
            handler_fn(|_| async move {
                Err::<Value, _>(ToolError::Fatal("Handler error: bad input".to_string()))
            }),
        );
    worker
}

/// Spawns the worker and waits until it is subscribed.
async fn spawn_worker(bus: &InMemoryBus, worker: WorkerLoop) -> JoinHandle<Result<(), BrokerError>> {
    let before = bus.subscriber_count(REQUESTS);
    let handle = tokio::spawn(async move { worker.start_worker().await });
    while bus.subscriber_count(REQUESTS) == before {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle
}

#[tokio::test]
async fn test_publish_request_and_response() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    let result = broker
        .publish_request("echo", args(json!({"message": "hello"})), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result, json!({"echo": "hello"}));
    assert_eq!(broker.pending_count(), 0);
    worker.abort();
}

#[tokio::test]
async fn test_request_timeout_without_worker() {
    let bus = InMemoryBus::default();
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    let started = Instant::now();
    let err = broker
        .publish_request("nonexistent_tool", Map::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        BrokerError::Timeout { timeout, .. } => assert_eq!(*timeout, Duration::from_secs(1)),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(err.to_string().contains("timed out"));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1500));
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn test_worker_handles_unknown_tool() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    let err = broker
        .publish_request("unknown_tool", Map::new(), Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        BrokerError::Remote(msg) => {
            assert!(msg.contains("Unknown tool"));
            assert!(msg.contains("unknown_tool"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
    worker.abort();
}

#[tokio::test]
async fn test_worker_handles_handler_exception() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    let err = broker
        .publish_request("failing_tool", args(json!({"arg": "test"})), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(&err, BrokerError::Remote(msg) if msg.contains("Handler error")));
    assert!(!err.is_retryable());
    worker.abort();
}

#[tokio::test]
async fn test_multiple_concurrent_requests() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = Arc::new(RequestBroker::new(Arc::new(bus.clone()), channels()));

    let calls = (0..5).map(|i| {
        let broker = Arc::clone(&broker);
        async move {
            broker
                .publish_request("slow_tool", args(json!({"value": i})), Duration::from_secs(5))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!({"result": i as i64 * 2}));
    }
    assert_eq!(broker.pending_count(), 0);
    worker.abort();
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = Arc::new(RequestBroker::new(Arc::new(bus.clone()), channels()));

    // Subscribe to responses to observe completion order.
    let mut observed = bus.subscribe(RESPONSES).await.unwrap();

    let slow = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .publish_request("sleepy", Map::new(), Duration::from_secs(5))
                .await
        })
    };
    // Make sure the slow request is published first.
    while broker.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = broker
        .publish_request("quick", Map::new(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(fast, json!("quick done"));
    assert_eq!(slow.await.unwrap().unwrap(), json!("sleepy done"));

    use futures::StreamExt;
    let first: Value = serde_json::from_slice(&observed.next().await.unwrap()).unwrap();
    assert_eq!(first["result"], json!("quick done"));
    worker.abort();
}

#[tokio::test]
async fn test_malformed_request_handling() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    bus.publish(REQUESTS, b"not valid json {[".to_vec()).await.unwrap();
    bus.publish(REQUESTS, br#"{"id": "x"}"#.to_vec()).await.unwrap();
    bus.publish(REQUESTS, vec![0xff, 0xfe, 0x00]).await.unwrap();
    bus.publish(RESPONSES, b"also garbage".to_vec()).await.unwrap();

    let result = broker
        .publish_request("echo", args(json!({"message": "still alive"})), Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "still alive"}));
    assert!(!worker.is_finished());
    worker.abort();
}

#[tokio::test]
async fn test_two_brokers_share_channels() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let first = RequestBroker::new(Arc::new(bus.clone()), channels());
    let second = RequestBroker::new(Arc::new(bus.clone()), channels());

    let (a, b) = tokio::join!(
        first.publish_request("echo", args(json!({"message": "a"})), Duration::from_secs(5)),
        second.publish_request("echo", args(json!({"message": "b"})), Duration::from_secs(5)),
    );

    assert_eq!(a.unwrap(), json!({"echo": "a"}));
    assert_eq!(b.unwrap(), json!({"echo": "b"}));
    worker.abort();
}

#[tokio::test]
async fn test_late_response_after_timeout_is_ignored() {
    let bus = InMemoryBus::default();
    let worker = spawn_worker(&bus, test_worker(&bus)).await;
    let broker = RequestBroker::new(Arc::new(bus.clone()), channels());

    let err = broker
        .publish_request("sleepy", Map::new(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The worker still answers; the broker must drop it quietly.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.pending_count(), 0);

    let result = broker
        .publish_request("quick", Map::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result, json!("quick done"));
    worker.abort();
}
