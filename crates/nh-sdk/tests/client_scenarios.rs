//! End-to-end client scenarios against mock connectors.

use std::sync::Arc;
use std::time::Duration;

use nh_sdk::connectors::MockConnector;
use nh_sdk::{
    Client, ClientOptions, DeliveryStatus, ErrorCode, Message, PlatformConnector, RoutingRule,
    Target, TargetType,
};

fn message_to(platform: &str) -> Message {
    Message::builder()
        .title("A")
        .body("B")
        .priority(3)
        .target(Target::new(TargetType::Email, "a@x", platform))
        .build()
}

#[tokio::test]
async fn synchronous_success_end_to_end() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let receipt = client.send(message_to("mock")).await.unwrap();

    assert_eq!(receipt.results.len(), 1);
    let result = &receipt.results[0];
    assert!(result.success);
    assert_eq!(result.status, DeliveryStatus::Sent);
    assert_eq!(result.attempts, 1);
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_to_success() {
    let mock = Arc::new(MockConnector::fail_first(
        "mock",
        2,
        ErrorCode::PlatformUnavailable,
    ));
    let client = Client::new(
        ClientOptions::new().with_connector(mock.clone() as Arc<dyn PlatformConnector>),
    )
    .unwrap();

    let receipt = client.send(message_to("mock")).await.unwrap();

    let result = &receipt.results[0];
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(mock.calls(), 3);

    let stats = client.statistics();
    assert_eq!(stats.platforms["mock"].failures, 2);
    assert_eq!(stats.platforms["mock"].successes, 1);
}

#[tokio::test]
async fn non_retryable_failure_stops_after_one_call() {
    let mock = Arc::new(MockConnector::always_fail(
        "mock",
        ErrorCode::PlatformAuthFailed,
    ));
    let client = Client::new(
        ClientOptions::new().with_connector(mock.clone() as Arc<dyn PlatformConnector>),
    )
    .unwrap();

    let receipt = client.send(message_to("mock")).await.unwrap();

    let result = &receipt.results[0];
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::PlatformAuthFailed);
    assert_eq!(result.attempts, 1);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_deadline_reports_sys005_results() {
    let mock = Arc::new(MockConnector::new("mock").with_latency(Duration::from_secs(5)));
    let client = Client::new(
        ClientOptions::new()
            .with_connector(mock.clone() as Arc<dyn PlatformConnector>)
            .with_timeout(Duration::from_millis(50)),
    )
    .unwrap();

    let receipt = client.send(message_to("mock")).await.unwrap();

    assert_eq!(receipt.results.len(), 1);
    let result = &receipt.results[0];
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::Cancelled);
    // No retry after cancellation.
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn async_send_publishes_receipt_through_handle() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let handle = client.send_async(message_to("mock")).unwrap();
    assert!(!handle.message_id().is_empty());

    let receipt = handle.wait().await.unwrap();
    assert_eq!(receipt.results.len(), 1);
    assert!(receipt.results[0].success);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_handle_aborts_the_dispatch() {
    let mock = Arc::new(MockConnector::new("mock").with_latency(Duration::from_secs(60)));
    let client = Client::new(
        ClientOptions::new().with_connector(mock.clone() as Arc<dyn PlatformConnector>),
    )
    .unwrap();

    let handle = client.send_async(message_to("mock")).unwrap();
    // Let a worker pick the message up and enter the slow connector.
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.cancel();

    let error = handle.wait().await.unwrap_err();
    assert_eq!(error.code, ErrorCode::Cancelled);
}

#[tokio::test]
async fn batch_returns_one_receipt_per_message() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let receipts = client
        .send_batch(vec![
            message_to("mock"),
            message_to("mock"),
            message_to("mock"),
        ])
        .await
        .unwrap();

    assert_eq!(receipts.len(), 3);
    assert!(receipts.iter().all(|r| r.all_succeeded()));
}

#[tokio::test]
async fn routing_rule_fans_out_urgent_messages() {
    let client = Client::new(
        ClientOptions::new()
            .with_mock_notifier("mock")
            .with_routing(vec![RoutingRule::new("oncall")
                .when_priority_in([5])
                .add_target(Target::email("oncall@c", "mock"))]),
    )
    .unwrap();

    let mut urgent = message_to("mock");
    urgent.priority = 5;
    let receipt = client.send(urgent).await.unwrap();
    assert_eq!(receipt.results.len(), 2);
    assert!(receipt.results.iter().all(|r| r.success));

    let normal = client.send(message_to("mock")).await.unwrap();
    assert_eq!(normal.results.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_with_que001() {
    let mock = Arc::new(MockConnector::new("mock").with_latency(Duration::from_secs(3600)));
    let client = Client::new(
        ClientOptions::new()
            .with_connector(mock as Arc<dyn PlatformConnector>)
            .with_queue(1, 1),
    )
    .unwrap();

    let mut rejected = 0;
    let mut handles = Vec::new();
    for _ in 0..4 {
        match client.send_async(message_to("mock")) {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                assert_eq!(error.code, ErrorCode::QueueFull);
                rejected += 1;
            }
        }
    }
    assert!(rejected >= 1, "a bounded queue must push back");
    for handle in &handles {
        handle.cancel();
    }
}

#[tokio::test]
async fn closed_client_refuses_further_work() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();
    client.close().await.unwrap();

    let error = client.send(message_to("mock")).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::ShuttingDown);

    let error = client.send_async(message_to("mock")).unwrap_err();
    assert_eq!(error.code, ErrorCode::ShuttingDown);

    let error = client.close().await.unwrap_err();
    assert_eq!(error.code, ErrorCode::ShuttingDown);
}

#[tokio::test]
async fn platform_status_and_health_report_mock_as_healthy() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let status = client.platform_status("mock").await.unwrap();
    assert_eq!(status.name, "mock");
    assert!(status.healthy);

    let missing = client.platform_status("nope").await.unwrap_err();
    assert_eq!(missing.code, ErrorCode::PlatformNotFound);

    let health = client.health().await.unwrap();
    assert!(health.is_healthy());
    assert_eq!(health.summary.healthy, 1);
}

#[tokio::test]
async fn submission_validation_fails_fast() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let mut bad = message_to("mock");
    bad.priority = 0;
    let error = client.send(bad).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::PriorityOutOfRange);

    let mut no_platform = Message::builder().title("t").body("b").build();
    no_platform.targets.push(Target {
        kind: TargetType::User,
        value: "u".into(),
        platform: String::new(),
        metadata: Default::default(),
    });
    let error = client.send_async(no_platform).unwrap_err();
    assert_eq!(error.code, ErrorCode::NoValidTarget);
}

#[tokio::test]
async fn unknown_platform_target_fails_with_msg003() {
    let client = Client::new(ClientOptions::new().with_mock_notifier("mock")).unwrap();

    let receipt = client.send(message_to("elsewhere")).await.unwrap();
    assert_eq!(receipt.results.len(), 1);
    assert_eq!(
        receipt.results[0].error.as_ref().unwrap().code,
        ErrorCode::NoValidTarget
    );
}

#[tokio::test]
async fn two_clients_are_fully_independent() {
    let a = Client::new(ClientOptions::new().with_mock_notifier("alpha")).unwrap();
    let b = Client::new(ClientOptions::new().with_mock_notifier("beta")).unwrap();

    assert_eq!(a.registered_platforms(), vec!["alpha"]);
    assert_eq!(b.registered_platforms(), vec!["beta"]);

    // Closing one leaves the other fully operational.
    a.close().await.unwrap();
    let receipt = b.send(message_to("beta")).await.unwrap();
    assert!(receipt.all_succeeded());
}

#[tokio::test(start_paused = true)]
async fn statistics_accumulate_across_sends() {
    let mock = Arc::new(MockConnector::fail_first(
        "mock",
        1,
        ErrorCode::PlatformUnavailable,
    ));
    let client = Client::new(
        ClientOptions::new().with_connector(mock as Arc<dyn PlatformConnector>),
    )
    .unwrap();

    client.send(message_to("mock")).await.unwrap();
    client.send(message_to("mock")).await.unwrap();

    let stats = client.statistics();
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.failures, 1);
    assert!(stats.errors_by_code.contains_key("PLT002"));

    let queue = client.queue_stats();
    assert_eq!(queue.total_enqueued, 0, "sync path bypasses the queue");
}
