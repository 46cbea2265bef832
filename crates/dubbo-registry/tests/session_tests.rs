//! End-to-end subscribe / publish scenarios against a live registry server

mod common;

use common::*;
use dubbo_registry::{ClientEvent, RegistryClient};
use std::time::Duration;

const KEY: &str = "com.test.TestService:1.0.0";

fn is_test_provider(urls: &[String]) -> bool {
    urls.len() == 1
        && urls[0].starts_with(
            "dubbo://127.0.0.1:12200/com.test.TestService?application=test&dubbo=2.5.3",
        )
}

#[smol_potat::test]
async fn test_subscribe_before_publish_delivers_empty_list_once() {
    let server = start_server(Vec::new()).await;
    let consumer = ready_client(client_config(&[server.local_addr()])).await;

    let recorder = Recorder::new();
    consumer.subscribe(&service(), recorder.listener()).await.unwrap();

    assert!(recorder.next().await.is_empty());
    recorder.assert_quiet(Duration::from_millis(500)).await;

    consumer.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_publish_reaches_subscriber() {
    let server = start_server(Vec::new()).await;
    let registries = [server.local_addr()];
    let consumer = ready_client(client_config(&registries)).await;
    let publisher = ready_client(client_config(&registries)).await;

    let recorder = Recorder::new();
    consumer.subscribe(&service(), recorder.listener()).await.unwrap();
    assert!(recorder.next().await.is_empty());

    publisher.publish(&provider()).await.unwrap();
    let urls = recorder.next().await;
    assert!(is_test_provider(&urls), "unexpected providers {urls:?}");
    assert!(urls[0].contains("side=provider"));
    assert!(urls[0].contains("interface=com.test.TestService"));

    let registered = server.registry().providers(KEY).await;
    assert_eq!(registered.len(), 1);

    consumer.close().await;
    publisher.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_subscribe_after_publish_sees_provider() {
    let server = start_server(Vec::new()).await;
    let registries = [server.local_addr()];
    let publisher = ready_client(client_config(&registries)).await;
    publisher.publish(&provider()).await.unwrap();
    wait_for_providers(&server, KEY, 1).await;

    let consumer = ready_client(client_config(&registries)).await;
    let recorder = Recorder::new();
    consumer.subscribe(&service(), recorder.listener()).await.unwrap();

    let urls = recorder.next().await;
    assert!(is_test_provider(&urls), "unexpected providers {urls:?}");

    consumer.close().await;
    publisher.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_second_listener_gets_current_value() {
    let server = start_server(Vec::new()).await;
    let registries = [server.local_addr()];
    let consumer = ready_client(client_config(&registries)).await;
    let publisher = ready_client(client_config(&registries)).await;
    publisher.publish(&provider()).await.unwrap();

    let first = Recorder::new();
    consumer.subscribe(&service(), first.listener()).await.unwrap();
    first.next_matching(is_test_provider).await;

    let second = Recorder::new();
    consumer.subscribe(&service(), second.listener()).await.unwrap();
    let urls = second.next().await;
    assert!(is_test_provider(&urls));

    // Attaching another listener does not re-notify the first one
    first.assert_quiet(Duration::from_millis(300)).await;

    consumer.close().await;
    publisher.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_unsubscribe_last_listener_withdraws_subscription() {
    let server = start_server(Vec::new()).await;
    let registries = [server.local_addr()];
    let consumer = ready_client(client_config(&registries)).await;
    let publisher = ready_client(client_config(&registries)).await;

    let kept = Recorder::new();
    let dropped = Recorder::new();
    let kept_id = consumer.subscribe(&service(), kept.listener()).await.unwrap();
    let dropped_id = consumer.subscribe(&service(), dropped.listener()).await.unwrap();
    assert_ne!(kept_id, dropped_id);
    kept.next().await;

    consumer.unsubscribe(&service(), Some(dropped_id)).await.unwrap();
    publisher.publish(&provider()).await.unwrap();
    kept.next_matching(is_test_provider).await;

    consumer.unsubscribe(&service(), None).await.unwrap();
    wait_for_subscribers(&server, KEY, 0).await;

    let other = service().with_url("dubbo://127.0.0.2:12200/com.test.TestService");
    let second_provider = ready_client(client_config(&registries)).await;
    second_provider.publish(&other).await.unwrap();
    wait_for_providers(&server, KEY, 2).await;

    kept.assert_quiet(Duration::from_millis(300)).await;
    assert!(
        dropped.drain().iter().all(|urls| urls.is_empty()),
        "detached listener saw providers"
    );

    consumer.close().await;
    publisher.close().await;
    second_provider.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_publish_same_service_twice_registers_once() {
    let server = start_server(Vec::new()).await;
    let publisher = ready_client(client_config(&[server.local_addr()])).await;

    publisher.publish(&provider()).await.unwrap();
    publisher
        .publish(&service().with_url("dubbo://127.0.0.9:12200/com.test.TestService"))
        .await
        .unwrap();

    wait_for_providers(&server, KEY, 1).await;
    smol::Timer::after(Duration::from_millis(200)).await;
    let registered = server.registry().providers(KEY).await;
    assert_eq!(registered.len(), 1);
    assert!(registered[0].starts_with("dubbo://127.0.0.1:12200/"));

    publisher.close().await;
    server.close().await;
}

#[smol_potat::test]
async fn test_login_reports_version_and_event() {
    let server = start_server(Vec::new()).await;
    let client = RegistryClient::new(client_config(&[server.local_addr()])).await.unwrap();
    let events = client.events();
    assert!(client.is_old_registry().await);

    client.ready().await.unwrap();
    assert!(client.is_connected().await);
    assert_eq!(client.registry_version().await.as_deref(), Some("2.5.3"));
    assert_eq!(
        client.current_registry().await.map(|addr| addr.port),
        Some(server.local_addr().port())
    );

    match timeout(events.recv()).await {
        Some(Ok(ClientEvent::LoggedIn(addr))) => assert_eq!(addr.port, server.local_addr().port()),
        other => panic!("expected login event, got {other:?}"),
    }

    client.close().await;
    assert!(!client.is_connected().await);
    server.close().await;
}
