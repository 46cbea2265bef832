//! Session behaviour against a registry node with scripted answers

mod common;

use common::*;
use dubbo_registry::{ClientEvent, Error, RegistryClient};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const KEY: &str = "com.test.TestService:1.0.0";

/// Accept everything except the first `failures` requests of `kind`
fn failing_first(
    kind: &'static str,
    failures: usize,
) -> impl Fn(&Value) -> Answer + Send + Sync + 'static {
    let seen = AtomicUsize::new(0);
    move |request| {
        if request_kind(request) == kind && seen.fetch_add(1, Ordering::SeqCst) < failures {
            Answer::failed()
        } else {
            accept_all(request)
        }
    }
}

async fn wait_for_requests(registry: &ScriptedRegistry, kind: &str, count: usize) {
    wait_until(move || async move { registry.count(kind) == count }).await;
}

async fn wait_for_closed(registry: &ScriptedRegistry, count: usize) {
    wait_until(move || async move { registry.closed_connections() == count }).await;
}

async fn client_for(registry: &ScriptedRegistry) -> RegistryClient {
    RegistryClient::new(client_config(&[registry.local_addr()]))
        .await
        .unwrap()
}

#[smol_potat::test]
async fn test_close_during_login_is_terminal() {
    let registry = ScriptedRegistry::start(|request| {
        let answer = accept_all(request);
        if request_kind(request) == "login" {
            answer.after(Duration::from_millis(500))
        } else {
            answer
        }
    })
    .await;
    let client = client_for(&registry).await;

    let (ready, ()) = futures::join!(client.ready(), async {
        smol::Timer::after(Duration::from_millis(150)).await;
        client.close().await;
    });

    assert!(matches!(ready, Err(Error::NotConnected)), "ready returned {ready:?}");
    assert!(!client.is_connected().await);
    wait_for_closed(&registry, 1).await;

    // The delayed login reply lands on a closed socket
    smol::Timer::after(Duration::from_millis(600)).await;
    assert!(!client.is_connected().await);
    assert_eq!(registry.count("login"), 1);
}

#[smol_potat::test]
async fn test_unsubscribe_cancels_pending_subscribe_retry() {
    let registry = ScriptedRegistry::start(failing_first("register", 1)).await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;

    let recorder = Recorder::new();
    client.subscribe(&service(), recorder.listener()).await.unwrap();
    wait_for_requests(&registry, "register", 1).await;

    smol::Timer::after(Duration::from_millis(50)).await;
    client.unsubscribe(&service(), None).await.unwrap();

    // Long enough for the failed subscribe to have been retried twice
    smol::Timer::after(RETRY_PERIOD * 4).await;
    assert_eq!(
        registry.kinds(),
        ["login", "register", "unregister", "unsubscribe"]
    );
    assert!(recorder.drain().is_empty());

    client.close().await;
}

#[smol_potat::test]
async fn test_unpublish_cancels_pending_register_retry() {
    let registry = ScriptedRegistry::start(failing_first("register", 1)).await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;

    client.publish(&provider()).await.unwrap();
    wait_for_requests(&registry, "register", 1).await;
    client.unpublish(&provider()).await.unwrap();

    smol::Timer::after(RETRY_PERIOD * 4).await;
    assert_eq!(registry.kinds(), ["login", "register", "unregister"]);

    client.close().await;
}

#[smol_potat::test]
async fn test_failed_register_retried_until_accepted() {
    let registry = ScriptedRegistry::start(failing_first("register", 2)).await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;

    client.publish(&provider()).await.unwrap();
    wait_for_requests(&registry, "register", 3).await;

    smol::Timer::after(RETRY_PERIOD * 4).await;
    assert_eq!(registry.count("register"), 3);
    assert!(client.is_connected().await);

    client.close().await;
}

#[smol_potat::test]
async fn test_server_message_raises_one_error_event() {
    let registry = ScriptedRegistry::start(accept_all).await;
    let client = client_for(&registry).await;
    let events = client.events();
    client.ready().await.unwrap();

    let first = timeout(events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, ClientEvent::LoggedIn(_)));

    registry.push(json!({"message": "registry going down for maintenance"}));
    let event = timeout(events.recv()).await.unwrap().unwrap();
    match event {
        ClientEvent::Error(error) => assert!(
            matches!(&*error, Error::ServerReported(message) if message == "registry going down for maintenance"),
            "unexpected error {error}"
        ),
        other => panic!("Expected an error event, got {other:?}"),
    }

    smol::Timer::after(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert!(client.is_connected().await);

    client.close().await;
}

#[smol_potat::test]
async fn test_sync_push_without_current_node_moves_session() {
    let target = start_server(Vec::new()).await;
    let target_port = target.local_addr().port();
    let registry = ScriptedRegistry::start(accept_all).await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;

    let recorder = Recorder::new();
    client.subscribe(&service(), recorder.listener()).await.unwrap();
    assert!(recorder.next().await.is_empty());

    registry.push(json!({"sync": [format!("127.0.0.1:{target_port}")]}));

    wait_for_closed(&registry, 1).await;
    let client = &client;
    wait_until(move || async move {
        client.is_connected().await
            && client
                .current_registry()
                .await
                .is_some_and(|addr| addr.port == target_port)
    })
    .await;
    // Subscriptions follow the session to the new node
    wait_for_subscribers(&target, KEY, 1).await;

    client.close().await;
    target.close().await;
}

#[smol_potat::test]
async fn test_unversioned_registry_gets_service_key_requests() {
    let registry = ScriptedRegistry::start(|request| match request_kind(request).as_str() {
        "login" => Answer::ok(),
        _ => accept_all(request),
    })
    .await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;
    assert!(client.is_old_registry().await);

    client.publish(&provider()).await.unwrap();
    let recorder = Recorder::new();
    client.subscribe(&service(), recorder.listener()).await.unwrap();
    wait_for_requests(&registry, "subscribe", 1).await;

    let requests = registry.requests();
    let bodies: Vec<(&str, &Value)> = requests
        .iter()
        .filter_map(|request| request.as_object()?.iter().next())
        .map(|(kind, body)| (kind.as_str(), body))
        .collect();

    let (_, register) = bodies
        .iter()
        .find(|(kind, body)| *kind == "register" && body.to_string().contains("side=provider"))
        .expect("provider register not sent");
    let parameters = register[KEY].as_str().expect("register not keyed by service");
    assert!(parameters.contains("interface=com.test.TestService"));
    assert!(!parameters.contains("dubbo://"));

    let (_, subscribe) = bodies
        .iter()
        .find(|(kind, _)| *kind == "subscribe")
        .expect("subscribe not sent");
    assert_eq!(subscribe.as_object().map(|map| map.len()), Some(1));
    assert!(subscribe[KEY].as_str().is_some_and(|p| p.contains("side=consumer")));

    client.close().await;
}

#[smol_potat::test]
async fn test_failed_subscribe_retries_both_steps() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counted = failures.clone();
    let registry = ScriptedRegistry::start(move |request| {
        if request_kind(request) == "subscribe" && counted.fetch_add(1, Ordering::SeqCst) == 0 {
            Answer::failed()
        } else {
            accept_all(request)
        }
    })
    .await;
    let client = ready_client(client_config(&[registry.local_addr()])).await;

    let recorder = Recorder::new();
    client.subscribe(&service(), recorder.listener()).await.unwrap();
    assert!(recorder.next().await.is_empty());

    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(
        registry.kinds(),
        ["login", "register", "subscribe", "register", "subscribe"]
    );

    client.close().await;
}
