//! End-to-end bus tests: registration and routing, request/reply
//! correlation, subscriber fan-out, eviction of dropped connections, frame
//! rejection, and cross-orchestrator delivery through the bridge.

#![cfg(unix)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;
use xstatenet_bus::client::MessageBusClient;
use xstatenet_bus::protocol::{decode_frame, socket_path, PipeMessage};
use xstatenet_bus::server::MessageBusServer;
use xstatenet_core::chart::MachineChart;
use xstatenet_core::config::OrchestratorConfig;
use xstatenet_core::machine::Machine;
use xstatenet_core::orchestrator::EventBusOrchestrator;
use xstatenet_core::registry::Registry;

fn unique_pipe() -> String {
    format!("xstatenet-test-{}", Uuid::now_v7())
}

async fn start_server(pipe: &str) {
    let server = MessageBusServer::bind(pipe).await.unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
}

/// Retry a correlated send until the server has processed the target's
/// registration; registration frames race plain sends from other clients.
async fn request_until_success(
    client: &MessageBusClient,
    source: &str,
    target: &str,
    event: &str,
) {
    for _ in 0..100 {
        let response = client
            .request(source, target, event, json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        if response.success {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{target} never became routable");
}

#[tokio::test]
async fn routes_events_to_the_registered_connection() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let mut alpha = MessageBusClient::connect(&pipe).await.unwrap();
    alpha.register("alpha").await.unwrap();

    let beta = MessageBusClient::connect(&pipe).await.unwrap();
    request_until_success(&beta, "beta", "alpha", "WARMUP").await;

    beta.send_event("beta", "alpha", "PING", json!({ "n": 7 }))
        .await
        .unwrap();

    // The warm-up request is delivered too; skip until PING arrives.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), alpha.next_event())
            .await
            .unwrap()
            .unwrap();
        if event.event_name == "PING" {
            assert_eq!(event.source_machine_id, "beta");
            assert_eq!(event.target_machine_id, "alpha");
            assert_eq!(event.payload["n"], 7);
            break;
        }
    }
}

#[tokio::test]
async fn correlated_send_gets_a_response() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let alpha = MessageBusClient::connect(&pipe).await.unwrap();
    alpha.register("alpha").await.unwrap();

    let beta = MessageBusClient::connect(&pipe).await.unwrap();
    request_until_success(&beta, "beta", "alpha", "ASK").await;

    // Unknown target: the response reports failure instead of silence.
    let response = beta
        .request("beta", "nobody", "ASK", json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!response.success);
    assert!(response.error.is_some());
}

#[tokio::test]
async fn uncorrelated_send_gets_no_response() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let alpha = MessageBusClient::connect(&pipe).await.unwrap();
    alpha.register("alpha").await.unwrap();
    alpha
        .send_event("alpha", "nobody", "SHOUT", json!({}))
        .await
        .unwrap();
    // Nothing arrives back: no Response frame, no echo.
    let mut alpha = alpha;
    let nothing = tokio::time::timeout(Duration::from_millis(200), alpha.next_event()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn subscribers_receive_copies() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let mut owner = MessageBusClient::connect(&pipe).await.unwrap();
    owner.register("alpha").await.unwrap();

    let mut watcher = MessageBusClient::connect(&pipe).await.unwrap();
    watcher.subscribe("alpha").await.unwrap();

    let sender = MessageBusClient::connect(&pipe).await.unwrap();
    request_until_success(&sender, "s", "alpha", "WARMUP").await;
    sender
        .send_event("s", "alpha", "NEWS", json!({}))
        .await
        .unwrap();

    for client in [&mut owner, &mut watcher] {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), client.next_event())
                .await
                .unwrap()
                .unwrap();
            if event.event_name == "NEWS" {
                break;
            }
        }
    }
}

#[tokio::test]
async fn dropped_connection_is_evicted() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let ghost = MessageBusClient::connect(&pipe).await.unwrap();
    ghost.register("ghosty").await.unwrap();

    let prober = MessageBusClient::connect(&pipe).await.unwrap();
    request_until_success(&prober, "p", "ghosty", "PROBE").await;

    drop(ghost);

    let mut evicted = false;
    for _ in 0..100 {
        let response = prober
            .request("p", "ghosty", "PROBE", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        if !response.success {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(evicted, "registration survived its connection");
}

#[tokio::test]
async fn malformed_frames_are_rejected_not_fatal() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    let stream = UnixStream::connect(socket_path(&pipe)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"this is not json\n").await.unwrap();
    write_half.flush().await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match decode_frame(&line).unwrap() {
        PipeMessage::Response(response) => {
            assert!(!response.success);
            assert!(response.error.is_some());
        }
        other => panic!("expected a rejection response, got {other:?}"),
    }

    // The connection is still usable after the rejection.
    write_half
        .write_all(
            br#"{"type":"Subscribe","payload":{"MachineId":"alpha"}}
"#,
        )
        .await
        .unwrap();
    write_half.flush().await.unwrap();
}

#[tokio::test]
async fn bridge_routes_deferred_sends_across_orchestrators() {
    let pipe = unique_pipe();
    start_server(&pipe).await;

    // Process 1: machine A, whose entry action targets a machine that only
    // exists in process 2.
    let a_chart = MachineChart::parse(
        r#"{ id: 'a', initial: 'idle', states: {
            idle: { on: { PUSH: 'calling' } },
            calling: { entry: 'callRemote' }
        } }"#,
    )
    .unwrap();
    let mut a_registry = Registry::new();
    a_registry.add_sync_action("callRemote", |_, _, orchestration| {
        orchestration.request_send("remote-b", "PING", json!({ "from": "A" }));
        Ok(())
    });
    let orch1 = Arc::new(EventBusOrchestrator::new(OrchestratorConfig {
        pool_size: 2,
        ..Default::default()
    }));
    orch1
        .register("A", Machine::new("A", Arc::new(a_chart), Arc::new(a_registry)))
        .unwrap();
    orch1.start_machine("A").await.unwrap();

    // Process 2: machine remote-b.
    let b_chart = MachineChart::parse(
        "{ id: 'b', initial: 'idle', states: { idle: { on: { PING: 'pinged' } }, pinged: {} } }",
    )
    .unwrap();
    let orch2 = Arc::new(EventBusOrchestrator::new(OrchestratorConfig {
        pool_size: 2,
        ..Default::default()
    }));
    orch2
        .register(
            "remote-b",
            Machine::new("remote-b", Arc::new(b_chart), Arc::new(Registry::new())),
        )
        .unwrap();
    orch2.start_machine("remote-b").await.unwrap();

    let client1 = MessageBusClient::connect(&pipe).await.unwrap();
    let client2 = MessageBusClient::connect(&pipe).await.unwrap();
    xstatenet_bus::bridge::attach(client1, orch1.clone(), &["A"]).await.unwrap();
    xstatenet_bus::bridge::attach(client2, orch2.clone(), &["remote-b"]).await.unwrap();

    // Wait until the server has processed remote-b's registration.
    let prober = MessageBusClient::connect(&pipe).await.unwrap();
    request_until_success(&prober, "probe", "remote-b", "WARMUP").await;

    orch1.send("test", "A", "PUSH", Value::Null).await.unwrap();

    let mut reached = false;
    for _ in 0..200 {
        if orch2.configuration_of("remote-b").await == Some(vec!["pinged".to_string()]) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "PING never crossed the bus");
}
