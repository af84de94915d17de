// Integration tests for the push and poll connectors against local servers

mod common;

use common::{printer, printing_frame, registry_with, RecordingSink};
use fleet_monitor::endpoint::EndpointResolver;
use fleet_monitor::notifier::Notifier;
use fleet_monitor::poller::PollConnector;
use fleet_monitor::projector::LifecycleState;
use fleet_monitor::realtime::{
    ConnectionManager, Connector, ManagerConfig, ManagerHandle, WsConnector,
};
use fleet_monitor::sink::{ConnectionState, Connectivity};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver(port: u16) -> EndpointResolver {
    EndpointResolver::new(port, "http://{host}:{port}", HashMap::new())
}

/// Manager over one printer at 127.0.0.1 that never retries during a test
fn spawn_manager(connector: Arc<dyn Connector>, sink: RecordingSink) -> ManagerHandle {
    // Registry is dropped right away; the manager keeps running without it
    let mut registry = registry_with(&[printer(1, "127.0.0.1:4408")]);
    let events = registry.subscribe();
    let (manager, _task) = ConnectionManager::spawn(
        registry.records().to_vec(),
        events,
        connector,
        Arc::new(sink),
        Notifier::disabled(),
        ManagerConfig {
            reconnect_delay: Duration::from_secs(600),
        },
    );
    manager
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_ws_channel_subscribes_and_streams_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let Some(Ok(Message::Text(subscribe))) = ws.next().await else {
            panic!("expected subscribe frame");
        };
        let request: Value = serde_json::from_str(&subscribe).unwrap();
        assert_eq!(request["method"], "printer.objects.subscribe");

        // Subscribe reply carries the initial status
        let reply = json!({
            "jsonrpc": "2.0",
            "result": { "eventtime": 1.0, "status": {
                "print_stats": { "state": "standby" },
                "heater_bed": { "temperature": 22.0, "target": 0.0 },
            }},
            "id": request["id"],
        });
        ws.send(Message::Text(reply.to_string())).await.unwrap();
        ws.send(Message::Text(printing_frame("vase.gcode", 0.25)))
            .await
            .unwrap();

        // Let the client read both frames, then hang up
        tokio::time::sleep(Duration::from_millis(300)).await;
        ws.close(None).await.unwrap();
    });

    let sink = RecordingSink::new();
    let connector = WsConnector::new(resolver(port), Duration::from_secs(2));
    let manager = spawn_manager(Arc::new(connector), sink.clone());
    manager.start_all();

    wait_for(|| {
        sink.latest(1)
            .map(|s| s.lifecycle == LifecycleState::Printing)
            .unwrap_or(false)
    })
    .await;
    let state = sink.latest(1).unwrap();
    assert_eq!(state.progress_fraction, Some(0.25));
    assert!(sink.lifecycles(1).contains(&LifecycleState::Ready));

    server.await.unwrap();
    wait_for(|| {
        sink.connectivity(1) == Some(Connectivity::Live(ConnectionState::Reconnecting))
    })
    .await;
    assert_eq!(sink.latest(1).unwrap().lifecycle, LifecycleState::Offline);
}

#[tokio::test]
async fn test_ws_open_failure_schedules_reconnect() {
    // Grab a free port and release it so nothing is listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let sink = RecordingSink::new();
    let connector = WsConnector::new(resolver(port), Duration::from_secs(2));
    let manager = spawn_manager(Arc::new(connector), sink.clone());
    manager.start_all();

    wait_for(|| {
        sink.connectivity(1) == Some(Connectivity::Live(ConnectionState::Reconnecting))
    })
    .await;
    let sessions = manager.sessions().await.unwrap();
    assert!(sessions[0].reconnect_pending);
}

#[tokio::test]
async fn test_poll_connector_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/printer/objects/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "eventtime": 1.0, "status": {
                "print_stats": { "state": "printing", "filename": "clip.gcode", "print_duration": 30.0 },
                "virtual_sdcard": { "progress": 0.6 },
                "display_status": { "progress": 0.1 },
            }}
        })))
        .mount(&server)
        .await;

    let port = server.address().port();
    let sink = RecordingSink::new();
    let connector = PollConnector::new(resolver(port), 1, Duration::from_secs(2));
    let manager = spawn_manager(Arc::new(connector), sink.clone());
    manager.start_all();

    wait_for(|| {
        sink.latest(1)
            .map(|s| s.lifecycle == LifecycleState::Printing)
            .unwrap_or(false)
    })
    .await;

    let state = sink.latest(1).unwrap();
    // Storage-card progress wins over the display status
    assert_eq!(state.progress_fraction, Some(0.6));
    assert_eq!(state.filename.as_deref(), Some("clip.gcode"));
    assert_eq!(
        sink.connectivity(1),
        Some(Connectivity::Live(ConnectionState::Subscribed))
    );

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap_or_default();
    assert!(query.contains("print_stats"));
    assert!(query.contains("virtual_sdcard"));
}

#[tokio::test]
async fn test_poll_failure_takes_reconnect_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/printer/objects/query"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let sink = RecordingSink::new();
    let connector = PollConnector::new(resolver(server.address().port()), 1, Duration::from_secs(2));
    let manager = spawn_manager(Arc::new(connector), sink.clone());
    manager.start_all();

    wait_for(|| {
        sink.connectivity(1) == Some(Connectivity::Live(ConnectionState::Reconnecting))
    })
    .await;
    assert_eq!(sink.latest(1).unwrap().lifecycle, LifecycleState::Offline);
}
