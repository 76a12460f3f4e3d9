//! End-to-end scenarios against a real Docker daemon and the sshd image.
//! These build images and start containers, so they are ignored by default:
//!
//! ```text
//! cargo test -p webterm-broker --test e2e_container -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use webterm_broker::{build_router, AppState, Broker, BrokerConfig, Supervisor};
use webterm_containers::{ContainerService, ContainersConfig, DockerManager};

async fn spawn_real_server() -> (String, String, Arc<dyn ContainerService>) {
    let (ws_url, http_url, containers, _supervisor) =
        spawn_real_server_with(BrokerConfig::default()).await;
    (ws_url, http_url, containers)
}

async fn spawn_real_server_with(
    config: BrokerConfig,
) -> (String, String, Arc<dyn ContainerService>, Arc<Supervisor>) {
    let manager = DockerManager::new(ContainersConfig::default()).expect("docker CLI available");
    let containers: Arc<dyn ContainerService> = Arc::new(manager);
    let broker = Broker::new(containers.clone(), config.clone());
    let supervisor = Supervisor::spawn(broker.clone(), containers.clone(), config);
    let app = build_router(AppState::new(containers.clone(), broker));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (
        format!("ws://{}/terminal", addr),
        format!("http://{}", addr),
        containers,
        supervisor,
    )
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_server_event(ws: &mut WsStream, budget: Duration) -> Value {
    tokio::time::timeout(budget, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("channel ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

/// Scenario: create a container, get a shell, run `pwd`, see `/root`.
#[tokio::test]
#[ignore]
async fn happy_container_path() {
    let (ws_url, _http, containers) = spawn_real_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({"event": "terminal:create-container"}).to_string().into(),
    ))
    .await
    .unwrap();

    let event = next_server_event(&mut ws, Duration::from_secs(10)).await;
    assert_eq!(event["event"], "terminal:container-creating");

    // Image build on a cold cache can take minutes.
    let event = next_server_event(&mut ws, Duration::from_secs(600)).await;
    assert_eq!(event["event"], "terminal:container-created");
    let container_id = event["data"]["containerId"].as_str().unwrap().to_string();
    assert!(event["data"]["port"].as_u64().unwrap() >= 2222);
    assert_eq!(event["data"]["username"], "root");

    let event = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(event["event"], "terminal:connected");
    assert_eq!(event["data"]["containerId"], container_id.as_str());

    ws.send(Message::Text(
        json!({"event": "terminal:input", "data": {"data": "cHdkCg=="}}) // "pwd\n"
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let mut transcript = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no /root in shell output");
        let event = next_server_event(&mut ws, Duration::from_secs(30)).await;
        if event["event"] == "terminal:output" {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(event["data"]["data"].as_str().unwrap())
                .unwrap();
            transcript.extend_from_slice(&bytes);
            if String::from_utf8_lossy(&transcript).contains("/root") {
                break;
            }
        }
    }

    assert_eq!(containers.list().await.unwrap().len(), 1);

    let _ = containers.stop(&container_id).await;
}

/// Scenario: explicit disconnect preserves the container; a fresh connect
/// with the cached credentials reattaches.
#[tokio::test]
#[ignore]
async fn disconnect_preserves_container_for_reconnect() {
    let (ws_url, _http, containers) = spawn_real_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({"event": "terminal:create-container"}).to_string().into(),
    ))
    .await
    .unwrap();

    let _creating = next_server_event(&mut ws, Duration::from_secs(10)).await;
    let created = next_server_event(&mut ws, Duration::from_secs(600)).await;
    assert_eq!(created["event"], "terminal:container-created");
    let record = created["data"].clone();

    let connected = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(connected["event"], "terminal:connected");

    ws.send(Message::Text(
        json!({"event": "terminal:disconnect"}).to_string().into(),
    ))
    .await
    .unwrap();
    let event = next_server_event(&mut ws, Duration::from_secs(10)).await;
    assert_eq!(event["event"], "terminal:disconnected");
    assert_eq!(event["data"]["reason"], "user_disconnect");

    // Container survives the disconnect.
    assert_eq!(containers.list().await.unwrap().len(), 1);

    // Rate limit: leave a gap before the reconnect attempt.
    tokio::time::sleep(Duration::from_secs(3)).await;

    ws.send(Message::Text(
        json!({
            "event": "terminal:connect",
            "data": {
                "host": record["host"],
                "port": record["port"],
                "username": record["username"],
                "password": record["password"]
            }
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let event = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(event["event"], "terminal:connected");

    let container_id = record["containerId"].as_str().unwrap();
    let _ = containers.stop(container_id).await;
}

/// Scenario: auth failure against a live sshd surfaces the fixed message.
#[tokio::test]
#[ignore]
async fn wrong_password_reports_auth_failure() {
    let (ws_url, _http, containers) = spawn_real_server().await;

    let record = containers.create().await.expect("container created");

    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();
    ws.send(Message::Text(
        json!({
            "event": "terminal:connect",
            "data": {
                "host": record.host,
                "port": record.port,
                "username": "root",
                "password": "wrong"
            }
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let event = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(event["event"], "terminal:error");
    assert_eq!(
        event["data"]["message"],
        "Authentication failed - check username and password"
    );

    let _ = containers.stop(&record.container_id).await;
}

/// Scenario: end-session over the admin API destroys the container.
#[tokio::test]
#[ignore]
async fn end_session_cleans_up_container() {
    let (ws_url, http, containers) = spawn_real_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({"event": "terminal:create-container"}).to_string().into(),
    ))
    .await
    .unwrap();

    let _creating = next_server_event(&mut ws, Duration::from_secs(10)).await;
    let created = next_server_event(&mut ws, Duration::from_secs(600)).await;
    assert_eq!(created["event"], "terminal:container-created");
    let connected = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(connected["event"], "terminal:connected");

    // The session id is the socket id; fetch it from the stats surface.
    let client = reqwest::Client::new();
    let stats: Value = client
        .get(format!("{http}/api/terminal-stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = stats["sessions"][0]["socketId"].as_str().unwrap().to_string();

    let response: Value = client
        .post(format!("{http}/api/containers/end-session"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["containersCleanedUp"], 1);

    let event = next_server_event(&mut ws, Duration::from_secs(10)).await;
    assert_eq!(event["event"], "terminal:disconnected");
    assert_eq!(event["data"]["reason"], "end_session");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(containers.list().await.unwrap().is_empty());
}

/// Scenario: a silent session is reaped by the supervisor with reason
/// `idle_timeout`, and the idle-container sweep then stops the container.
/// The production thresholds are 30 minutes on 1/5/10-minute timers; the
/// same policy is exercised here compressed to seconds.
#[tokio::test]
#[ignore]
async fn idle_reap_disconnects_session_and_stops_container() {
    let config = BrokerConfig {
        idle_timeout: Duration::from_secs(5),
        session_sweep_interval: Duration::from_secs(2),
        container_sweep_interval: Duration::from_secs(3),
        ..BrokerConfig::default()
    };
    let (ws_url, http, containers, _supervisor) = spawn_real_server_with(config).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.unwrap();

    ws.send(Message::Text(
        json!({"event": "terminal:create-container"}).to_string().into(),
    ))
    .await
    .unwrap();

    let _creating = next_server_event(&mut ws, Duration::from_secs(10)).await;
    let created = next_server_event(&mut ws, Duration::from_secs(600)).await;
    assert_eq!(created["event"], "terminal:container-created");
    let connected = next_server_event(&mut ws, Duration::from_secs(60)).await;
    assert_eq!(connected["event"], "terminal:connected");
    assert_eq!(containers.list().await.unwrap().len(), 1);

    // Go silent. The idle-session sweep must be the one that fires, so
    // the reason is deterministically idle_timeout.
    let event = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = next_server_event(&mut ws, Duration::from_secs(30)).await;
            if event["event"] == "terminal:disconnected" {
                return event;
            }
            // Late shell output (prompt redraws) may still arrive.
            assert_eq!(event["event"], "terminal:output");
        }
    })
    .await
    .expect("session was never reaped");
    assert_eq!(event["data"]["reason"], "idle_timeout");

    // The idle-container sweep runs on its own timer; give it room.
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if containers.list().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await
    .expect("container was never reaped");

    // The broker side is empty too.
    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("{http}/api/terminal-health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["activeSessions"], 0);
    assert_eq!(health["containerService"]["containers"], 0);
}
