//! End-to-end tests: clients, server and viewers over real sockets

use futures_util::{SinkExt, StreamExt};
use logbeam::client::{Logger, RpcHandler, TransportType};
use logbeam::config::{ClientConfig, ServerConfig};
use logbeam::server::{LogServer, ServerHandle};
use logbeam::types::LogEntry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Server config with every port ephemeral
fn test_server_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.http_port = 0;
    config.server.tcp_port = Some(0);
    config.server.udp_port = Some(0);
    config
}

async fn start_server(config: ServerConfig) -> (Arc<LogServer>, ServerHandle) {
    let server = Arc::new(LogServer::new(config).unwrap());
    let handle = server.spawn().await.unwrap();
    (server, handle)
}

fn client_config(session_id: &str, transport: TransportType) -> ClientConfig {
    ClientConfig {
        app: "integration".to_string(),
        session_id: Some(session_id.to_string()),
        transport,
        drain_interval_ms: 20,
        ..Default::default()
    }
}

/// Poll until `check` holds or two seconds pass
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn texts_of(server: &LogServer, session_id: &str) -> Vec<String> {
    server
        .ingest()
        .buffer()
        .recent(1000)
        .into_iter()
        .filter(|e| e.session_id == session_id)
        .filter_map(|e| e.text)
        .collect()
}

async fn connect_viewer(handle: &ServerHandle) -> Viewer {
    let (viewer, _) = connect_async(handle.ws_url()).await.unwrap();
    viewer
}

/// Read viewer frames until one satisfies `pred`
async fn next_matching<F: Fn(&Value) -> bool>(viewer: &mut Viewer, pred: F) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = viewer.next().await.unwrap().unwrap();
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("no matching frame")
}

#[tokio::test]
async fn test_logging_over_http() {
    let (server, handle) = start_server(test_server_config()).await;

    let mut config = client_config("http-session", TransportType::Http);
    config.url = handle.http_url();
    let logger = Logger::new(config).await.unwrap();

    logger.info("over http");
    logger.error("also over http");
    logger.flush().await;

    assert!(eventually(|| texts_of(&server, "http-session").len() == 2).await);
    let session = server.ingest().sessions().get("http-session").unwrap();
    // session start plus two entries
    assert_eq!(session.log_count, 3);
    assert_eq!(session.application.name, "integration");

    logger.close().await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logging_over_tcp() {
    let (server, handle) = start_server(test_server_config()).await;

    let mut config = client_config("tcp-session", TransportType::Tcp);
    config.host = "127.0.0.1".to_string();
    config.port = handle.tcp_addr.unwrap().port();
    let logger = Logger::new(config).await.unwrap();

    for i in 0..5 {
        logger.info(format!("tcp message {}", i));
    }
    logger.close().await;

    assert!(eventually(|| texts_of(&server, "tcp-session").len() == 5).await);
    assert_eq!(texts_of(&server, "tcp-session")[0], "tcp message 0");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logging_over_udp() {
    let (server, handle) = start_server(test_server_config()).await;

    let mut config = client_config("udp-session", TransportType::Udp);
    config.host = "127.0.0.1".to_string();
    config.udp_port = handle.udp_addr.unwrap().port();
    let logger = Logger::new(config).await.unwrap();

    logger.warn("datagram");
    logger.flush().await;

    assert!(eventually(|| texts_of(&server, "udp-session") == vec!["datagram".to_string()]).await);

    logger.close().await;
    handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_logging_over_unix_socket() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("logbeam.sock").to_string_lossy().to_string();
    let mut server_config = test_server_config();
    server_config.server.socket_path = Some(socket_path.clone());
    let (server, handle) = start_server(server_config).await;
    assert_eq!(handle.socket_path.as_deref(), Some(socket_path.as_str()));

    let mut config = client_config("unix-session", TransportType::Unix);
    config.socket_path = socket_path.clone();
    let logger = Logger::new(config).await.unwrap();

    logger.info("over unix socket");
    logger.close().await;

    assert!(eventually(|| texts_of(&server, "unix-session").len() == 1).await);

    handle.shutdown().await.unwrap();
    assert!(!std::path::Path::new(&socket_path).exists());
}

#[tokio::test]
async fn test_viewer_receives_session_list_then_live_entries() {
    let (_server, handle) = start_server(test_server_config()).await;
    let mut viewer = connect_viewer(&handle).await;

    let list = next_matching(&mut viewer, |v| v["type"] == "session_list").await;
    let sessions = list["sessions"].as_array().unwrap();
    assert!(sessions.iter().any(|s| s["session_id"] == "__system__"));

    let mut config = client_config("ws-session", TransportType::Ws);
    config.url = handle.ws_url();
    let logger = Logger::new(config).await.unwrap();
    logger.info("live over websocket");
    logger.flush().await;

    let update = next_matching(&mut viewer, |v| v["type"] == "session_update").await;
    assert_eq!(update["session_id"], "ws-session");
    assert_eq!(update["session_action"], "start");

    let log = next_matching(&mut viewer, |v| {
        v["type"] == "log" && v["entry"]["session_id"] == "ws-session" && v["entry"]["type"] == "text"
    })
    .await;
    assert_eq!(log["entry"]["text"], "live over websocket");

    logger.close().await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_viewer_subscription_filters_sessions() {
    let (server, handle) = start_server(test_server_config()).await;
    let mut viewer = connect_viewer(&handle).await;
    next_matching(&mut viewer, |v| v["type"] == "session_list").await;

    viewer
        .send(Message::text(
            json!({"type": "subscribe", "session_ids": ["wanted"]}).to_string(),
        ))
        .await
        .unwrap();
    // the subscription is applied before the next command is read
    viewer
        .send(Message::text(json!({"type": "state_query", "session_id": "wanted"}).to_string()))
        .await
        .unwrap();
    next_matching(&mut viewer, |v| v["type"] == "state_snapshot").await;

    let ingest = server.ingest();
    ingest.ingest(LogEntry::text(
        "ignored",
        logbeam::types::Severity::Info,
        Default::default(),
        "not for this viewer",
    ));
    ingest.ingest(LogEntry::text(
        "wanted",
        logbeam::types::Severity::Info,
        Default::default(),
        "for this viewer",
    ));

    let log = next_matching(&mut viewer, |v| v["type"] == "log").await;
    assert_eq!(log["entry"]["session_id"], "wanted");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_viewer_rpc_round_trip() {
    let (server, handle) = start_server(test_server_config()).await;

    let mut config = client_config("rpc-client", TransportType::Ws);
    config.url = handle.ws_url();
    let logger = Logger::new(config).await.unwrap();
    logger.register_rpc(
        "add",
        RpcHandler::sync("Add two numbers", |args| {
            let a = args["a"].as_i64().ok_or("missing a")?;
            let b = args["b"].as_i64().ok_or("missing b")?;
            Ok(json!(a + b))
        }),
    );
    logger.info("ready");
    logger.flush().await;
    assert!(eventually(|| server.ingest().rpc().has_client("rpc-client")).await);

    let mut viewer = connect_viewer(&handle).await;
    viewer
        .send(Message::text(
            json!({
                "type": "rpc_request",
                "rpc_id": "call-1",
                "target_session_id": "rpc-client",
                "rpc_method": "add",
                "rpc_args": {"a": 2, "b": 3}
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let response = next_matching(&mut viewer, |v| v["type"] == "rpc_response").await;
    assert_eq!(response["rpc_id"], "call-1");
    assert_eq!(response["rpc_response"], json!(5));

    viewer
        .send(Message::text(
            json!({
                "type": "rpc_request",
                "rpc_id": "call-2",
                "target_session_id": "rpc-client",
                "rpc_method": "missing",
                "rpc_args": null
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let response = next_matching(&mut viewer, |v| v["type"] == "rpc_response").await;
    assert_eq!(response["rpc_id"], "call-2");
    assert_eq!(response["rpc_error"], "Unknown RPC method: missing");

    viewer
        .send(Message::text(
            json!({
                "type": "rpc_request",
                "rpc_id": "call-3",
                "target_session_id": "nobody",
                "rpc_method": "add",
                "rpc_args": {}
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let response = next_matching(&mut viewer, |v| v["type"] == "rpc_response").await;
    assert_eq!(response["rpc_id"], "call-3");
    assert!(response["rpc_error"].as_str().unwrap().contains("not found"));

    logger.close().await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_routes() {
    let (_server, handle) = start_server(test_server_config()).await;
    let http = reqwest::Client::new();
    let base = handle.http_url();

    let health: Value = http
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let entries: Vec<LogEntry> = (0..3)
        .map(|i| {
            LogEntry::text(
                "history-session",
                logbeam::types::Severity::Info,
                Default::default(),
                format!("entry {}", i),
            )
        })
        .collect();
    let response = http
        .post(format!("{}/api/v1/logs", base))
        .json(&json!({ "entries": entries }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let batch: Value = response.json().await.unwrap();
    assert_eq!(batch["ok"], true);
    let results = batch["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r["ok"] == true));
    assert_eq!(results[0]["id"], json!(entries[0].id));

    let empty = http
        .post(format!("{}/api/v1/logs", base))
        .json(&json!([]))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

    let page: Value = http
        .get(format!("{}/api/v1/history?session_id=history-session&limit=2", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["type"], "history");
    assert_eq!(page["source"], "buffer");
    assert_eq!(page["history_entries"].as_array().unwrap().len(), 2);
    assert_eq!(page["has_more"], true);

    let cursor = page["cursor"].as_str().unwrap();
    let rest: Value = http
        .get(format!(
            "{}/api/v1/history?session_id=history-session&limit=2&cursor={}",
            base, cursor
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rest_entries = rest["history_entries"].as_array().unwrap();
    assert_eq!(rest_entries.len(), 1);
    assert_eq!(rest_entries[0]["text"], "entry 2");
    assert_eq!(rest["has_more"], false);

    let invalid = http
        .post(format!("{}/api/v1/log", base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);
    let error: Value = invalid.json().await.unwrap();
    assert_eq!(error["error_code"], "VALIDATION_FAILED");

    let sessions: Value = http
        .get(format!("{}/api/v1/sessions", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(sessions
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["session_id"] == "history-session"));

    let detail: Value = http
        .get(format!("{}/api/v1/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(detail["buffer_entries"].as_u64().unwrap() >= 3);
    assert_eq!(detail["pending_rpc"], 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_http_batch() {
    let mut config = test_server_config();
    config.rate_limit.session_rate = 2.0;
    config.rate_limit.burst_multiplier = 1.0;
    let (server, handle) = start_server(config).await;

    let entries: Vec<LogEntry> = (0..5)
        .map(|i| {
            LogEntry::text(
                "noisy",
                logbeam::types::Severity::Debug,
                Default::default(),
                format!("burst {}", i),
            )
        })
        .collect();
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/logs", handle.http_url()))
        .json(&entries)
        .send()
        .await
        .unwrap();
    // the batch as a whole succeeds, each entry reports its own outcome
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    let refused: Vec<&Value> = results.iter().filter(|r| r["ok"] == false).collect();
    assert_eq!(results.len(), 5);
    assert_eq!(refused.len(), 3);
    assert!(refused.iter().all(|r| r["error_code"] == "RATE_LIMITED"));
    assert_eq!(refused[0]["id"], json!(entries[2].id));
    assert_eq!(texts_of(&server, "noisy").len(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_logger_resends_only_refused_entries() {
    let mut server_config = test_server_config();
    server_config.rate_limit.session_rate = 2.0;
    server_config.rate_limit.burst_multiplier = 1.0;
    let (server, handle) = start_server(server_config).await;

    let mut config = client_config("mixed-batch", TransportType::Http);
    config.url = handle.http_url();
    let logger = Logger::new(config).await.unwrap();

    let too_many_tags = (0..40).map(|i| (format!("tag{}", i), "v".to_string())).collect();
    logger.log(logbeam::types::Severity::Info, "over-tagged", Some(too_many_tags));
    for i in 0..4 {
        logger.info(format!("e{}", i));
    }
    logger.flush().await;

    // the session start and e0 fit the burst, the rest trickle in as tokens refill
    let delivered = timeout(Duration::from_secs(10), async {
        while texts_of(&server, "mixed-batch").len() < 4 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    let mut stored = texts_of(&server, "mixed-batch");
    stored.sort();
    assert_eq!(stored, vec!["e0", "e1", "e2", "e3"]);
    assert_eq!(logger.pending(), 0);

    logger.close().await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_viewer_sees_published_rpc_handlers() {
    let (server, handle) = start_server(test_server_config()).await;
    let mut viewer = connect_viewer(&handle).await;

    let mut config = client_config("tools-client", TransportType::Ws);
    config.url = handle.ws_url();
    let logger = Logger::new(config).await.unwrap();
    logger.register_rpc("ping", RpcHandler::sync("Answer with pong", |_| Ok(json!("pong"))));
    logger.info("ready");
    logger.flush().await;

    let pushed = next_matching(&mut viewer, |v| {
        v["type"] == "rpc_tools" && v["tools"]["tools-client"][0]["name"] == "ping"
    })
    .await;
    assert_eq!(pushed["tools"]["tools-client"][0]["description"], "Answer with pong");

    viewer
        .send(Message::text(
            json!({"type": "tools_query", "session_id": "tools-client"}).to_string(),
        ))
        .await
        .unwrap();
    let answer = next_matching(&mut viewer, |v| v["type"] == "rpc_tools").await;
    let tools = answer["tools"]["tools-client"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "ping");
    assert_eq!(tools[0]["category"], "getter");

    let published = server.ingest().rpc().tools("tools-client").unwrap();
    assert_eq!(published[0].name, "ping");

    logger.close().await;
    assert!(eventually(|| server.ingest().rpc().tools("tools-client").is_none()).await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logger_queues_until_server_appears() {
    // a port with nothing listening yet
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let mut config = client_config("late-session", TransportType::Tcp);
    config.host = "127.0.0.1".to_string();
    config.port = port;
    let logger = Logger::new(config).await.unwrap();
    logger.info("queued while offline");
    assert!(logger.pending() >= 2);

    let mut server_config = test_server_config();
    server_config.server.tcp_port = Some(port);
    let (server, handle) = start_server(server_config).await;

    // reconnection backs off for a second after the failed connect
    let delivered = timeout(Duration::from_secs(5), async {
        loop {
            if texts_of(&server, "late-session").len() == 1 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    logger.close().await;
    handle.shutdown().await.unwrap();
}
