//! End-to-end RPC tests over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use fl_crypto::{Aid, KeyPair};
use fl_directory::{
    AgentMetadata, Capability, DirectoryProvider, Endpoints, MemoryDirectory, SearchQuery,
};
use fl_events::{EventFilter, EventKind, EventStream};
use fl_rpc::{
    codes, ClientConfig, ClientEvent, ErrorObject, HeartbeatConfig, LinkState, RateLimiter,
    ReconnectPolicy, RequestOptions, RpcClient, RpcError, RpcServer, ServerConfig, ServerEvent,
    SignaturePolicy,
};

fn echo_server(config: ServerConfig) -> Arc<RpcServer> {
    let server = RpcServer::new(config);
    server.register("echo", |params, _from| async move {
        Ok(params.unwrap_or(Value::Null))
    });
    server
}

fn client_for(directory: Arc<dyn DirectoryProvider>) -> Arc<RpcClient> {
    RpcClient::new(KeyPair::generate(), ClientConfig::default(), directory)
}

fn lone_client() -> Arc<RpcClient> {
    client_for(Arc::new(MemoryDirectory::new()))
}

#[tokio::test]
async fn echo_roundtrip_authenticates_client() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    let mut server_events = server.subscribe_events();

    let result = client
        .request(RequestOptions::new(&url, "echo").params(json!({"hello": "world"})))
        .await
        .unwrap();
    assert_eq!(result, json!({"hello": "world"}));

    assert_eq!(server.authenticated_clients(), vec![client.aid()]);
    match server_events.recv().await.unwrap() {
        ServerEvent::ClientConnected { did } => assert_eq!(did, client.aid()),
        other => panic!("expected ClientConnected, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    let client = lone_client();
    let err = client
        .request(RequestOptions::new(format!("rpc://{addr}"), "nonexistent"))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { code, .. } => assert_eq!(code, codes::METHOD_NOT_FOUND),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limiter_blocks_third_request() {
    let server = echo_server(ServerConfig::default());
    server.use_middleware(Arc::new(RateLimiter::new(2, Duration::from_secs(10))));
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    for _ in 0..2 {
        client
            .request(RequestOptions::new(&url, "echo").params(json!({})))
            .await
            .unwrap();
    }
    let err = client
        .request(RequestOptions::new(&url, "echo").params(json!({})))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { code, .. } => assert_eq!(code, codes::RATE_LIMIT_EXCEEDED),
        other => panic!("expected rate limit error, got {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_signature_policy_fails_authentication() {
    let server = echo_server(ServerConfig {
        signature_policy: SignaturePolicy::FullRequest,
        ..Default::default()
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    // Client signs payload-only; the server expects full-request.
    let client = lone_client();
    let err = client
        .request(RequestOptions::new(format!("rpc://{addr}"), "echo").params(json!({})))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { code, .. } => assert_eq!(code, codes::AUTHENTICATION_FAILED),
        other => panic!("expected auth failure, got {other:?}"),
    }
}

#[tokio::test]
async fn matching_full_request_policy_succeeds() {
    let server = echo_server(ServerConfig {
        signature_policy: SignaturePolicy::FullRequest,
        ..Default::default()
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    let client = RpcClient::new(
        KeyPair::generate(),
        ClientConfig {
            signature_policy: SignaturePolicy::FullRequest,
            ..Default::default()
        },
        Arc::new(MemoryDirectory::new()),
    );
    let result = client
        .request(RequestOptions::new(format!("rpc://{addr}"), "echo").params(json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 1}));
}

#[tokio::test]
async fn raw_frames_get_wire_errors() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    // Not JSON at all: PARSE_ERROR with the reserved id -1.
    write_half.write_all(b"this is not json\n").await.unwrap();
    reader.read_line(&mut line).await.unwrap();
    let response: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(response["error"]["code"], json!(codes::PARSE_ERROR));
    assert_eq!(response["id"], json!(-1));

    // JSON but not JSON-RPC 2.0: INVALID_REQUEST.
    line.clear();
    write_half
        .write_all(b"{\"jsonrpc\":\"1.0\",\"id\":1,\"method\":\"echo\"}\n")
        .await
        .unwrap();
    reader.read_line(&mut line).await.unwrap();
    let response: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(response["error"]["code"], json!(codes::INVALID_REQUEST));

    // Well-formed but unsigned under require_auth: AUTHENTICATION_FAILED.
    line.clear();
    write_half
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"echo\"}\n")
        .await
        .unwrap();
    reader.read_line(&mut line).await.unwrap();
    let response: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(
        response["error"]["code"],
        json!(codes::AUTHENTICATION_FAILED)
    );
    assert_eq!(response["id"], json!(7));
}

#[tokio::test]
async fn handler_error_surfaces_as_internal_error_and_server_survives() {
    let server = echo_server(ServerConfig::default());
    server.register("fail", |_params, _from| async move {
        Err::<Value, _>(ErrorObject::internal_error("handler blew up"))
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    let err = client
        .request(RequestOptions::new(&url, "fail"))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { code, .. } => assert_eq!(code, codes::INTERNAL_ERROR),
        other => panic!("expected internal error, got {other:?}"),
    }
    // The connection is still usable.
    let result = client
        .request(RequestOptions::new(&url, "echo").params(json!(1)))
        .await
        .unwrap();
    assert_eq!(result, json!(1));
}

#[tokio::test]
async fn slow_handler_times_out_and_leaves_no_pending() {
    let server = echo_server(ServerConfig::default());
    server.register("slow", |_params, _from| async move {
        time::sleep(Duration::from_secs(5)).await;
        Ok(json!("late"))
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    let client = lone_client();
    let err = client
        .request(
            RequestOptions::new(format!("rpc://{addr}"), "slow")
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
}

#[tokio::test]
async fn close_rejects_in_flight_requests() {
    let server = echo_server(ServerConfig::default());
    server.register("slow", |_params, _from| async move {
        time::sleep(Duration::from_secs(5)).await;
        Ok(json!("late"))
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    let in_flight = {
        let client = Arc::clone(&client);
        let url = url.clone();
        tokio::spawn(async move { client.request(RequestOptions::new(url, "slow")).await })
    };
    time::sleep(Duration::from_millis(100)).await;
    client.close().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)));

    let err = client
        .request(RequestOptions::new(&url, "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Closed));

    // The link wound down through Closing into Closed.
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.link_state(&url).await, Some(LinkState::Closed));
}

#[tokio::test]
async fn link_is_open_while_in_use() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    assert_eq!(client.link_state(&url).await, None);
    client
        .request(RequestOptions::new(&url, "echo").params(json!({})))
        .await
        .unwrap();
    assert_eq!(client.link_state(&url).await, Some(LinkState::Open));
}

#[tokio::test]
async fn resolves_targets_through_directory() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    let directory = Arc::new(MemoryDirectory::new());
    let server_identity = KeyPair::generate();
    let server_aid = Aid::from_public_key(&server_identity.public_key());
    directory
        .register(AgentMetadata {
            did: server_aid.clone(),
            name: "mapper-1".into(),
            capabilities: vec![Capability::new("map")],
            endpoints: Endpoints {
                rpc: Some(format!("rpc://{addr}")),
                http: None,
            },
        })
        .await;

    let client = client_for(directory);

    // By AID.
    let result = client
        .request(RequestOptions::new(server_aid.to_string(), "echo").params(json!("by-aid")))
        .await
        .unwrap();
    assert_eq!(result, json!("by-aid"));

    // By capability: first discovered agent wins.
    let result = client
        .request(RequestOptions::new("map", "echo").params(json!("by-capability")))
        .await
        .unwrap();
    assert_eq!(result, json!("by-capability"));

    // Unknown capability.
    let err = client
        .request(RequestOptions::new("teleport", "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DiscoveryFailed(_)));
}

struct StalledDirectory;

#[async_trait::async_trait]
impl DirectoryProvider for StalledDirectory {
    async fn discover(&self, _capability: &str) -> Vec<Aid> {
        time::sleep(Duration::from_secs(60)).await;
        Vec::new()
    }
    async fn lookup(&self, _aid: &Aid) -> Option<AgentMetadata> {
        time::sleep(Duration::from_secs(60)).await;
        None
    }
    async fn register(&self, _meta: AgentMetadata) {}
    async fn unregister(&self, _aid: &Aid) -> bool {
        false
    }
    async fn search(&self, _query: &SearchQuery) -> Vec<Aid> {
        Vec::new()
    }
}

#[tokio::test]
async fn stalled_directory_surfaces_discovery_failed() {
    let client = RpcClient::new(
        KeyPair::generate(),
        ClientConfig {
            discovery_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        Arc::new(StalledDirectory),
    );
    let err = client
        .request(RequestOptions::new("map", "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DiscoveryFailed(_)));
}

#[tokio::test]
async fn late_subscriber_gets_replay_before_live_events() {
    let stream = Arc::new(EventStream::new(100).unwrap());
    let server = RpcServer::with_event_stream(ServerConfig::default(), Some(Arc::clone(&stream)));
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    stream.emit(EventKind::Message, json!("x"), None);
    stream.emit(EventKind::Message, json!("y"), None);
    stream.emit(EventKind::Message, json!("z"), None);

    let client = lone_client();
    let mut events = client
        .subscribe_events(&format!("rpc://{addr}"), None)
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(event);
    }
    assert_eq!(
        received.iter().map(|e| e.data.clone()).collect::<Vec<_>>(),
        vec![json!("x"), json!("y"), json!("z")]
    );

    stream.emit(EventKind::Message, json!("w"), None);
    let live = time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.data, json!("w"));
    assert!(received.iter().all(|e| e.sequence < live.sequence));
}

#[tokio::test]
async fn subscription_filter_is_applied_server_side() {
    let stream = Arc::new(EventStream::new(100).unwrap());
    let server = RpcServer::with_event_stream(ServerConfig::default(), Some(Arc::clone(&stream)));
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    stream.emit(EventKind::Message, json!("a"), None);
    stream.emit(EventKind::Status, json!("b"), None);
    stream.emit(EventKind::Error, json!("c"), None);

    let client = lone_client();
    let mut events = client
        .subscribe_events(
            &format!("rpc://{addr}"),
            Some(EventFilter::kinds([EventKind::Error])),
        )
        .await
        .unwrap();

    let only = time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(only.data, json!("c"));

    stream.emit(EventKind::Message, json!("noise"), None);
    stream.emit(EventKind::Error, json!("boom"), None);
    let next = time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.data, json!("boom"));
}

#[tokio::test]
async fn notify_reaches_one_client_broadcast_reaches_all() {
    let server = echo_server(ServerConfig::default());
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    // Authenticate the connection so the server can address it by AID.
    client
        .request(RequestOptions::new(&url, "echo").params(json!({})))
        .await
        .unwrap();
    let mut notifications = client.notifications(&url).await.unwrap();

    assert!(server.notify(&client.aid(), "fleet.recall", Some(json!({"zone": 4}))));
    let delivered = time::timeout(Duration::from_secs(2), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.method, "fleet.recall");
    assert_eq!(delivered.params, Some(json!({"zone": 4})));

    assert_eq!(server.broadcast_notify("fleet.alert", None), 1);
    let unknown = Aid::from_public_key(&KeyPair::generate().public_key());
    assert!(!server.notify(&unknown, "fleet.recall", None));
}

#[tokio::test]
async fn silent_peer_is_terminated_by_heartbeat() {
    let server = echo_server(ServerConfig {
        heartbeat: Some(HeartbeatConfig {
            interval: Duration::from_millis(50),
        }),
        ..Default::default()
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();

    // A raw socket that never answers the probe.
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    // First sweep sends a ping...
    let n = time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);
    assert!(line.contains("heartbeat.ping"));

    // ...the next sweep terminates us: EOF.
    line.clear();
    let n = time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn responsive_client_survives_heartbeat() {
    let server = echo_server(ServerConfig {
        heartbeat: Some(HeartbeatConfig {
            interval: Duration::from_millis(50),
        }),
        ..Default::default()
    });
    let addr = server.bind("rpc://127.0.0.1:0").await.unwrap();
    let url = format!("rpc://{addr}");

    let client = lone_client();
    client
        .request(RequestOptions::new(&url, "echo").params(json!({})))
        .await
        .unwrap();

    // Several sweep intervals later the link still works because the
    // client answers probes.
    time::sleep(Duration::from_millis(300)).await;
    let result = client
        .request(RequestOptions::new(&url, "echo").params(json!("still here")))
        .await
        .unwrap();
    assert_eq!(result, json!("still here"));
}

/// Minimal line-framed echo responder used to simulate a server that
/// drops its first connection (a restart) while keeping the port.
async fn flaky_echo_listener(listener: TcpListener, drop_first: bool) {
    let mut first = drop_first;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if first {
            first = false;
            drop(stream);
            continue;
        }
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let Ok(request) = serde_json::from_str::<Value>(line.trim_end()) else {
                            continue;
                        };
                        let response = json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "result": request.get("params").cloned().unwrap_or(Value::Null),
                        });
                        let frame = format!("{response}\n");
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[tokio::test]
async fn client_reconnects_with_backoff_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(flaky_echo_listener(listener, true));
    let url = format!("rpc://{addr}");

    let client = RpcClient::new(
        KeyPair::generate(),
        ClientConfig {
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_backoff: Duration::from_millis(30),
                backoff_factor: 2,
                max_backoff: Duration::from_millis(200),
                max_attempts: 5,
            },
            ..Default::default()
        },
        Arc::new(MemoryDirectory::new()),
    );
    let mut link_events = client.subscribe_link_events();

    // First request rides the connection that gets dropped.
    let _ = client
        .request(RequestOptions::new(&url, "echo").timeout(Duration::from_millis(300)))
        .await;

    // connected → disconnected → reconnecting* → connected
    let mut saw_disconnect = false;
    let mut saw_reconnecting = false;
    let mut reconnected = false;
    let deadline = time::Instant::now() + Duration::from_secs(3);
    while time::Instant::now() < deadline {
        match time::timeout_at(deadline, link_events.recv()).await {
            Ok(Ok(ClientEvent::Disconnected { .. })) => saw_disconnect = true,
            Ok(Ok(ClientEvent::Reconnecting { .. })) => saw_reconnecting = true,
            Ok(Ok(ClientEvent::Connected { .. })) if saw_disconnect => {
                reconnected = true;
                break;
            }
            Ok(Ok(ClientEvent::Connected { .. })) => {}
            _ => break,
        }
    }
    assert!(saw_disconnect && saw_reconnecting && reconnected);

    // The reopened link serves requests again.
    let result = client
        .request(RequestOptions::new(&url, "echo").params(json!("after restart")))
        .await
        .unwrap();
    assert_eq!(result, json!("after restart"));
}
