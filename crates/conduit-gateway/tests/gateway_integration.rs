#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conduit_core::{
    codes, ConduitError, ConduitResult, ErrorObject, Message, Notification, Response,
    ServerDescriptor, PROTOCOL_VERSION,
};
use conduit_gateway::{GatewayServer, HttpConfig};
use conduit_mcp::{Handler, ProtocolEngine, RequestContext};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorder {
    notifications: AtomicUsize,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(
        &self,
        message: Message,
        ctx: &RequestContext,
    ) -> ConduitResult<Option<Response>> {
        let req = match message {
            Message::Request(req) => req,
            Message::Notification(n) => {
                if n.method == "notifications/ping-me" {
                    self.notifications.fetch_add(1, Ordering::SeqCst);
                }
                return Ok(None);
            }
            Message::Response(_) => return Ok(None),
        };
        let result = match req.method.as_str() {
            "tools/list" => json!({"tools": []}),
            "echo" => json!({"params": req.params.clone().map(Value::Object)}),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                json!({"id": req.id.to_value()})
            }
            "linger" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                json!({"id": req.id.to_value()})
            }
            "announce" => {
                let mut params = serde_json::Map::new();
                params.insert("level".into(), json!("info"));
                ctx.publish(Message::from(Notification::new(
                    "notifications/message",
                    Some(params),
                )))
                .await?;
                json!({"announced": true})
            }
            "explode" => return Err(ConduitError::Handler("db password leaked".into())),
            "silent" => return Ok(None),
            other => {
                return Ok(Some(Response::error(req.id, ErrorObject::method_not_found(other))))
            }
        };
        Ok(Some(Response::success(req.id, result)))
    }
}

struct TestServer {
    url: String,
    server: GatewayServer,
    handler: Arc<Recorder>,
    http: reqwest::Client,
}

fn test_config() -> HttpConfig {
    HttpConfig {
        allowed_origins: vec!["http://localhost:5173".into()],
        keep_alive_secs: 0,
        max_body_bytes: 4096,
        ..Default::default()
    }
}

async fn start(config: HttpConfig) -> TestServer {
    let handler = Arc::new(Recorder::default());
    let engine = Arc::new(
        ProtocolEngine::new(ServerDescriptor::new("gateway-test", "1.0"), handler.clone())
            .with_drain_timeout(Duration::from_millis(500)),
    );
    let server = GatewayServer::new(engine, config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let path = server.config().path.clone();

    tokio::spawn(server.clone().serve(listener, std::future::pending()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestServer {
        url: format!("http://{addr}{path}"),
        server,
        handler,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    fn post(&self, session: Option<&str>, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .header("mcp-protocol-version", PROTOCOL_VERSION)
            .body(body.to_string());
        if let Some(sid) = session {
            req = req.header("mcp-session-id", sid);
        }
        req
    }

    async fn initialize(&self) -> String {
        let resp = self.post(None, &init_body(PROTOCOL_VERSION)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let sid = resp.headers()["mcp-session-id"].to_str().unwrap().to_string();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"]["protocolVersion"], PROTOCOL_VERSION);
        sid
    }

    async fn ready_session(&self) -> String {
        let sid = self.initialize().await;
        let ack = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let resp = self.post(Some(&sid), &ack).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        sid
    }
}

fn init_body(version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": {"name": "reqwest", "version": "0.12"}
        }
    })
}

fn call(id: i64, method: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method})
}

async fn read_until<S, B>(stream: &mut S, needle: &str) -> String
where
    S: futures_util::Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !text.contains(needle) {
            let chunk = stream.next().await.unwrap().unwrap();
            text.push_str(std::str::from_utf8(chunk.as_ref()).unwrap());
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {text:?}"));
    text
}

// ---------------------------------------------------------------------------
// 1. Handshake and session header
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_mints_a_session() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    assert_eq!(sid.len(), 32);
    assert_eq!(t.server.registry().len(), 1);

    let resp = t.post(Some(&sid), &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("mcp-session-id").is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["tools"], json!([]));
}

#[tokio::test]
async fn initialize_ignores_a_supplied_session_header() {
    let t = start(test_config()).await;
    let first = t.initialize().await;
    let resp = t
        .post(Some(&first), &init_body(PROTOCOL_VERSION))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let second = resp.headers()["mcp-session-id"].to_str().unwrap().to_string();
    assert_ne!(first, second);
    assert_eq!(t.server.registry().len(), 2);
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let t = start(test_config()).await;
    let resp = t.post(None, &init_body("1999-01-01")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.headers().get("mcp-session-id").is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], codes::INVALID_REQUEST);
    assert_eq!(body["error"]["data"]["supported"], json!([PROTOCOL_VERSION]));
    assert_eq!(body["error"]["data"]["received"], "1999-01-01");
    assert!(t.server.registry().is_empty());
}

#[tokio::test]
async fn requests_before_ack_are_not_initialized() {
    let t = start(test_config()).await;
    let sid = t.initialize().await;
    let resp = t.post(Some(&sid), &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 2);
    assert_eq!(body["error"]["code"], codes::NOT_INITIALIZED);
}

// ---------------------------------------------------------------------------
// 2. Header and body validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protocol_version_header_is_required() {
    let t = start(test_config()).await;
    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "application/json")
        .body(init_body(PROTOCOL_VERSION).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "application/json")
        .header("mcp-protocol-version", "2000-01-01")
        .body(init_body(PROTOCOL_VERSION).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn legacy_version_header_is_accepted() {
    let t = start(test_config()).await;
    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "application/json")
        .header("mcp-protocol-version", conduit_core::LEGACY_PROTOCOL_VERSION)
        .body(init_body(PROTOCOL_VERSION).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn fallback_version_substitutes_a_missing_header() {
    let t = start(HttpConfig {
        fallback_protocol_version: Some(PROTOCOL_VERSION.into()),
        ..test_config()
    })
    .await;
    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "application/json")
        .body(init_body(PROTOCOL_VERSION).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn wrong_content_type_is_415() {
    let t = start(test_config()).await;
    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "text/plain")
        .header("mcp-protocol-version", PROTOCOL_VERSION)
        .body(init_body(PROTOCOL_VERSION).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
}

#[tokio::test]
async fn malformed_bodies_are_jsonrpc_errors() {
    let t = start(test_config()).await;

    let resp = t
        .http
        .post(&t.url)
        .header("content-type", "application/json")
        .header("mcp-protocol-version", PROTOCOL_VERSION)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], codes::PARSE_ERROR);
    assert_eq!(body["id"], Value::Null);

    let batch = json!([call(1, "tools/list"), call(2, "tools/list")]);
    let resp = t.post(None, &batch).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], codes::INVALID_REQUEST);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let t = start(test_config()).await;
    let mut body = call(1, "echo");
    body["params"] = json!({"blob": "x".repeat(8192)});
    let resp = t.post(None, &body).send().await.unwrap();
    assert_eq!(resp.status(), 413);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], codes::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn session_header_is_required_and_must_exist() {
    let t = start(test_config()).await;
    let resp = t.post(None, &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = t
        .post(Some("0123456789abcdef0123456789abcdef"), &call(2, "tools/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ---------------------------------------------------------------------------
// 3. Dispatch results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notification_is_202_and_handled_once() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let note = json!({"jsonrpc": "2.0", "method": "notifications/ping-me"});
    let resp = t.post(Some(&sid), &note).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    assert!(resp.text().await.unwrap().is_empty());
    assert_eq!(t.handler.notifications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_response_is_accepted() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let answer = json!({"jsonrpc": "2.0", "id": "srv-1", "result": {}});
    let resp = t.post(Some(&sid), &answer).send().await.unwrap();
    assert_eq!(resp.status(), 202);
}

#[tokio::test]
async fn handler_faults_are_500_without_detail() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let resp = t.post(Some(&sid), &call(5, "explode")).send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let text = resp.text().await.unwrap();
    assert!(!text.contains("password"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["error"]["code"], codes::INTERNAL_ERROR);
    assert_eq!(body["id"], 5);

    let resp = t.post(Some(&sid), &call(6, "silent")).send().await.unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn null_id_round_trips() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let body = json!({"jsonrpc": "2.0", "id": null, "method": "tools/list"});
    let resp = t.post(Some(&sid), &body).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], Value::Null);
    assert!(body.get("result").is_some());
}

#[tokio::test]
async fn concurrent_requests_on_one_session() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let _other = t.ready_session().await;

    let requests = (0..32).map(|i| {
        let req = t.post(Some(&sid), &call(i, "slow"));
        async move {
            let resp = req.send().await.unwrap();
            assert_eq!(resp.status(), 200);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["jsonrpc"], "2.0");
            assert_eq!(body["id"], i);
            body["result"]["id"].as_i64().unwrap()
        }
    });
    let mut ids = futures_util::future::join_all(requests).await;
    ids.sort_unstable();
    assert_eq!(ids, (0..32).collect::<Vec<_>>());

    assert_eq!(t.server.registry().len(), 2);
    assert!(t.server.registry().get(&sid).is_some());
}

// ---------------------------------------------------------------------------
// 4. Origin and CORS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disallowed_origin_is_403() {
    let t = start(test_config()).await;
    let resp = t
        .post(None, &init_body(PROTOCOL_VERSION))
        .header("origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert!(t.server.registry().is_empty());
}

#[tokio::test]
async fn allowed_origin_gets_cors_headers() {
    let t = start(test_config()).await;
    let resp = t
        .post(None, &init_body(PROTOCOL_VERSION))
        .header("origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let h = resp.headers();
    assert_eq!(h["access-control-allow-origin"], "http://localhost:5173");
    assert_eq!(h["access-control-expose-headers"], "mcp-session-id");
    assert_eq!(h["access-control-allow-credentials"], "true");
    let allowed = h["access-control-allow-headers"].to_str().unwrap();
    assert!(allowed.contains("mcp-session-id"));
    assert!(allowed.contains("mcp-protocol-version"));
}

#[tokio::test]
async fn preflight_is_204() {
    let t = start(test_config()).await;
    let resp = t
        .http
        .request(reqwest::Method::OPTIONS, &t.url)
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(resp.headers().contains_key("access-control-allow-methods"));

    let bare = t
        .http
        .request(reqwest::Method::OPTIONS, &t.url)
        .send()
        .await
        .unwrap();
    assert_eq!(bare.status(), 204);
}

// ---------------------------------------------------------------------------
// 5. Session deletion and GET
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_ends_the_session() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let resp = t.http.delete(&t.url).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = t
        .http
        .delete(&t.url)
        .header("mcp-session-id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = t.post(Some(&sid), &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = t
        .http
        .delete(&t.url)
        .header("mcp-session-id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn get_without_last_event_id_is_501() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let resp = t
        .http
        .get(&t.url)
        .header("mcp-session-id", &sid)
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 501);
}

// ---------------------------------------------------------------------------
// 6. Event streams
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streamed_request_then_reconnect_replays() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let resp = t
        .post(Some(&sid), &call(7, "announce"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    let text = resp.text().await.unwrap();
    assert!(text.starts_with(':'));
    assert!(text.contains("event: message\n"));
    assert!(text.contains(&format!("id: {sid}:1\n")));
    assert!(text.contains(&format!("id: {sid}:2\n")));
    assert!(text.contains("notifications/message"));
    assert!(text.contains("\"announced\":true"));

    let resp = t
        .http
        .get(&t.url)
        .header("mcp-session-id", &sid)
        .header("last-event-id", format!("{sid}:1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = Box::pin(resp.bytes_stream());
    let replay = read_until(&mut stream, &format!("id: {sid}:2\n")).await;
    assert!(!replay.contains(&format!("id: {sid}:1\n")));
    assert!(replay.contains("\"announced\":true"));

    // Live events continue from the next sequence on the reconnected stream.
    let resp = t.post(Some(&sid), &call(8, "announce")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let live = read_until(&mut stream, &format!("id: {sid}:3\n")).await;
    assert!(live.contains("notifications/message"));
}

#[tokio::test]
async fn reconnect_with_garbage_id_replays_nothing() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let resp = t
        .post(Some(&sid), &call(7, "announce"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    resp.text().await.unwrap();

    let resp = t
        .http
        .get(&t.url)
        .header("mcp-session-id", &sid)
        .header("last-event-id", "garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = Box::pin(resp.bytes_stream());

    t.post(Some(&sid), &call(8, "announce")).send().await.unwrap();
    let text = read_until(&mut stream, &format!("id: {sid}:3\n")).await;
    assert!(!text.contains(&format!("id: {sid}:1\n")));
    assert!(!text.contains(&format!("id: {sid}:2\n")));
}

#[tokio::test]
async fn concurrent_streamed_requests_each_get_their_own_response() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let streamed = |id: i64| {
        t.post(Some(&sid), &call(id, "linger"))
            .header("accept", "text/event-stream")
            .send()
    };
    let (a, b) = tokio::join!(streamed(100), streamed(200));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);
    let (a, b) = tokio::join!(a.text(), b.text());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.contains("\"id\":100"), "{a}");
    assert!(!a.contains("\"id\":200"), "{a}");
    assert!(b.contains("\"id\":200"), "{b}");
    assert!(!b.contains("\"id\":100"), "{b}");
    assert_eq!(t.server.streams().sequence(&sid), Some(2));
    assert_eq!(t.server.streams().request_streams(&sid), 0);
}

#[tokio::test]
async fn streamed_request_keeps_the_reconnected_stream_open() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;

    let resp = t
        .http
        .get(&t.url)
        .header("mcp-session-id", &sid)
        .header("last-event-id", format!("{sid}:0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut live = Box::pin(resp.bytes_stream());
    read_until(&mut live, ": stream open").await;

    let resp = t
        .post(Some(&sid), &call(5, "announce"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    let text = resp.text().await.unwrap();
    assert!(text.contains("notifications/message"));
    assert!(text.contains("\"announced\":true"));
    assert!(t.server.streams().is_active(&sid));

    t.post(Some(&sid), &call(6, "announce")).send().await.unwrap();
    let pushed = read_until(&mut live, &format!("id: {sid}:3\n")).await;
    assert!(!pushed.contains(&format!("id: {sid}:1\n")));
    assert!(!pushed.contains("\"announced\":true"));
}

#[tokio::test]
async fn json_accept_gets_a_plain_response() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    let resp = t
        .post(Some(&sid), &call(3, "tools/list"))
        .header("accept", "application/json, text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
}

// ---------------------------------------------------------------------------
// 7. Stateless mode and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stateless_mode_skips_sessions() {
    let t = start(HttpConfig {
        stateless: true,
        ..test_config()
    })
    .await;

    let resp = t.post(None, &init_body(PROTOCOL_VERSION)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("mcp-session-id").is_none());

    let resp = t.post(None, &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 2);
    assert!(t.server.registry().is_empty());
}

#[tokio::test]
async fn shutdown_rejects_new_messages() {
    let t = start(test_config()).await;
    let sid = t.ready_session().await;
    assert!(t.server.shutdown().await);
    assert!(t.server.is_shutting_down());

    let resp = t.post(Some(&sid), &call(2, "tools/list")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], codes::SHUTTING_DOWN);
}

#[tokio::test]
async fn serve_returns_after_signal() {
    let handler = Arc::new(Recorder::default());
    let engine = Arc::new(ProtocolEngine::new(
        ServerDescriptor::new("gateway-test", "1.0"),
        handler,
    ));
    let server = GatewayServer::new(engine, test_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(server.clone().serve(listener, async move {
        let _ = rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
    assert!(result.unwrap().is_ok());
    assert!(server.is_shutting_down());
}
