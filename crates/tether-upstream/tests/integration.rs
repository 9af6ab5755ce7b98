//! End-to-end tests against an in-process mock upstream WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use tether_core::errors::GatewayError;
use tether_core::ids::CorrelationId;
use tether_core::wire::OutboundFrame;
use tether_telemetry::LogContext;
use tether_upstream::{CompletionGateway, ConnectionState, StreamEvent, UpstreamConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Mock upstream ──

type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

struct MockUpstream {
    url: String,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    kick: Arc<Notify>,
}

impl MockUpstream {
    async fn start(responder: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let responder: Responder = Arc::new(responder);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let kick = Arc::new(Notify::new());

        let (rx_log, conns, kicker) = (received.clone(), connections.clone(), kick.clone());
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(tcp).await else { continue };
                conns.fetch_add(1, Ordering::SeqCst);
                let (responder, rx_log, kicker) = (responder.clone(), rx_log.clone(), kicker.clone());
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                                    rx_log.lock().unwrap().push(frame.clone());
                                    for reply in responder(&frame) {
                                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                                Some(Ok(_)) => {}
                            },
                            _ = kicker.notified() => {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            url,
            received,
            connections,
            kick,
        }
    }

    /// Close every open connection from the server side.
    fn kick(&self) {
        self.kick.notify_waiters();
    }

    fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

fn request_id(frame: &Value) -> String {
    frame["requestId"].as_str().unwrap().to_string()
}

/// Unary echo: responds with the first message content, tagged by id.
fn echo(frame: &Value) -> Vec<Value> {
    let id = request_id(frame);
    if frame["args"]["stream"].as_bool() == Some(true) {
        return vec![
            json!({"requestId": id, "chunk": "Hel"}),
            json!({"requestId": id, "chunk": "lo"}),
            json!({"requestId": id, "isStreamEnd": true}),
        ];
    }
    let content = frame["args"]["messages"][0]["content"].as_str().unwrap_or("");
    vec![json!({"requestId": id, "code": 200, "response": format!("echo:{content}"), "tokens_burned": 12})]
}

fn silent(_frame: &Value) -> Vec<Value> {
    Vec::new()
}

async fn gateway(url: &str) -> CompletionGateway {
    let config = UpstreamConfig {
        url: url.to_string(),
        reconnect_delay: Duration::from_millis(20),
        request_timeout: Duration::from_secs(3),
        stream_idle_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    let gw = CompletionGateway::from_config(config, &LogContext::detached());
    gw.supervisor().connect().await.unwrap();
    gw.supervisor().start();
    gw
}

fn completion_frame(id: &CorrelationId, content: &str, stream: bool) -> OutboundFrame {
    OutboundFrame::new(
        "completion/getCompletion",
        json!({
            "provider": "openai",
            "model": "gpt-4o",
            "messages": [{"id": "m1", "role": "user", "content": content, "model": "gpt-4o"}],
            "history_id": "h1",
            "stream": stream,
        }),
        id.clone(),
    )
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Unary ──

#[tokio::test]
async fn unary_round_trip() {
    let mock = MockUpstream::start(echo).await;
    let gw = gateway(&mock.url).await;

    let id = CorrelationId::from_raw("r1");
    let completion = timeout(TIMEOUT, gw.handle_unary(&id, &completion_frame(&id, "hi", false)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(completion.id, "r1");
    assert_eq!(completion.model, "gpt-4o");
    assert_eq!(completion.content(), "echo:hi");
    assert_eq!(completion.usage.total_tokens, 12);
    assert!(gw.registry().is_empty());

    let sent = mock.received();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["method"], "completion/getCompletion");
    assert_eq!(sent[0]["requestId"], "r1");
    gw.supervisor().close().await;
}

#[tokio::test]
async fn upstream_error_reaches_only_its_caller() {
    let mock = MockUpstream::start(|frame| {
        vec![json!({"requestId": request_id(frame), "code": 429, "message": "Rate limited"})]
    })
    .await;
    let gw = gateway(&mock.url).await;

    let id = CorrelationId::from_raw("r1");
    let err = gw
        .handle_unary(&id, &completion_frame(&id, "hi", false))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::Upstream {
            status: 429,
            message: "Rate limited".into()
        }
    );
    assert_eq!(gw.supervisor().state(), ConnectionState::Connected);
    gw.supervisor().close().await;
}

#[tokio::test]
async fn concurrent_requests_share_one_connection() {
    let mock = MockUpstream::start(echo).await;
    let gw = Arc::new(gateway(&mock.url).await);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let gw = gw.clone();
        tasks.push(tokio::spawn(async move {
            let id = CorrelationId::from_raw(format!("r{i}"));
            let out = gw
                .handle_unary(&id, &completion_frame(&id, &format!("n{i}"), false))
                .await
                .unwrap();
            (i, out.content().to_string())
        }));
    }
    for task in tasks {
        let (i, content) = timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(content, format!("echo:n{i}"));
    }

    assert_eq!(mock.connections.load(Ordering::SeqCst), 1);
    assert!(gw.registry().is_empty());
    gw.supervisor().close().await;
}

// ── Streaming ──

#[tokio::test]
async fn stream_yields_chunks_then_done() {
    let mock = MockUpstream::start(echo).await;
    let gw = gateway(&mock.url).await;

    let id = CorrelationId::from_raw("r2");
    let stream = gw
        .handle_stream(&id, &completion_frame(&id, "hi", true))
        .await
        .unwrap();
    let events: Vec<StreamEvent> = timeout(TIMEOUT, stream.collect()).await.unwrap();

    let contents: Vec<_> = events.iter().filter_map(|e| e.content()).collect();
    assert_eq!(contents, ["Hel", "lo"]);
    assert_eq!(events.last(), Some(&StreamEvent::Done));
    assert_eq!(events.last().unwrap().sse_frame(), "data: [DONE]\n\n");
    assert!(gw.registry().is_empty());
    gw.supervisor().close().await;
}

#[tokio::test]
async fn interleaved_streams_stay_separate() {
    let mock = MockUpstream::start(|frame| {
        let id = request_id(frame);
        (0..5)
            .map(|n| json!({"requestId": id, "chunk": format!("{id}-{n};")}))
            .chain(std::iter::once(json!({"requestId": id, "isStreamEnd": true})))
            .collect()
    })
    .await;
    let gw = gateway(&mock.url).await;

    let a = CorrelationId::from_raw("a");
    let b = CorrelationId::from_raw("b");
    let sa = gw.handle_stream(&a, &completion_frame(&a, "x", true)).await.unwrap();
    let sb = gw.handle_stream(&b, &completion_frame(&b, "y", true)).await.unwrap();

    let (ea, eb) = timeout(TIMEOUT, async {
        futures::join!(sa.collect::<Vec<_>>(), sb.collect::<Vec<_>>())
    })
    .await
    .unwrap();

    let text = |events: &[StreamEvent]| events.iter().filter_map(|e| e.content()).collect::<String>();
    assert_eq!(text(&ea), "a-0;a-1;a-2;a-3;a-4;");
    assert_eq!(text(&eb), "b-0;b-1;b-2;b-3;b-4;");
    gw.supervisor().close().await;
}

// ── Connection loss ──

#[tokio::test]
async fn pending_request_fails_on_disconnect() {
    let mock = MockUpstream::start(silent).await;
    let gw = Arc::new(gateway(&mock.url).await);

    let id = CorrelationId::from_raw("r1");
    let task = {
        let gw = gw.clone();
        let id = id.clone();
        tokio::spawn(async move { gw.handle_unary(&id, &completion_frame(&id, "hi", false)).await })
    };
    wait_for(|| mock.received().len() == 1).await;

    mock.kick();
    let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), GatewayError::ConnectionLost);
    assert!(gw.registry().is_empty());
    gw.supervisor().close().await;
}

#[tokio::test]
async fn reconnects_after_peer_close() {
    let mock = MockUpstream::start(echo).await;
    let gw = gateway(&mock.url).await;

    mock.kick();
    wait_for(|| mock.connections.load(Ordering::SeqCst) == 2).await;
    wait_for(|| gw.supervisor().state() == ConnectionState::Connected).await;
    assert_eq!(gw.supervisor().retry_count(), 0);

    let id = CorrelationId::from_raw("after");
    let completion = timeout(TIMEOUT, gw.handle_unary(&id, &completion_frame(&id, "again", false)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.content(), "echo:again");
    gw.supervisor().close().await;
}

#[tokio::test]
async fn close_fails_open_streams() {
    let mock = MockUpstream::start(silent).await;
    let gw = gateway(&mock.url).await;

    let id = CorrelationId::from_raw("r2");
    let stream = gw.handle_stream(&id, &completion_frame(&id, "hi", true)).await.unwrap();
    gw.supervisor().close().await;

    let events: Vec<StreamEvent> = timeout(TIMEOUT, stream.collect()).await.unwrap();
    assert_eq!(events, vec![StreamEvent::Failed(GatewayError::ConnectionLost)]);
    assert!(gw.registry().is_empty());
}

// ── Auxiliary calls ──

#[tokio::test]
async fn call_uses_fresh_correlation_id() {
    let mock = MockUpstream::start(|frame| {
        vec![json!({"requestId": request_id(frame), "code": 200, "response": "ok"})]
    })
    .await;
    let gw = gateway(&mock.url).await;

    let reply = gw
        .call("walletAuth/authenticateWallet", json!({"walletAddress": "0xabc"}), TIMEOUT)
        .await
        .unwrap();
    assert!(reply.is_success());
    assert_eq!(reply.payload, "ok");

    let sent = mock.received();
    assert_eq!(sent[0]["method"], "walletAuth/authenticateWallet");
    assert_eq!(sent[0]["args"]["walletAddress"], "0xabc");
    assert!(sent[0]["requestId"].as_str().unwrap().starts_with("req_"));
    gw.supervisor().close().await;
}
