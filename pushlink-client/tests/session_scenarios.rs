//! End-to-end session scenarios against in-process fake servers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use pushlink_client::{
    ClientListener, ClientStatus, ConnectionOptions, ForcedTransport, MessageListener, PushClient,
    PushClientBuilder, Subscription, SubscriptionListener, SubscriptionMode,
};
use pushlink_core::{ControlOp, Request};

mod fake {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use pushlink_core::Request;

    /// One accepted WebSocket conversation.
    pub struct WsConn {
        ws: WebSocketStream<TcpStream>,
    }

    impl WsConn {
        /// Next request frame from the client.
        pub async fn expect_request(&mut self) -> Request {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Request::parse_frame(&text).expect("client sent a bad frame")
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("client connection ended: {other:?}"),
                }
            }
        }

        pub async fn send_line(&mut self, line: &str) {
            self.ws
                .send(Message::Text(format!("{line}\r\n").into()))
                .await
                .expect("send to client failed");
        }
    }

    /// A WebSocket fake bound to an ephemeral port; every accepted
    /// conversation is handed to the test through the channel.
    pub async fn ws_server() -> (String, mpsc::Receiver<WsConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(WsConn { ws }).await.is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    pub struct HttpRequest {
        pub path: String,
        pub body: String,
        pub is_upgrade: bool,
    }

    /// One accepted plain-HTTP connection, serving requests sequentially.
    pub struct HttpConn {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl HttpConn {
        pub async fn read_request(&mut self) -> Option<HttpRequest> {
            loop {
                if let Some(head_end) = find(&self.buf, b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&self.buf[..head_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    let body_start = head_end + 4;
                    while self.buf.len() < body_start + content_length {
                        if !self.fill().await {
                            return None;
                        }
                    }
                    let body = String::from_utf8_lossy(
                        &self.buf[body_start..body_start + content_length],
                    )
                    .to_string();
                    let path = head
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("")
                        .to_string();
                    let is_upgrade = head.to_ascii_lowercase().contains("upgrade: websocket");
                    self.buf.drain(..body_start + content_length);
                    return Some(HttpRequest {
                        path,
                        body,
                        is_upgrade,
                    });
                }
                if !self.fill().await {
                    return None;
                }
            }
        }

        async fn fill(&mut self) -> bool {
            let mut tmp = [0u8; 4096];
            match self.stream.read(&mut tmp).await {
                Ok(0) | Err(_) => false,
                Ok(n) => {
                    self.buf.extend_from_slice(&tmp[..n]);
                    true
                }
            }
        }

        pub async fn respond_error(&mut self) {
            let _ = self
                .stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        }

        pub async fn start_chunked(&mut self) {
            let _ = self
                .stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await;
        }

        pub async fn send_chunk(&mut self, line: &str) {
            let payload = format!("{line}\r\n");
            let framed = format!("{:x}\r\n{payload}\r\n", payload.len());
            let _ = self.stream.write_all(framed.as_bytes()).await;
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    pub async fn http_server() -> (String, mpsc::Receiver<HttpConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx
                    .send(HttpConn {
                        stream,
                        buf: Vec::new(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        (addr, rx)
    }
}

#[derive(Default)]
struct StatusRecorder {
    statuses: Mutex<Vec<ClientStatus>>,
}

impl ClientListener for StatusRecorder {
    fn on_status_change(&self, status: ClientStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

impl StatusRecorder {
    fn snapshot(&self) -> Vec<ClientStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        forced_transport: Some(ForcedTransport::WsStreaming),
        first_retry_max_delay: Duration::from_secs(5),
        retry_delay: Duration::from_millis(100),
        session_recovery_timeout: Duration::ZERO,
        ..Default::default()
    }
}

async fn wait_for_status(client: &PushClient, target: ClientStatus) {
    let mut updates = client.status_updates();
    timeout(Duration::from_secs(10), updates.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .unwrap();
    // Give the events task a beat so listener callbacks catch up.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn clean_connect_over_ws_streaming() {
    let (addr, mut conns) = fake::ws_server().await;
    let recorder = Arc::new(StatusRecorder::default());
    let client = PushClientBuilder::new(addr)
        .options(fast_options())
        .build()
        .unwrap();
    client.add_listener(recorder.clone());

    assert_eq!(client.status(), ClientStatus::Disconnected);
    client.connect();

    let mut conn = conns.recv().await.unwrap();
    let create = conn.expect_request().await;
    assert!(matches!(create, Request::CreateSession(_)));
    conn.send_line("CONOK,S1,50000,5000,*").await;

    let bind = conn.expect_request().await;
    match &bind {
        Request::BindSession(b) => {
            assert_eq!(b.session, "S1");
            assert!(!b.polling);
        }
        other => panic!("expected bind, got {other:?}"),
    }
    conn.send_line("LOOP,0").await;

    let rebind = conn.expect_request().await;
    assert!(matches!(rebind, Request::BindSession(_)));
    conn.send_line("SERVNAME,fake-node").await;

    wait_for_status(&client, ClientStatus::WsStreaming).await;
    assert_eq!(
        recorder.snapshot(),
        vec![
            ClientStatus::Connecting,
            ClientStatus::StreamSensing,
            ClientStatus::WsStreaming,
        ]
    );
    assert_eq!(client.session_id().as_deref(), Some("S1"));
    client.shutdown().await;
}

#[tokio::test]
async fn connect_is_idempotent() {
    let (addr, mut conns) = fake::ws_server().await;
    let client = PushClientBuilder::new(addr)
        .options(fast_options())
        .build()
        .unwrap();
    client.connect();
    client.connect();
    client.connect();

    let mut conn = conns.recv().await.unwrap();
    let _ = conn.expect_request().await;
    conn.send_line("CONOK,S1,50000,5000,*").await;
    let _ = conn.expect_request().await;
    conn.send_line("SYNC,0").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;

    // No extra session attempt may show up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(conns.try_recv().is_err());

    client.disconnect();
    wait_for_status(&client, ClientStatus::Disconnected).await;
    client.disconnect();
    assert_eq!(client.status(), ClientStatus::Disconnected);
    client.shutdown().await;
}

struct SubRecorder {
    subscribed: AtomicU32,
}

impl SubscriptionListener for SubRecorder {
    fn on_subscribed(&self) {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn resubscribe_across_session_turnover() {
    let (addr, mut conns) = fake::ws_server().await;
    let client = PushClientBuilder::new(addr)
        .options(fast_options())
        .build()
        .unwrap();
    let listener = Arc::new(SubRecorder {
        subscribed: AtomicU32::new(0),
    });
    let sub = Subscription::new(SubscriptionMode::Merge);
    sub.set_item_group("items").unwrap();
    sub.set_field_schema("fields").unwrap();
    sub.add_listener(listener.clone());
    client.subscribe(&sub).unwrap();
    client.connect();

    // Session one: accept the subscription under sub id 1.
    let mut conn1 = conns.recv().await.unwrap();
    let _ = conn1.expect_request().await;
    conn1.send_line("CONOK,S1,50000,5000,*").await;
    let _ = conn1.expect_request().await;
    conn1.send_line("SYNC,0").await;
    let subscribe = conn1.expect_request().await;
    let req_id = match &subscribe {
        Request::Control(c) => {
            match &c.op {
                ControlOp::Add {
                    sub_id,
                    group,
                    schema,
                    ..
                } => {
                    assert_eq!(*sub_id, 1);
                    assert_eq!(group, "items");
                    assert_eq!(schema, "fields");
                }
                other => panic!("expected subscribe, got {other:?}"),
            }
            c.req_id
        }
        other => panic!("expected control, got {other:?}"),
    };
    conn1.send_line(&format!("REQOK,{req_id}")).await;
    conn1.send_line("SUBOK,1,1,2").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;
    assert_eq!(listener.subscribed.load(Ordering::SeqCst), 1);
    assert_eq!(sub.sub_id(), Some(1));

    // Kill the transport; recovery is disabled, so a fresh session starts.
    drop(conn1);
    wait_for_status(&client, ClientStatus::WillRetry).await;

    let mut conn2 = conns.recv().await.unwrap();
    let create = conn2.expect_request().await;
    assert!(matches!(create, Request::CreateSession(_)));
    conn2.send_line("CONOK,S2,50000,5000,*").await;
    let _ = conn2.expect_request().await;
    conn2.send_line("SYNC,0").await;

    // Exactly one new SUB, under a fresh id, same parameters.
    let resubscribe = conn2.expect_request().await;
    let req_id = match &resubscribe {
        Request::Control(c) => {
            match &c.op {
                ControlOp::Add {
                    sub_id,
                    group,
                    schema,
                    ..
                } => {
                    assert_eq!(*sub_id, 2);
                    assert_eq!(group, "items");
                    assert_eq!(schema, "fields");
                }
                other => panic!("expected subscribe, got {other:?}"),
            }
            c.req_id
        }
        other => panic!("expected control, got {other:?}"),
    };
    conn2.send_line(&format!("REQOK,{req_id}")).await;
    conn2.send_line("SUBOK,2,1,2").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;
    assert_eq!(listener.subscribed.load(Ordering::SeqCst), 2);
    assert_eq!(sub.sub_id(), Some(2));
    client.shutdown().await;
}

#[tokio::test]
async fn stalled_then_recovery_carries_progressive() {
    let (addr, mut conns) = fake::ws_server().await;
    let recorder = Arc::new(StatusRecorder::default());
    let options = ConnectionOptions {
        stalled_timeout: Duration::from_millis(200),
        reconnect_timeout: Duration::from_millis(300),
        session_recovery_timeout: Duration::from_secs(10),
        ..fast_options()
    };
    let client = PushClientBuilder::new(addr)
        .options(options)
        .build()
        .unwrap();
    client.add_listener(recorder.clone());
    client.connect();

    let mut conn1 = conns.recv().await.unwrap();
    let _ = conn1.expect_request().await;
    // A short keepalive grant makes the stall detection fast.
    conn1.send_line("CONOK,S1,50000,300,*").await;
    let _ = conn1.expect_request().await;
    conn1.send_line("U,9,1,x").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;

    // Withhold all data: stalled, then a recover with the progressive.
    wait_for_status(&client, ClientStatus::Stalled).await;
    wait_for_status(&client, ClientStatus::TryingRecovery).await;

    let mut conn2 = conns.recv().await.unwrap();
    let recover = conn2.expect_request().await;
    match &recover {
        Request::Recover(r) => {
            assert_eq!(r.session, "S1");
            assert_eq!(r.recovery_from, 1);
        }
        other => panic!("expected recover, got {other:?}"),
    }
    conn2.send_line("CONOK,S1,50000,300,*").await;
    conn2.send_line("U,9,1,y").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;

    assert_eq!(
        recorder.snapshot(),
        vec![
            ClientStatus::Connecting,
            ClientStatus::StreamSensing,
            ClientStatus::WsStreaming,
            ClientStatus::Stalled,
            ClientStatus::TryingRecovery,
            ClientStatus::StreamSensing,
            ClientStatus::WsStreaming,
        ]
    );
    client.shutdown().await;
}

#[derive(Default)]
struct MsgRecorder {
    processed: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
}

impl MessageListener for MsgRecorder {
    fn on_processed(&self, text: &str) {
        self.processed.lock().unwrap().push(text.to_string());
    }
    fn on_discarded(&self, text: &str) {
        self.discarded.lock().unwrap().push(text.to_string());
    }
}

#[tokio::test]
async fn ordered_messages_with_server_side_discard() {
    let (addr, mut conns) = fake::ws_server().await;
    let client = PushClientBuilder::new(addr)
        .options(fast_options())
        .build()
        .unwrap();
    client.connect();

    let mut conn = conns.recv().await.unwrap();
    let _ = conn.expect_request().await;
    conn.send_line("CONOK,S1,50000,5000,*").await;
    let _ = conn.expect_request().await;
    conn.send_line("SYNC,0").await;
    wait_for_status(&client, ClientStatus::WsStreaming).await;

    let listener = Arc::new(MsgRecorder::default());
    for text in ["m1", "m2", "m3"] {
        client
            .send_message_full(text, Some("s"), None, Some(listener.clone()), false)
            .unwrap();
    }
    for expected_prog in 1..=3u64 {
        let msg = conn.expect_request().await;
        match &msg {
            Request::Msg(m) => {
                assert_eq!(m.sequence, "s");
                assert_eq!(m.prog, Some(expected_prog));
            }
            other => panic!("expected msg, got {other:?}"),
        }
    }
    conn.send_line("MSGDONE,s,1").await;
    // The server gave up on m2; the client must not retry it, and m3 must
    // not be blocked by it.
    conn.send_line("MSGFAIL,s,2,38,timeout exceeded").await;
    conn.send_line("MSGDONE,s,3").await;

    timeout(Duration::from_secs(5), async {
        loop {
            if listener.processed.lock().unwrap().len() == 2
                && listener.discarded.lock().unwrap().len() == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("message outcomes never arrived");
    assert_eq!(*listener.processed.lock().unwrap(), vec!["m1", "m3"]);
    assert_eq!(*listener.discarded.lock().unwrap(), vec!["m2"]);
    client.shutdown().await;
}

#[tokio::test]
async fn early_ws_failure_falls_back_to_http_streaming() {
    let (addr, conns) = fake::http_server().await;
    let recorder = Arc::new(StatusRecorder::default());
    let (bind_tx, mut bind_rx) = mpsc::channel::<String>(1);

    // Server logic: break WS upgrades, answer the create with CONOK and
    // keep the bind stream open.
    tokio::spawn(async move {
        let mut conns = conns;
        while let Some(mut conn) = conns.recv().await {
            let bind_tx = bind_tx.clone();
            tokio::spawn(async move {
                while let Some(request) = conn.read_request().await {
                    if request.is_upgrade {
                        conn.respond_error().await;
                        return;
                    }
                    match request.path.as_str() {
                        "/pushlink/create_session" => {
                            conn.start_chunked().await;
                            conn.send_chunk("CONOK,S1,50000,5000,*").await;
                        }
                        "/pushlink/bind_session" => {
                            let _ = bind_tx.send(request.body.clone()).await;
                            conn.start_chunked().await;
                            conn.send_chunk("SYNC,0").await;
                        }
                        _ => conn.respond_error().await,
                    }
                }
            });
        }
    });

    let options = ConnectionOptions {
        forced_transport: None,
        early_ws_open: true,
        ..fast_options()
    };
    let client = PushClientBuilder::new(addr)
        .options(options)
        .build()
        .unwrap();
    client.add_listener(recorder.clone());
    client.connect();

    wait_for_status(&client, ClientStatus::HttpStreaming).await;
    let bind_body = timeout(Duration::from_secs(5), bind_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(bind_body.contains("LS_session=S1"));
    assert_eq!(
        recorder.snapshot(),
        vec![
            ClientStatus::Connecting,
            ClientStatus::StreamSensing,
            ClientStatus::HttpStreaming,
        ]
    );
    client.shutdown().await;
}
