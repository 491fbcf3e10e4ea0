//! End-to-end tests of the WebSocket transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use herald_core::{Channel, ChannelError, ChannelRouter, Join, Reply, Socket};
use herald_protocol::{events, Codec, Encoded, Envelope};
use herald_server::{build_app, AppState, Config};
use herald_transport::UnmatchedTopic;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

struct Room;

#[async_trait]
impl Channel for Room {
    async fn join(&mut self, _: &str, payload: Value, _: &mut Socket) -> Result<Join, ChannelError> {
        if payload.get("deny").is_some() {
            return Ok(Join::error("denied"));
        }
        Ok(Join::ok())
    }

    async fn handle_in(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError> {
        match event {
            "shout" => {
                socket.broadcast("shout", payload).await;
                Ok(Reply::ok(json!({})))
            }
            "shout_others" => {
                socket.broadcast_from("shout", payload).await;
                Ok(Reply::ok(json!({})))
            }
            "crash" => Err(ChannelError::new("boom")),
            _ => Ok(Reply::ok(payload)),
        }
    }
}

async fn start(config: Config) -> SocketAddr {
    let router = ChannelRouter::new().channel("rooms:*", || Room).unwrap();
    let state = Arc::new(AppState::new(config, router).unwrap());
    let app = build_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.security.secret_key_base = "test-secret".into();
    config
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: Codec,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with(addr, "", Codec::Json).await
    }

    async fn connect_with(addr: SocketAddr, query: &str, codec: Codec) -> Self {
        let url = format!("ws://{addr}/socket/websocket{query}");
        let (ws, _) = connect_async(url).await.unwrap();
        Self { ws, codec }
    }

    async fn send(&mut self, topic: &str, event: &str, payload: Value, reference: Option<&str>) {
        let envelope = Envelope::new(topic, event, payload, reference.map(String::from));
        let message = match self.codec.encode(&envelope).unwrap() {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.ws.send(message).await.unwrap();
    }

    async fn join(&mut self, topic: &str, reference: &str) {
        self.send(topic, events::JOIN, json!({}), Some(reference)).await;
        let reply = self.recv().await;
        assert_eq!(reply.topic, topic);
        assert_eq!(reply.reference.as_deref(), Some(reference));
        assert_eq!(reply.reply_status(), Some("ok"));
    }

    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(message)) => return Some(message),
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn recv(&mut self) -> Envelope {
        let message = timeout(RECV_TIMEOUT, self.next_message())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed");
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            Message::Binary(data) => self.codec.decode(&data, true).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    /// Read until an envelope with `event` arrives on `topic`.
    async fn recv_event(&mut self, topic: &str, event: &str) -> Envelope {
        loop {
            let envelope = self.recv().await;
            if envelope.topic == topic && envelope.event == event {
                return envelope;
            }
        }
    }

    async fn assert_quiet(&mut self) {
        if let Ok(message) = timeout(QUIET, self.next_message()).await {
            panic!("expected no message, got {message:?}");
        }
    }
}

#[tokio::test]
async fn test_join_and_echo() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;

    client.join("rooms:lobby", "1").await;
    client
        .send("rooms:lobby", "echo", json!({"n": 1}), Some("2"))
        .await;

    let reply = client.recv().await;
    assert_eq!(reply.event, events::REPLY);
    assert_eq!(reply.reference.as_deref(), Some("2"));
    assert_eq!(reply.payload, json!({"status": "ok", "response": {"n": 1}}));
}

#[tokio::test]
async fn test_join_refused_by_channel() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;

    client
        .send("rooms:lobby", events::JOIN, json!({"deny": true}), Some("1"))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.reply_status(), Some("error"));
    assert_eq!(reply.payload["response"]["reason"], "denied");

    // Not joined: events are dropped without a reply.
    client.send("rooms:lobby", "echo", json!({}), Some("2")).await;
    client.assert_quiet().await;
}

#[tokio::test]
async fn test_broadcast_reaches_all_subscribers() {
    let addr = start(test_config()).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.join("rooms:lobby", "1").await;
    bob.join("rooms:lobby", "1").await;

    alice
        .send("rooms:lobby", "shout", json!({"body": "hi"}), Some("2"))
        .await;

    let push = bob.recv().await;
    assert_eq!(push.event, "shout");
    assert_eq!(push.payload, json!({"body": "hi"}));
    assert!(push.reference.is_none());

    let own = alice.recv_event("rooms:lobby", "shout").await;
    assert_eq!(own.payload, json!({"body": "hi"}));
}

#[tokio::test]
async fn test_broadcast_from_skips_sender() {
    let addr = start(test_config()).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.join("rooms:lobby", "1").await;
    bob.join("rooms:lobby", "1").await;

    alice
        .send("rooms:lobby", "shout_others", json!({"body": "hi"}), Some("2"))
        .await;

    assert_eq!(bob.recv().await.event, "shout");
    let reply = alice.recv().await;
    assert_eq!(reply.event, events::REPLY);
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_leave_closes_channel() {
    let addr = start(test_config()).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.join("rooms:lobby", "1").await;
    bob.join("rooms:lobby", "1").await;

    alice
        .send("rooms:lobby", events::LEAVE, json!({}), Some("2"))
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply.reference.as_deref(), Some("2"));
    assert_eq!(reply.reply_status(), Some("ok"));
    let close = alice.recv().await;
    assert_eq!(close.event, events::CLOSE);
    assert_eq!(close.topic, "rooms:lobby");

    bob.send("rooms:lobby", "shout", json!({}), Some("2")).await;
    bob.recv_event("rooms:lobby", "shout").await;
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_crash_is_isolated_to_its_topic() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;
    client.join("rooms:a", "1").await;
    client.join("rooms:b", "2").await;

    client.send("rooms:a", "crash", json!({}), Some("3")).await;
    let error = client.recv_event("rooms:a", events::ERROR).await;
    assert_eq!(error.payload, json!({}));
    assert!(error.reference.is_none());

    client.send("rooms:b", "echo", json!({"ok": true}), Some("4")).await;
    let reply = client.recv_event("rooms:b", events::REPLY).await;
    assert_eq!(reply.reference.as_deref(), Some("4"));

    // The crashed topic can be joined again.
    client.join("rooms:a", "5").await;
}

#[tokio::test]
async fn test_unmatched_topic_rejected() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;

    client
        .send("nowhere:1", events::JOIN, json!({}), Some("1"))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.reply_status(), Some("error"));
    assert_eq!(reply.payload["response"]["reason"], "unmatched topic");
}

#[tokio::test]
async fn test_unmatched_topic_dropped() {
    let mut config = test_config();
    config.channels.unmatched_topic = UnmatchedTopic::Drop;
    let addr = start(config).await;
    let mut client = Client::connect(addr).await;

    client
        .send("nowhere:1", events::JOIN, json!({}), Some("1"))
        .await;
    client
        .send("phoenix", events::HEARTBEAT, json!({}), Some("2"))
        .await;

    let reply = client.recv().await;
    assert_eq!(reply.topic, "phoenix");
    assert_eq!(reply.reference.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_heartbeat_reply() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;

    client
        .send("phoenix", events::HEARTBEAT, json!({}), Some("7"))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.event, events::REPLY);
    assert_eq!(reply.reply_status(), Some("ok"));
    assert_eq!(reply.reference.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_origin_check() {
    let mut config = test_config();
    config.security.check_origin = true;
    config.security.allowed_origins = vec!["https://example.com".into()];
    let addr = start(config).await;
    let url = format!("ws://{addr}/socket/websocket");

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.test"));
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403, got {:?}", other.map(|(_, r)| r.status())),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://example.com"));
    let (ws, _) = connect_async(request).await.unwrap();
    let mut client = Client {
        ws,
        codec: Codec::Json,
    };
    client.join("rooms:lobby", "1").await;
}

#[tokio::test]
async fn test_incompatible_version_refused() {
    let addr = start(test_config()).await;
    let url = format!("ws://{addr}/socket/websocket?vsn=9.0.0");

    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected 400, got {:?}", other.map(|(_, r)| r.status())),
    }

    let url = format!("ws://{addr}/socket/websocket?vsn=1.0.0");
    assert!(connect_async(url).await.is_ok());
}

#[tokio::test]
async fn test_msgpack_serializer() {
    let addr = start(test_config()).await;
    let mut client = Client::connect_with(addr, "?serializer=msgpack", Codec::MessagePack).await;

    client.join("rooms:lobby", "1").await;
    client
        .send("rooms:lobby", "echo", json!({"n": 2}), Some("2"))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.payload["response"]["n"], 2);
}

#[tokio::test]
async fn test_undecodable_message_closes_connection() {
    let addr = start(test_config()).await;
    let mut client = Client::connect(addr).await;

    client
        .ws
        .send(Message::Text("not an envelope".into()))
        .await
        .unwrap();

    let next = timeout(RECV_TIMEOUT, client.next_message()).await.unwrap();
    assert!(matches!(next, None | Some(Message::Close(_))));
}
