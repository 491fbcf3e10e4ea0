//! End-to-end tests of the long-poll transport.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use herald_server::{build_app, channels, AppState, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(config: Config) -> Router {
    let state = AppState::new(config, channels::router().unwrap()).unwrap();
    build_app(Arc::new(state))
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.security.secret_key_base = "test-secret".into();
    config.longpoll.poll_timeout_ms = 500;
    config
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap()
}

struct Session {
    token: String,
    sig: String,
}

impl Session {
    async fn open(app: &Router) -> Self {
        let (status, body) = call(app, request(Method::GET, "/socket/longpoll", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], 204);
        Self {
            token: body["token"].as_str().unwrap().to_string(),
            sig: body["sig"].as_str().unwrap().to_string(),
        }
    }

    fn uri(&self) -> String {
        format!("/socket/longpoll?token={}&sig={}", self.token, self.sig)
    }

    async fn publish(&self, app: &Router, envelope: Value) -> Value {
        let (_, body) = call(
            app,
            request(Method::POST, &self.uri(), Body::from(envelope.to_string())),
        )
        .await;
        body
    }

    async fn poll(&self, app: &Router) -> Value {
        let (_, body) = call(app, request(Method::GET, &self.uri(), Body::empty())).await;
        body
    }

    /// Poll until at least `n` messages have been collected.
    async fn poll_messages(&self, app: &Router, n: usize) -> Vec<Value> {
        let mut messages = Vec::new();
        while messages.len() < n {
            let body = self.poll(app).await;
            if let Some(batch) = body["messages"].as_array() {
                messages.extend(batch.iter().cloned());
            }
        }
        messages
    }
}

#[tokio::test]
async fn test_health() {
    let app = app(test_config());
    let (status, body) = call(&app, request(Method::GET, "/health", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_join_and_poll() {
    let app = app(test_config());
    let session = Session::open(&app).await;

    let ack = session
        .publish(
            &app,
            json!({"topic": "rooms:lobby", "event": "phx_join", "payload": {"user": "ann"}, "ref": "1"}),
        )
        .await;
    assert_eq!(ack["status"], 200);

    let messages = session.poll_messages(&app, 2).await;
    assert_eq!(messages[0]["event"], "phx_reply");
    assert_eq!(messages[0]["ref"], "1");
    assert_eq!(messages[0]["payload"]["status"], "ok");
    assert_eq!(messages[1]["event"], "welcome");
    assert_eq!(messages[1]["payload"]["user"], "ann");
}

#[tokio::test]
async fn test_messages_between_transports() {
    let app = app(test_config());
    let ann = Session::open(&app).await;
    let bob = Session::open(&app).await;

    for (session, user) in [(&ann, "ann"), (&bob, "bob")] {
        session
            .publish(
                &app,
                json!({"topic": "rooms:1", "event": "phx_join", "payload": {"user": user}, "ref": "1"}),
            )
            .await;
        session.poll_messages(&app, 2).await;
    }

    ann.publish(
        &app,
        json!({"topic": "rooms:1", "event": "new_msg", "payload": {"body": "hello"}, "ref": "2"}),
    )
    .await;

    let messages = bob.poll_messages(&app, 1).await;
    assert_eq!(messages[0]["event"], "new_msg");
    assert_eq!(messages[0]["payload"], json!({"user": "ann", "body": "hello"}));
    assert!(messages[0]["ref"].is_null());
}

#[tokio::test]
async fn test_empty_poll_times_out() {
    let app = app(test_config());
    let session = Session::open(&app).await;
    let body = session.poll(&app).await;
    assert_eq!(body["status"], 204);
    assert!(body.get("messages").is_none());
}

#[tokio::test]
async fn test_forged_token_is_gone() {
    let app = app(test_config());
    let session = Session::open(&app).await;
    let forged = Session {
        token: session.token.clone(),
        sig: "AAAA".into(),
    };

    let (status, body) = call(&app, request(Method::GET, &forged.uri(), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 410);

    // The reply carries a fresh session the client can keep using.
    let fresh = Session {
        token: body["token"].as_str().unwrap().to_string(),
        sig: body["sig"].as_str().unwrap().to_string(),
    };
    assert_ne!(fresh.token, session.token);
    let ack = fresh
        .publish(
            &app,
            json!({"topic": "rooms:1", "event": "phx_join", "payload": {"user": "ann"}, "ref": "1"}),
        )
        .await;
    assert_eq!(ack["status"], 200);
}

#[tokio::test]
async fn test_bad_envelope() {
    let app = app(test_config());
    let session = Session::open(&app).await;

    let (_, body) = call(
        &app,
        request(Method::POST, &session.uri(), Body::from(r#"{"topic":"rooms:1"}"#)),
    )
    .await;
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_close_session() {
    let app = app(test_config());
    let session = Session::open(&app).await;

    let (_, body) = call(&app, request(Method::DELETE, &session.uri(), Body::empty())).await;
    assert_eq!(body["status"], 200);

    let body = session.poll(&app).await;
    assert_eq!(body["status"], 410);
}

#[tokio::test]
async fn test_forbidden_origin() {
    let mut config = test_config();
    config.security.check_origin = true;
    config.security.allowed_origins = vec!["https://example.com".into()];
    let app = app(config);

    let refused = Request::builder()
        .uri("/socket/longpoll")
        .header("origin", "https://evil.test")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, refused).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], 403);

    let allowed = Request::builder()
        .uri("/socket/longpoll")
        .header("origin", "https://example.com")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, allowed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 204);
}
