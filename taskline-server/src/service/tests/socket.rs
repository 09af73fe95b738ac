//! Live connections tests, run against a real server

use std::time::Duration;

use actix_http::ws;
use actix_web::App;
use actix_web::http::StatusCode;
use actix_web::rt::time::sleep;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};

use crate::model::Model;
use crate::model::users::UserId;
use crate::service;
use crate::service::tests::{app, call};

/// Starts the service on a random port
fn start(model: Model) -> actix_test::TestServer {
    let config = service::configure(model);
    actix_test::start(move || App::new().configure(config.clone()))
}

async fn signup(srv: &actix_test::TestServer, name: &str) -> (UserId, String) {
    let mut resp = srv
        .post("/api/signup")
        .send_json(&json!({
            "name": name,
            "email": format!("{name}@example.com"),
            "password": "password",
        }))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let body: Value = resp.json().await.unwrap();
    let id = body["user"]["id"].as_str().unwrap().parse().unwrap();
    let token = body["token"].as_str().unwrap().to_owned();
    (id, token)
}

fn authenticate(token: &str) -> ws::Message {
    let frame = json!({ "event": "authenticate", "data": token });
    ws::Message::Text(frame.to_string().into())
}

/// Next frame which is not a heartbeat
async fn next_frame<S>(framed: &mut S) -> ws::Frame
where
    S: futures_util::Stream<Item = Result<ws::Frame, ws::ProtocolError>> + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(ws::Frame::Ping(_) | ws::Frame::Pong(_))) => continue,
            Some(Ok(frame)) => return frame,
            frame => panic!("Unexpected frame {frame:?}"),
        }
    }
}

fn text_json(frame: ws::Frame) -> Value {
    match frame {
        ws::Frame::Text(text) => serde_json::from_slice(&text).unwrap(),
        frame => panic!("Expected text frame, got {frame:?}"),
    }
}

/// Waits until the user presence matches `online`
async fn wait_presence(model: &Model, user: UserId, online: bool) {
    for _ in 0..200 {
        if model.presence().lookup(user).is_some() == online {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }

    panic!("User {user} presence never became {online}");
}

#[actix_web::test]
async fn failed_handshake_closes_connection() {
    let model = Model::test().await.unwrap();
    let mut srv = start(model.clone());

    let mut framed = srv.ws_at("/ws").await.unwrap();
    framed.send(authenticate("not.a.token")).await.unwrap();

    let event = text_json(next_frame(&mut framed).await);
    assert_eq!(
        event,
        json!({ "event": "authError", "data": { "message": "Authentication failed" } })
    );
    assert!(matches!(next_frame(&mut framed).await, ws::Frame::Close(_)));
    assert!(model.presence().is_empty());
}

#[actix_web::test]
async fn authenticated_connection_receives_messages() {
    let model = Model::test().await.unwrap();
    let mut srv = start(model.clone());
    let (alice, alice_token) = signup(&srv, "alice").await;
    let (bob, _) = signup(&srv, "bob").await;

    let mut framed = srv.ws_at("/ws").await.unwrap();
    framed.send(authenticate(&alice_token)).await.unwrap();
    wait_presence(&model, alice, true).await;

    let dispatched = model
        .dispatcher()
        .send(bob, alice, "hello".to_owned())
        .await
        .unwrap();

    let event = text_json(next_frame(&mut framed).await);
    assert_eq!(event["event"], json!("newMessage"));
    assert_eq!(event["data"]["id"], json!(dispatched.id));
    assert_eq!(event["data"]["sender_id"], json!(bob));
    assert_eq!(event["data"]["message"], json!("hello"));

    framed.send(ws::Message::Close(None)).await.unwrap();
    drop(framed);
    wait_presence(&model, alice, false).await;
}

#[actix_web::test]
async fn dropped_client_is_unregistered() {
    let model = Model::test().await.unwrap();
    let mut srv = start(model.clone());
    let (alice, alice_token) = signup(&srv, "alice").await;

    let mut framed = srv.ws_at("/ws").await.unwrap();
    framed.send(authenticate(&alice_token)).await.unwrap();
    wait_presence(&model, alice, true).await;

    drop(framed);
    wait_presence(&model, alice, false).await;
}

#[actix_web::test]
async fn socket_requires_upgrade() {
    let app = app(Model::test().await.unwrap()).await;
    let (status, body) = call(&app, actix_web::test::TestRequest::get().uri("/ws")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}
