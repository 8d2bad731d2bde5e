use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Query;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use spider_peer::session::{CloseReason, NegotiationState, Role, Session, SessionConfig};
use spider_peer::signaling::websocket::{ConnectOptions, connect};
use spider_peer::transport::mock::MockTransport;
use spider_proto::Envelope;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

const STEP: Duration = Duration::from_secs(5);

/// Stand-in relay: announces a join, pushes an offer and a legacy
/// candidate once the answer arrives, then hangs up.
async fn relay(socket: WebSocket, seen: mpsc::UnboundedSender<String>) {
    let (mut sender, mut receiver) = socket.split();
    for text in [
        r#"{"type":"joins","data":"1"}"#,
        r#"{"type":"offer","data":"remote-offer"}"#,
    ] {
        if sender.send(WsMessage::Text(text.into())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = receiver.next().await {
        if let WsMessage::Text(text) = message {
            let is_answer = text.contains(r#""type":"answer""#);
            let _ = seen.send(text);
            if is_answer {
                break;
            }
        }
    }
    let candidate = r#"{"type":"candidate","data":"candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host"}"#;
    let _ = sender.send(WsMessage::Text(candidate.into())).await;
    let _ = sender.send(WsMessage::Close(None)).await;
}

async fn spawn_relay() -> (Url, mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<HashMap<String, String>>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (query_tx, query_rx) = mpsc::unbounded_channel();
    let router = Router::new().route(
        "/live/ws/sub",
        get(
            move |ws: WebSocketUpgrade, Query(query): Query<HashMap<String, String>>| {
                let seen = seen_tx.clone();
                let _ = query_tx.send(query);
                async move { ws.on_upgrade(move |socket| relay(socket, seen)).into_response() }
            },
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    let url = Url::parse(&format!(
        "ws://{addr}/live/ws/sub?channel=test-channel&vcodec=h264"
    ))
    .unwrap();
    (url, seen_rx, query_rx)
}

#[tokio::test]
async fn viewer_answers_over_a_real_websocket() {
    let (url, mut seen, mut queries) = spawn_relay().await;
    let (writer, reader) = connect(&ConnectOptions::new(url)).await.expect("connect relay");

    let query = timeout(STEP, queries.recv()).await.unwrap().unwrap();
    assert_eq!(query.get("channel").map(String::as_str), Some("test-channel"));
    assert_eq!(query.get("vcodec").map(String::as_str), Some("h264"));

    let (viewer, events) = MockTransport::new("sub");
    let (session, handle) = Session::new(
        SessionConfig::new(Role::Responder),
        Arc::new(viewer.clone()),
        events,
    );
    let run = tokio::spawn(session.run(writer, reader));

    let answer = timeout(STEP, seen.recv()).await.unwrap().unwrap();
    let envelope = Envelope::from_json(&answer).unwrap();
    assert_eq!(envelope.kind, "answer");
    assert_eq!(envelope.data, "sub-answer-1");

    let outcome = timeout(STEP, run).await.unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::ChannelClosed);
    assert!(outcome.reached_negotiated);
    assert_eq!(outcome.remote_description.unwrap().sdp, "remote-offer");
    assert_eq!(outcome.applied_candidates.len(), 1);
    assert_eq!(
        outcome.applied_candidates[0].candidate,
        "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host"
    );
    assert_eq!(handle.state(), NegotiationState::Closed);
    assert!(viewer.is_closed());
}

#[tokio::test]
async fn unreachable_relay_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/live/ws/pub")).unwrap();
    let err = connect(&ConnectOptions::new(url)).await.err().expect("connect should fail");
    assert!(err.to_string().contains(&addr.to_string()));
}
