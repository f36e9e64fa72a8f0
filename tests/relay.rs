//! 릴레이 서버 + WebSocket 시그널링 채널 통합 테스트

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ponswarp_session::config::Config;
use ponswarp_session::engine::{SignalingChannel, WsSignalingChannel};
use ponswarp_session::protocol::{ClientMessage, SdpKind, ServerMessage, SessionDescription};
use ponswarp_session::server;
use ponswarp_session::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

async fn spawn_relay() -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::new(Config::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}/ws", addr), state)
}

async fn recv(events: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("relay message timed out")
        .expect("relay stream ended")
}

async fn join(channel: &WsSignalingChannel, events: &mut UnboundedReceiver<ServerMessage>, session_id: &str) {
    channel
        .send(ClientMessage::RoomJoin {
            session_id: session_id.to_string(),
        })
        .unwrap();
    loop {
        if let ServerMessage::RoomJoined { session_id: joined, .. } = recv(events).await {
            assert_eq!(joined, session_id);
            return;
        }
    }
}

#[tokio::test]
async fn offer_is_relayed_to_target_with_sender_stamped() {
    let (url, _state) = spawn_relay().await;
    let alice = WsSignalingChannel::connect(&url, "alice").await.unwrap();
    let bob = WsSignalingChannel::connect(&url, "bob").await.unwrap();
    assert_eq!(alice.participant_id(), "alice");

    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();
    join(&alice, &mut alice_events, "s1").await;
    join(&bob, &mut bob_events, "s1").await;

    let description = SessionDescription::new(SdpKind::Offer, "v=0\r\n");
    alice
        .send(ClientMessage::Offer {
            session_id: "s1".into(),
            description: description.clone(),
            generation: 1,
            target: Some("bob".into()),
        })
        .unwrap();

    assert_eq!(
        recv(&mut bob_events).await,
        ServerMessage::Offer {
            session_id: "s1".into(),
            from: "alice".into(),
            description,
            generation: 1,
        }
    );
}

#[tokio::test]
async fn room_wide_terminate_reaches_every_viewer() {
    let (url, _state) = spawn_relay().await;
    let host = WsSignalingChannel::connect(&url, "host").await.unwrap();
    let mut host_events = host.take_events().unwrap();
    join(&host, &mut host_events, "b1").await;

    let mut viewers = Vec::new();
    for id in ["v1", "v2", "v3"] {
        let viewer = WsSignalingChannel::connect(&url, id).await.unwrap();
        let mut events = viewer.take_events().unwrap();
        join(&viewer, &mut events, "b1").await;
        viewers.push((viewer, events));
    }

    host.send(ClientMessage::Terminate {
        session_id: "b1".into(),
        reason: "broadcast-ended".into(),
        target: None,
    })
    .unwrap();

    for (_viewer, events) in viewers.iter_mut() {
        loop {
            match recv(events).await {
                ServerMessage::Terminate { from, reason, .. } => {
                    assert_eq!(from, "host");
                    assert_eq!(reason, "broadcast-ended");
                    break;
                }
                ServerMessage::PeerJoined { .. } => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn dropped_socket_ends_event_stream_and_notifies_room() {
    let (url, state) = spawn_relay().await;
    let alice = WsSignalingChannel::connect(&url, "alice").await.unwrap();
    let bob = WsSignalingChannel::connect(&url, "bob").await.unwrap();
    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();
    join(&alice, &mut alice_events, "s1").await;
    join(&bob, &mut bob_events, "s1").await;

    drop(bob);

    loop {
        if let ServerMessage::PeerLeft { participant_id, .. } = recv(&mut alice_events).await {
            assert_eq!(participant_id, "bob");
            break;
        }
    }
    assert!(state.peer("bob").is_none());
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn participant_id_with_reserved_characters_survives_connect() {
    let (url, state) = spawn_relay().await;
    let channel = WsSignalingChannel::connect(&url, "kim & lee#1").await.unwrap();
    assert_eq!(channel.participant_id(), "kim & lee#1");
    assert!(state.peer("kim & lee#1").is_some());
}

#[tokio::test]
async fn unknown_relay_rejects_connection() {
    let result = WsSignalingChannel::connect("ws://127.0.0.1:1/ws", "alice").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn health_reports_rooms_and_participants() {
    let state = Arc::new(AppState::new(Config::default()));
    let response = server::router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["rooms"], 0);
    assert_eq!(json["participants"], 0);
}
