use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use groupchat_relay::{
    config::Config,
    db::SqliteStore,
    directory::Directory,
    hub::Collaborators,
    model::Principal,
    server,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    base: String,
    store: SqliteStore,
}

async fn start() -> Server {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let state = server::state(Config::default(), Collaborators::sqlite(store.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::build_router(state)).await.unwrap();
    });

    Server {
        base: format!("{addr}"),
        store,
    }
}

impl Server {
    async fn user(&self, username: &str) -> (Principal, String) {
        let principal = self.store.create_user(username, username).await.unwrap();
        let token = self.store.issue_token(&principal.id).await.unwrap();
        (principal, token)
    }

    async fn socket(&self, token: &str) -> (Socket, Value) {
        let (mut socket, _) = connect_async(format!("ws://{}/ws", self.base)).await.unwrap();
        send(&mut socket, json!({"event": "authenticate", "data": {"token": token}})).await;
        let hello = next_event(&mut socket).await;
        (socket, hello)
    }

    async fn get(&self, token: &str, path: &str) -> (reqwest::StatusCode, Value) {
        let response = reqwest::Client::new()
            .get(format!("http://{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }
}

async fn send(socket: &mut Socket, event: Value) {
    socket.send(Message::text(event.to_string())).await.unwrap();
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Reads until the socket is closed by the server.
async fn closed(socket: &mut Socket) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn invite_accept_join_and_chat() {
    let server = start().await;
    let (u1, u1_token) = server.user("u1").await;
    let (u2, u2_token) = server.user("u2").await;
    let g1 = server.store.create_group_chat("G1", None, &u1.id).await.unwrap();

    let (mut s1, hello) = server.socket(&u1_token).await;
    assert_eq!(hello["event"], "authenticated");
    assert_eq!(hello["data"]["user"]["_id"], u1.id.as_str());
    let (mut s2, _) = server.socket(&u2_token).await;

    send(&mut s1, json!({"event": "incoming-invitation", "data": {
        "inviterId": u1.id, "recipientId": u2.id, "groupChatId": g1.id, "inviteReason": "come chat"
    }}))
    .await;
    let ack = next_event(&mut s1).await;
    assert_eq!(ack["event"], "success-invitation");
    let invited = next_event(&mut s2).await;
    assert_eq!(invited["event"], "new-invitation");
    assert_eq!(invited["data"]["inviteReason"], "come chat");
    let invitation_id = invited["data"]["_id"].clone();

    let (status, pending) = server.get(&u2_token, "/invitations/received?status=pending").await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 1);

    send(&mut s2, json!({"event": "reply-invitation", "data": {
        "invitationId": invitation_id, "status": "accepted"
    }}))
    .await;
    assert_eq!(next_event(&mut s2).await["event"], "success-invitation");
    let answered = next_event(&mut s1).await;
    assert_eq!(answered["event"], "receive-invitation");
    assert_eq!(answered["data"]["status"], "accepted");

    for (socket, user) in [(&mut s1, &u1), (&mut s2, &u2)] {
        send(socket, json!({"event": "join-room", "data": {"roomId": g1.id, "userId": user.id}})).await;
        assert_eq!(next_event(socket).await["event"], "room-joined");
    }

    send(&mut s1, json!({"event": "send-message", "data": {"groupChatId": g1.id, "message": "hello"}})).await;
    for socket in [&mut s1, &mut s2] {
        let received = next_event(socket).await;
        assert_eq!(received["event"], "receive-message");
        assert_eq!(received["data"]["message"], "hello");
        assert_eq!(received["data"]["userId"], u1.id.as_str());
    }

    let path = format!("/chat-histories/chat/{}", g1.id);
    let mut stored = Value::Null;
    for _ in 0..50 {
        let (status, body) = server.get(&u2_token, &path).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        if body.as_array().is_some_and(|m| !m.is_empty()) {
            stored = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored[0]["message"], "hello");
}

#[tokio::test]
async fn rejected_actions_are_acknowledged() {
    let server = start().await;
    let (u1, u1_token) = server.user("u1").await;
    let (_u3, u3_token) = server.user("u3").await;
    let g1 = server.store.create_group_chat("G1", None, &u1.id).await.unwrap();

    let (mut s3, _) = server.socket(&u3_token).await;
    send(&mut s3, json!({"event": "join-room", "data": {"roomId": g1.id}})).await;
    let refused = next_event(&mut s3).await;
    assert_eq!(refused["event"], "error");
    assert_eq!(refused["data"]["event"], "join-room");
    assert_eq!(refused["data"]["code"], "not_authorized");

    send(&mut s3, json!({"event": "ping"})).await;
    assert_eq!(next_event(&mut s3).await["event"], "pong");

    let (status, body) = server.get(&u3_token, &format!("/chat-histories/chat/{}", g1.id)).await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "not_authorized");

    let (status, _) = server.get("forged", "/invitations/sent").await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bad_first_frames_and_malformed_frames_close() {
    let server = start().await;
    let (_u1, u1_token) = server.user("u1").await;

    let (mut forged, refused) = server.socket("forged").await;
    assert_eq!(refused["event"], "error");
    assert_eq!(refused["data"]["code"], "unauthenticated");
    assert!(closed(&mut forged).await);

    let (mut socket, _) = server.socket(&u1_token).await;
    socket.send(Message::text("{not json")).await.unwrap();
    let error = next_event(&mut socket).await;
    assert_eq!(error["data"]["code"], "malformed_frame");
    assert!(closed(&mut socket).await);

    let (status, health) = server.get(&u1_token, "/health").await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(health["status"], "ok");
}

async fn wait_for_connections(server: &Server, token: &str, expected: u64) {
    for _ in 0..100 {
        let (_, health) = server.get(token, "/health").await;
        if health["connections"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("never reached {expected} connections");
}

#[tokio::test]
async fn dropped_transport_stops_receiving_room_messages() {
    let server = start().await;
    let (u1, u1_token) = server.user("u1").await;
    let (u2, u2_token) = server.user("u2").await;
    let g1 = server.store.create_group_chat("G1", None, &u1.id).await.unwrap();
    server.store.add_member(&g1.id, &u2.id).await.unwrap();

    let (mut s1, _) = server.socket(&u1_token).await;
    let (mut phone, _) = server.socket(&u2_token).await;
    let (mut laptop, _) = server.socket(&u2_token).await;

    for socket in [&mut s1, &mut phone] {
        send(socket, json!({"event": "join-room", "data": {"roomId": g1.id}})).await;
        assert_eq!(next_event(socket).await["event"], "room-joined");
    }

    phone.close(None).await.unwrap();
    wait_for_connections(&server, &u1_token, 2).await;

    send(&mut s1, json!({"event": "send-message", "data": {"groupChatId": g1.id, "message": "still here?"}})).await;
    for socket in [&mut s1, &mut laptop] {
        let received = next_event(socket).await;
        assert_eq!(received["event"], "receive-message");
        assert_eq!(received["data"]["message"], "still here?");
    }

    laptop.close(None).await.unwrap();
    wait_for_connections(&server, &u1_token, 1).await;

    // a fresh device that never joined only hears its own private channel
    let (mut tablet, _) = server.socket(&u2_token).await;
    send(&mut s1, json!({"event": "send-message", "data": {"groupChatId": g1.id, "message": "anyone?"}})).await;
    assert_eq!(next_event(&mut s1).await["data"]["message"], "anyone?");
    send(&mut tablet, json!({"event": "ping"})).await;
    assert_eq!(next_event(&mut tablet).await["event"], "pong");

    let (_, health) = server.get(&u1_token, "/health").await;
    assert_eq!(health["rooms"], 1);
}
