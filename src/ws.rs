use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    connections::{CloseReason, Outbox, Registration},
    hub::ChatHub,
    protocol::{ClientEvent, ServerEvent},
    session::{Flow, Session},
    ChatError, ChatResult,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    State(hub): State<Arc<ChatHub>>,
    State(config): State<Arc<Config>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_timeout = config.auth_timeout;
    ws.on_upgrade(move |stream| run(stream, hub, auth_timeout))
}

async fn run(stream: WebSocket, hub: Arc<ChatHub>, auth_timeout: Duration) {
    let (mut sender, mut receiver) = stream.split();
    let (outbox, mut rx) = mpsc::unbounded_channel();

    let registration = match timeout(auth_timeout, authenticate(&hub, &mut receiver, outbox.clone())).await {
        Ok(Ok(registration)) => registration,
        Ok(Err(err)) => return refuse(&mut sender, &err).await,
        Err(_) => {
            let err = ChatError::Unauthenticated;
            debug!(?auth_timeout, "socket did not authenticate in time");
            return refuse(&mut sender, &err).await;
        }
    };

    let Registration {
        connection_id,
        principal,
        closer,
    } = registration;
    let _ = outbox.send(ServerEvent::Authenticated {
        connection_id,
        user: principal.clone(),
    });

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    error!(%connection_id, error = %err, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut session = Session::new(Arc::clone(&hub), connection_id, principal, outbox);
    let reason = loop {
        let frame = tokio::select! {
            _ = closer.notified() => break CloseReason::Idle,
            frame = receiver.next() => frame,
        };

        let Some(Ok(frame)) = frame else {
            break CloseReason::Disconnected;
        };
        hub.registry.touch(connection_id).await;

        let flow = match frame {
            Message::Text(text) => session.handle_frame(text.as_str()).await,
            Message::Binary(bytes) => session.handle_frame(&String::from_utf8_lossy(&bytes)).await,
            Message::Close(_) => break CloseReason::Disconnected,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if let Flow::Close(reason) = flow {
            break reason;
        }
    };

    hub.disconnect(connection_id, reason).await;
    info!(%connection_id, ?reason, "socket closed");

    // The writer ends once every outbox clone is gone, after flushing what
    // was already queued.
    drop(session);
    if timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Waits for the `authenticate` frame and registers the connection.
async fn authenticate(
    hub: &ChatHub,
    receiver: &mut SplitStream<WebSocket>,
    outbox: Outbox,
) -> ChatResult<Registration> {
    while let Some(Ok(frame)) = receiver.next().await {
        let text = match &frame {
            Message::Text(text) => text.as_str(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => break,
        };
        return match ClientEvent::parse(text)? {
            ClientEvent::Authenticate { token } => hub.connect(&token, outbox).await,
            other => {
                debug!(event = other.name(), "event before authenticate");
                Err(ChatError::Unauthenticated)
            }
        };
    }
    Err(ChatError::Unauthenticated)
}

async fn refuse(sender: &mut SplitSink<WebSocket, Message>, err: &ChatError) {
    debug!(error = %err, "refusing socket");
    if let Ok(frame) = serde_json::to_string(&ServerEvent::error("authenticate", err)) {
        let _ = sender.send(Message::Text(frame.into())).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}
