//! Downstream session sockets.
//!
//! Each upgraded socket becomes one registered session with two tasks: the
//! handler's own loop reading commands, and a writer task that drains the
//! session mailbox onto the socket. Every outbound frame, replies included,
//! goes through the mailbox.
//!
//! A socket write that does not finish within the configured write timeout
//! closes the session, which in turn releases the command loop.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use super::ControlPlaneState;
use crate::domain::session::{ServerMessage, Session, SessionCommand};

/// `GET /ws` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ControlPlaneState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ControlPlaneState>) {
    let (ws_sender, ws_receiver) = socket.split();
    run_session(&state, ws_sender, ws_receiver).await;
}

/// Serve one session until either side closes it.
async fn run_session<W, R, E>(state: &ControlPlaneState, ws_sender: W, mut ws_receiver: R)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let gateway = &state.gateway;
    let (session, outbox) = gateway.open_session();
    let session_id = session.id();
    let closing = session.closing_token();

    let writer = tokio::spawn(write_loop(
        ws_sender,
        outbox,
        Arc::clone(&session),
        gateway.settings().write_timeout,
    ));

    loop {
        let next = tokio::select! {
            biased;
            () = closing.cancelled() => {
                tracing::info!(session = %session_id, "Session closing");
                break;
            }
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => handle_text(state, &session, text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_text(state, &session, text).await,
                Err(_) => reply(&session, ServerMessage::error("binary frames must be UTF-8 JSON")).await,
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session = %session_id, "Client closed session socket");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session = %session_id, error = %e, "Session socket error");
                break;
            }
        }
    }

    session.begin_close();
    gateway.close_session(session_id);
    writer.abort();
}

/// Drain the mailbox onto the socket. Exits on close, write failure, or a
/// write that exceeds `write_timeout`; any exit closes the session.
async fn write_loop<W>(
    mut ws_sender: W,
    mut outbox: mpsc::Receiver<ServerMessage>,
    session: Arc<Session>,
    write_timeout: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let session_id = session.id();
    let closing = session.closing_token();

    loop {
        let message = tokio::select! {
            () = closing.cancelled() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "Failed to serialize frame");
                continue;
            }
        };

        let sent = tokio::select! {
            () = closing.cancelled() => break,
            sent = tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(text.into()))) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session = %session_id, error = %e, "Session socket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(
                    session = %session_id,
                    timeout_ms = u64::try_from(write_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Session socket write timed out"
                );
                break;
            }
        }
    }

    session.begin_close();
    let _ = tokio::time::timeout(write_timeout, ws_sender.close()).await;
}

async fn handle_text(state: &ControlPlaneState, session: &Session, text: &str) {
    let message = match SessionCommand::parse(text) {
        Ok(command) => state.gateway.handle_command(session, command).await,
        Err(e) => {
            tracing::debug!(session = %session.id(), error = %e, "Invalid session command");
            ServerMessage::error(format!("invalid command: {e}"))
        }
    };
    reply(session, message).await;
}

async fn reply(session: &Session, message: ServerMessage) {
    if let Err(e) = session.reply(message).await {
        tracing::debug!(session = %session.id(), error = %e, "Reply not delivered");
    }
}
