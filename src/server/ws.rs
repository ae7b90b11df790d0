use std::{fmt, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    auth::AuthUser,
    config::Config,
    connection::LiveConnection,
    entity::UserInfo,
    error::ChatError,
    pipeline::Pipeline,
    registry::{ConnectionHandle, Frame},
};

use super::AppState;

/// Room for the JSON envelope around the message content.
const FRAME_OVERHEAD: usize = 1024;

/// Largest inbound frame accepted for `max_message_len` characters of content.
/// Every character may be escaped as `\uXXXX` on the wire.
fn frame_limit(max_message_len: usize) -> usize {
    max_message_len.saturating_mul(6).saturating_add(FRAME_OVERHEAD)
}

/// Per-socket timings, taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub outbound_queue: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
}

impl From<&Config> for SocketSettings {
    fn from(config: &Config) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
            send_timeout: config.send_timeout,
        }
    }
}

/// GET /ws
///
/// Only reachable through `require_auth`, so the identity is already verified
/// when the upgrade is accepted.
pub async fn ws_handler(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(user = %user, "websocket upgrade requested");
    let limit = frame_limit(state.config.max_message_len);
    let settings = SocketSettings::from(state.config.as_ref());
    let pipeline = state.pipeline.clone();

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket: WebSocket| {
            let (sink, incoming) = socket.split();
            serve_socket(sink, incoming, pipeline, user, settings)
        })
}

/// Runs one live connection until the peer leaves, goes idle, or the
/// connection is closed from elsewhere (fan-out failure, shutdown).
async fn serve_socket<Tx, Rx, E>(
    sink: Tx,
    mut incoming: Rx,
    pipeline: Arc<Pipeline>,
    user: UserInfo,
    settings: SocketSettings,
) where
    Tx: Sink<Message> + Send + Unpin + 'static,
    Tx::Error: fmt::Display + Send,
    Rx: Stream<Item = Result<Message, E>> + Send + Unpin,
    E: fmt::Display + Send,
{
    let (mut conn, outbound) = LiveConnection::open(
        pipeline.registry().clone(),
        user.clone(),
        settings.outbound_queue,
    );
    let handle = conn.handle().clone();

    let writer = tokio::spawn(write_loop(sink, outbound, handle.clone(), settings));

    loop {
        tokio::select! {
            _ = handle.closed() => {
                debug!(conn = %handle.id(), "connection asked to close");
                break;
            }
            next = tokio::time::timeout(settings.idle_timeout, incoming.next()) => {
                match next {
                    Err(_) => {
                        info!(user = %user, conn = %handle.id(), "idle timeout");
                        break;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Err(e))) => {
                        debug!(conn = %handle.id(), error = %e, "websocket read failed");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        // Errors were already reported on this connection.
                        let _ = pipeline.handle_frame(&user, &handle, &text).await;
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        let err = ChatError::validation("binary frames are not supported");
                        pipeline.report_error(&handle, &err).await;
                    }
                    // Pings are answered by axum, pongs only keep the idle timer alive.
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    conn.close();
    debug!(conn = %handle.id(), state = ?conn.state(), "reader finished");
    if let Err(e) = writer.await {
        warn!(conn = %handle.id(), error = %e, "writer task failed");
    }
}

/// Drains the outbound queue onto the socket and keeps it alive with pings.
/// Every write is bounded by `send_timeout`; a peer that stops reading ends
/// the writer and with it the connection.
async fn write_loop<Tx>(
    mut sink: Tx,
    mut outbound: mpsc::Receiver<Frame>,
    handle: ConnectionHandle,
    settings: SocketSettings,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    let limit = settings.send_timeout;
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if !send(&mut sink, Message::Text(frame.to_string()), &handle, limit).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !send(&mut sink, Message::Ping(Vec::new()), &handle, limit).await {
                    break;
                }
            }
            _ = handle.closed() => {
                // Flush what was queued before the close, then say goodbye.
                let mut flushed = true;
                while let Ok(frame) = outbound.try_recv() {
                    if !send(&mut sink, Message::Text(frame.to_string()), &handle, limit).await {
                        flushed = false;
                        break;
                    }
                }
                if flushed {
                    send(&mut sink, Message::Close(None), &handle, limit).await;
                }
                break;
            }
        }
    }

    handle.close();
}

async fn send<Tx>(sink: &mut Tx, msg: Message, handle: &ConnectionHandle, limit: Duration) -> bool
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(conn = %handle.id(), error = %e, "websocket write failed");
            false
        }
        Err(_) => {
            warn!(conn = %handle.id(), "websocket write timed out after {:?}", limit);
            false
        }
    }
}
