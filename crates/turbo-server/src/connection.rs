//! WebSocket shell around a session: one writer task draining the outbox,
//! one reader task feeding the router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::Instrument;

use crate::hub::{Hub, Teardown};
use crate::router;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Run one connection to completion, then tear its session down.
pub async fn serve(socket: WebSocket, hub: Arc<Hub>, heartbeat: Duration) {
    let (session, mut rx) = hub.connect();
    let span = tracing::info_span!("session", session_id = %session.id());

    async move {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let closed = session.transport_token();

        let writer_closed = closed.clone();
        let mut writer = tokio::spawn(
            async move {
                let mut ping_interval = tokio::time::interval(heartbeat);
                ping_interval.tick().await;

                loop {
                    tokio::select! {
                        msg = rx.recv() => {
                            let Some(text) = msg else { break };
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        _ = ping_interval.tick() => {
                            if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                            tracing::trace!("sent ping");
                        }
                        _ = writer_closed.cancelled() => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let reader_hub = Arc::clone(&hub);
        let reader_session = Arc::clone(&session);
        let mut reader = tokio::spawn(
            async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = closed.cancelled() => break,
                        msg = ws_rx.next() => msg,
                    };
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            router::route(&reader_hub, &reader_session, text.as_str()).await;
                        }
                        Some(Ok(WsMessage::Pong(_))) => reader_session.record_pong(),
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let writer_done = tokio::select! {
            _ = &mut writer => true,
            _ = &mut reader => false,
        };
        hub.disconnect(&session, Teardown::Transport);

        // No more frames are routed for a closed session. The writer gets a
        // short window to send its close frame.
        reader.abort();
        if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    .instrument(span)
    .await
}
