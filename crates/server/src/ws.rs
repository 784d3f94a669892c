// Live subscriber endpoint
//
// Each websocket gets one Broadcaster subscription. The socket task forwards
// queued messages as JSON text frames and ends with a Close frame when the
// subscription ends (queue overflow or server shutdown).

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use sentiflow_pipeline::broadcast::Broadcaster;

pub fn routes(broadcaster: Arc<Broadcaster>) -> Router {
    Router::new()
        .route("/ws/sentiment", get(upgrade))
        .with_state(broadcaster)
}

/// GET /ws/sentiment - upgrade to a live result stream
async fn upgrade(ws: WebSocketUpgrade, State(broadcaster): State<Arc<Broadcaster>>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, broadcaster))
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

async fn serve_subscriber(mut socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let mut subscription = match broadcaster.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            debug!("Refusing websocket subscriber: {}", e);
            let _ = socket.send(close_frame(close_code::AWAY, "shutting down")).await;
            return;
        }
    };
    let subscriber_id = subscription.id;
    info!(subscriber_id, "Websocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = subscription.recv() => {
                let Some(message) = outbound else {
                    let frame = if broadcaster.is_closed() {
                        close_frame(close_code::AWAY, "shutting down")
                    } else {
                        close_frame(close_code::AGAIN, "subscriber too slow")
                    };
                    let _ = sender.send(frame).await;
                    break;
                };

                let text = match serde_json::to_string(&*message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize {} message: {}", message.kind(), e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!(subscriber_id, "Websocket send failed");
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    // Client frames carry nothing we act on; pings are answered by axum.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber_id, "Websocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    broadcaster.unsubscribe(subscriber_id);
    info!(subscriber_id, "Websocket subscriber disconnected");
}
