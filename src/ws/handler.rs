use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{engine::RatingEngine, models::rating::AggregateRecord, state::AppState};

pub async fn aggregate_ws_handler(
    ws: WebSocketUpgrade,
    Path(target_id): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::info!("New aggregate WebSocket for target {}", target_id);

    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| handle_aggregate_socket(socket, target_id, engine))
}

/// A slow client only ever has the newest aggregate waiting for it.
fn latest_aggregate() -> (
    impl Fn(&AggregateRecord) + Send + Sync + 'static,
    watch::Receiver<Option<AggregateRecord>>,
) {
    let (tx, rx) = watch::channel(None);
    let on_change = move |record: &AggregateRecord| {
        tx.send_replace(Some(record.clone()));
    };
    (on_change, rx)
}

async fn handle_aggregate_socket(socket: WebSocket, target_id: Uuid, engine: Arc<RatingEngine>) {
    let (mut sender, mut receiver) = socket.split();
    let (on_change, mut rx) = latest_aggregate();
    let subscription = engine.subscribe(target_id, on_change).await;

    let handle = match subscription {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("Failed to subscribe to {}: {}", target_id, e);
            let close_frame = CloseFrame {
                code: close_code::ERROR,
                reason: "Ratings unavailable".into(),
            };
            let _ = sender.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(record) = rx.borrow_and_update().clone() else {
                    continue;
                };
                let text = match serde_json::to_string(&record) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize aggregate: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    engine.unsubscribe(&handle);
    tracing::info!("Aggregate WebSocket for target {} closed", target_id);
}
