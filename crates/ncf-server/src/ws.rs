//! WebSocket progress streaming.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use ncf_core::progress::JobState;
use ncf_core::{ProgressBus, ProgressEvent};
use ncf_db::JobRow;

use crate::state::AppState;

/// `WS /ws/job/{id}`: stream progress events for one job.
///
/// The stream opens with the latest snapshot, then follows publish order
/// until the terminal event, after which it closes. Unknown jobs are
/// rejected before the upgrade.
pub async fn job_progress(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Response {
    match state.repo.get_job(job_id).await {
        Ok(Some(job)) => {
            let bus = state.bus.clone();
            ws.on_upgrade(move |socket| stream_progress(socket, bus, job))
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// The bus entry for a job may already be collected (terminal plus grace
/// window elapsed); the row itself still carries the final tuple.
fn final_event_from_row(job: &JobRow) -> ProgressEvent {
    ProgressEvent {
        job_id: job.id,
        total: job.total,
        completed: job.completed,
        failed: job.failed,
        state: if job.state == "failed" {
            JobState::Failed
        } else {
            JobState::Complete
        },
        last_device: None,
        last_status: None,
    }
}

async fn stream_progress(socket: WebSocket, bus: ProgressBus, job: JobRow) {
    let job_id = job.id;
    let (mut sender, mut receiver) = socket.split();
    let (mut snapshot, mut rx) = bus.subscribe(job_id);
    if snapshot.is_none() && job.state != "running" {
        let event = final_event_from_row(&job);
        // Re-publishing marks the freshly created bus entry terminal so it
        // gets collected again after the grace window.
        bus.publish(event.clone());
        snapshot = Some(event);
    }

    // Drain the client side so close frames and pings are processed.
    let drain = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let mut terminal_sent = false;
    if let Some(event) = snapshot {
        terminal_sent = event.state.is_terminal();
        if send_event(&mut sender, &event).await.is_err() {
            drain.abort();
            return;
        }
    }

    while !terminal_sent {
        match rx.recv().await {
            Ok(event) => {
                terminal_sent = event.state.is_terminal();
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            // Slow consumer: resume with whatever the channel retained.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(job_id, skipped, "progress subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    drain.abort();
    debug!(job_id, "progress stream closed");
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &ProgressEvent,
) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(payload)).await.map_err(|_| ())
}
