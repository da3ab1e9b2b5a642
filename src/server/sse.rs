//! Server-Sent Events endpoint.
//!
//! Subscribers attach to an optimization id and receive every event
//! published after they connect. The stream ends when the broker closes the
//! id's channel (terminal event + grace, or idle expiry).

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::error::AcceptError;

use super::handlers::AppState;

/// `GET /image-optimization-sse/subscribe/{id}`
pub async fn sse_subscribe_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AcceptError> {
    let receiver = state
        .broker
        .subscribe(&id)
        .await
        .map_err(|_| AcceptError::InvalidParameter {
            name: "id",
            message: "subscription id must not be empty".to_string(),
        })?;

    debug!(id = %id, "SSE subscriber attached");

    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => match Event::default().event(event.name()).json_data(&event) {
                Ok(sse_event) => Some(Ok(sse_event)),
                Err(e) => {
                    warn!(error = %e, "failed to serialize SSE event");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "SSE subscriber lagged; events dropped");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
