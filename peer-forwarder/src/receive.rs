use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::{instrument, warn, Span};

use crate::api::{ForwardRequestError, ForwardResponse, ForwardResponseCode};
use crate::buffer::{Buffer, BufferError, ReceiveBuffer};
use crate::event::Record;
use crate::router;

/// Accepts a batch forwarded by a peer and admits it to the receive buffer of its
/// destination. Responds with an error status if the payload cannot be decoded or the
/// buffer does not admit the records in time, so the sender processes them itself.
#[instrument(
    skip_all,
    fields(pipeline = tracing::field::Empty, plugin = tracing::field::Empty, records = tracing::field::Empty)
)]
pub async fn forward(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<ForwardResponse>, ForwardRequestError> {
    let batch = state.codec.decode(&body).map_err(|error| {
        warn!(%error, bytes = body.len(), "rejected forwarded batch");
        metrics::counter!("peer_forwarder_received_batches_rejected_total").increment(1);
        error
    })?;

    let span = Span::current();
    span.record("pipeline", batch.destination.pipeline_name.as_str());
    span.record("plugin", batch.destination.plugin_id.as_str());
    span.record("records", batch.records.len());

    let buffer = state
        .registry
        .get(&batch.destination)
        .ok_or_else(|| ForwardRequestError::UnknownDestination(batch.destination.clone()))?;

    let count = batch.records.len();
    admit(&buffer, batch.records, state.request_timeout).await?;

    metrics::counter!("peer_forwarder_received_records_total").increment(count as u64);
    Ok(Json(ForwardResponse {
        status: ForwardResponseCode::Ok,
        records: count,
    }))
}

/// Admits every record of the batch or none of them, so a failed request never leaves
/// records behind that the sender will also process itself.
async fn admit(
    buffer: &ReceiveBuffer,
    records: Vec<Record>,
    timeout: std::time::Duration,
) -> Result<(), ForwardRequestError> {
    let count = records.len();
    match buffer.write_all(records, timeout).await {
        Ok(()) => Ok(()),
        Err(BufferError::SizeOverflow { requested, capacity }) => {
            warn!(records = requested, capacity, "forwarded batch exceeds the receive buffer");
            Err(ForwardRequestError::ExceedsBuffer {
                records: requested,
                capacity,
            })
        }
        Err(BufferError::Timeout(timeout)) => {
            warn!(records = count, ?timeout, "receive buffer is full");
            Err(ForwardRequestError::BufferTimeout {
                timeout,
                records: count,
            })
        }
    }
}

pub async fn index() -> &'static str {
    "peer-forwarder"
}

pub async fn liveness() -> &'static str {
    "ok"
}

/// Ready once at least one peer is known.
pub async fn readiness(state: State<router::State>) -> (StatusCode, &'static str) {
    if state.ring.snapshot().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no peers")
    } else {
        (StatusCode::OK, "ok")
    }
}
