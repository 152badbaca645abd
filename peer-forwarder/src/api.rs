use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{DecodeError, Destination};

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ForwardResponseCode {
    Ok = 1,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardResponse {
    pub status: ForwardResponseCode,
    pub records: usize,
}

#[derive(Error, Debug)]
pub enum ForwardRequestError {
    #[error("failed to decode request: {0}")]
    Decode(#[from] DecodeError),
    #[error("no receive buffer registered for {0}")]
    UnknownDestination(Destination),
    #[error("batch of {records} records exceeds the receive buffer capacity of {capacity}")]
    ExceedsBuffer { records: usize, capacity: usize },
    #[error("buffer timed out after {timeout:?}, none of {records} records were admitted")]
    BufferTimeout { timeout: Duration, records: usize },
}

impl IntoResponse for ForwardRequestError {
    fn into_response(self) -> Response {
        match self {
            ForwardRequestError::Decode(DecodeError::TooManyRecords { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ForwardRequestError::Decode(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ForwardRequestError::ExceedsBuffer { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }

            ForwardRequestError::UnknownDestination(_) => (StatusCode::NOT_FOUND, self.to_string()),

            ForwardRequestError::BufferTimeout { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}
