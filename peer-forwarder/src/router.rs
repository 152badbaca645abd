use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::BuildError;
use tower_http::trace::TraceLayer;

use crate::buffer::ReceiveBufferRegistry;
use crate::codec::ForwardingCodec;
use crate::metrics::{setup_metrics_routes, track_metrics};
use crate::receive;
use crate::ring::SharedHashRing;

/// Path of the endpoint peers post forwarded batches to.
pub const FORWARD_PATH: &str = "/event/forward";

#[derive(Clone)]
pub struct State {
    pub registry: Arc<ReceiveBufferRegistry>,
    pub codec: Arc<dyn ForwardingCodec>,
    pub ring: Arc<SharedHashRing>,
    /// Budget for admitting one request's records to the buffer.
    pub request_timeout: Duration,
}

pub fn router(state: State, max_request_bytes: usize, metrics: bool) -> Result<Router, BuildError> {
    let router = Router::new()
        .route("/", get(receive::index))
        .route("/_liveness", get(receive::liveness))
        .route("/_readiness", get(receive::readiness))
        .route(FORWARD_PATH, post(receive::forward))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if metrics {
        setup_metrics_routes(router)
    } else {
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::api::ForwardResponse;
    use crate::buffer::Buffer;
    use crate::codec::{BinaryCodec, Destination, ForwardingBatch, JsonCodec};
    use crate::event::{Event, EventType, Record};

    fn state(codec: Arc<dyn ForwardingCodec>, capacity: usize, peers: Vec<String>) -> State {
        State {
            registry: Arc::new(ReceiveBufferRegistry::new(capacity)),
            codec,
            ring: Arc::new(SharedHashRing::new(peers, 16)),
            request_timeout: Duration::from_millis(50),
        }
    }

    fn batch(destination: &Destination, count: usize) -> ForwardingBatch {
        ForwardingBatch::new(
            destination.clone(),
            (0..count)
                .map(|n| Record::new(Event::new(EventType::Span, json!({ "trace_id": n }))))
                .collect(),
        )
    }

    fn post_body(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(FORWARD_PATH)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn admits_forwarded_batch_to_its_buffer() {
        let codec = Arc::new(BinaryCodec::default());
        let state = state(codec.clone(), 16, vec!["a:1".into()]);
        let destination = Destination::new("traces", "service-map");
        let buffer = state.registry.get_or_create(&destination);
        let sent = batch(&destination, 5);
        let app = router(state, 1024 * 1024, false).unwrap();

        let response = app
            .oneshot(post_body(codec.encode(&sent).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ForwardResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.records, 5);
        let read = buffer.read(10, Duration::from_millis(5)).await;
        assert_eq!(read.records, sent.records);
        buffer.checkpoint(read.checkpoint);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_bad_request() {
        let state = state(Arc::new(JsonCodec), 16, vec![]);
        let app = router(state, 1024, false).unwrap();

        let response = app.oneshot(post_body(b"not a batch".to_vec())).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("failed to decode request"));
    }

    #[tokio::test]
    async fn unknown_destination_is_not_found() {
        let state = state(Arc::new(JsonCodec), 16, vec![]);
        let app = router(state, 1024 * 1024, false).unwrap();
        let payload = JsonCodec
            .encode(&batch(&Destination::new("nope", "missing"), 1))
            .unwrap();

        let response = app.oneshot(post_body(payload)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn full_buffer_is_unavailable() {
        let state = state(Arc::new(JsonCodec), 2, vec![]);
        let destination = Destination::new("traces", "service-map");
        let buffer = state.registry.get_or_create(&destination);
        buffer
            .write_all(batch(&destination, 2).records, Duration::from_millis(5))
            .await
            .unwrap();
        let app = router(state, 1024 * 1024, false).unwrap();

        let response = app
            .oneshot(post_body(JsonCodec.encode(&batch(&destination, 1)).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("buffer timed out"));
    }

    #[tokio::test]
    async fn batches_larger_than_the_buffer_are_rejected_whole() {
        let state = state(Arc::new(JsonCodec), 2, vec![]);
        let destination = Destination::new("traces", "service-map");
        let buffer = state.registry.get_or_create(&destination);
        let app = router(state, 1024 * 1024, false).unwrap();

        let response = app
            .oneshot(post_body(JsonCodec.encode(&batch(&destination, 4)).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body_string(response).await.contains("exceeds the receive buffer"));
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn timed_out_requests_admit_nothing() {
        let state = state(Arc::new(JsonCodec), 3, vec![]);
        let destination = Destination::new("traces", "service-map");
        let buffer = state.registry.get_or_create(&destination);
        buffer
            .write(batch(&destination, 1).records.remove(0), Duration::from_millis(5))
            .await
            .unwrap();
        let app = router(state, 1024 * 1024, false).unwrap();

        let response = app
            .oneshot(post_body(JsonCodec.encode(&batch(&destination, 3)).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn body_limit_is_enforced() {
        let state = state(Arc::new(JsonCodec), 16, vec![]);
        let destination = Destination::new("traces", "service-map");
        state.registry.get_or_create(&destination);
        let app = router(state, 64, false).unwrap();

        let response = app
            .oneshot(post_body(JsonCodec.encode(&batch(&destination, 10)).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn readiness_follows_the_ring() {
        let empty = router(state(Arc::new(JsonCodec), 1, vec![]), 1024, false).unwrap();
        let ready = router(state(Arc::new(JsonCodec), 1, vec!["a:1".into()]), 1024, false).unwrap();
        let request = || Request::get("/_readiness").body(Body::empty()).unwrap();

        assert_eq!(
            empty.oneshot(request()).await.unwrap().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ready.oneshot(request()).await.unwrap().status(), StatusCode::OK);
    }
}
