use crate::{server::SharedState, stream::VideoStream};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Response {
    let stream = VideoStream::new(
        state.controller.latest_frame(),
        state.camera_config.get_stream_delay_ms(),
    )
    .generate_stream();

    match Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
