use crate::{
    controller::{CaptureError, CaptureStatus},
    server::SharedState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::instrument;

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match self {
            CaptureError::Camera(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

#[instrument(skip(state))]
pub async fn start_camera(
    State(state): State<SharedState>,
) -> Result<Json<CaptureStatus>, CaptureError> {
    state.controller.start().await?;
    Ok(Json(state.controller.status().await))
}

#[instrument(skip(state))]
pub async fn stop_camera(State(state): State<SharedState>) -> Json<CaptureStatus> {
    state.controller.stop().await;
    Json(state.controller.status().await)
}

pub async fn camera_status(State(state): State<SharedState>) -> Json<CaptureStatus> {
    Json(state.controller.status().await)
}
