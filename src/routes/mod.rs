mod camera;
mod health;
mod metrics;
mod overlay;
mod prompts;
mod video_feed;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/camera/start", post(camera::start_camera))
        .route("/camera/stop", post(camera::stop_camera))
        .route("/camera/status", get(camera::camera_status))
        .route(
            "/prompts",
            get(prompts::get_prompts).put(prompts::replace_prompts),
        )
        .route("/prompts/submit", post(prompts::submit_prompts))
        .route("/overlay", get(overlay::overlay_snapshot))
        .route("/overlay/ws", get(overlay::overlay_ws))
        .route("/video_feed", get(video_feed::video_feed))
}
