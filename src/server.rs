use crate::{
    config::{CameraConfig, Config},
    controller::CaptureController,
    overlay::Canvas,
    prompts::PromptSet,
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub controller: Arc<CaptureController>,
    pub prompts: Arc<PromptSet>,
    pub canvas: Arc<Canvas>,
    pub camera_config: CameraConfig,
    pub metrics: Arc<Metrics>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

async fn count_requests(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    state.metrics.record_request(&route);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FrameSize, MediaDevice, TestPatternDevice};
    use crate::protocol::OutboundFrameMessage;
    use crate::transport::FrameSink;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    struct NullSink;

    impl FrameSink for NullSink {
        fn send(&self, _message: OutboundFrameMessage) {}
    }

    async fn spawn_app(size: FrameSize) -> (String, SharedState) {
        let device: Arc<dyn MediaDevice> = Arc::new(TestPatternDevice::new(size));
        let metrics = Arc::new(Metrics::new().unwrap());
        let prompts = Arc::new(PromptSet::default());
        let canvas = Arc::new(Canvas::new());
        let camera_config = CameraConfig {
            capture_interval_ms: 50,
            ..CameraConfig::default()
        };
        let controller = Arc::new(CaptureController::new(
            device,
            prompts.clone(),
            Arc::new(NullSink),
            canvas.clone(),
            metrics.clone(),
            &camera_config,
        ));
        let state = SharedState {
            controller,
            prompts,
            canvas,
            camera_config,
            metrics,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("127.0.0.1:{}", addr.port()), state)
    }

    #[tokio::test]
    async fn test_health_and_request_metrics() {
        let (addr, _) = spawn_app(FrameSize::new(8, 8)).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"status": "Available"}));

        let metrics = client
            .get(format!("http://{}/metrics", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("live_annotate_requests_total{route=\"/health\"} 1"));
    }

    #[tokio::test]
    async fn test_camera_start_status_stop() {
        let (addr, state) = spawn_app(FrameSize::new(8, 6)).await;
        let client = reqwest::Client::new();

        let started = client
            .post(format!("http://{}/camera/start", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), reqwest::StatusCode::OK);
        let body: Value = started.json().await.unwrap();
        assert_eq!(body["state"], "streaming");
        assert_eq!(body["size"], json!({"width": 8, "height": 6}));
        assert_eq!(state.canvas.size(), Some(FrameSize::new(8, 6)));

        let stopped: Value = client
            .post(format!("http://{}/camera/stop", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["state"], "idle");
        assert_eq!(stopped["size"], Value::Null);

        let status: Value = client
            .get(format!("http://{}/camera/status", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["state"], "idle");
    }

    #[tokio::test]
    async fn test_unavailable_camera_is_503() {
        let (addr, state) = spawn_app(FrameSize::new(0, 0)).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/camera/start", addr))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.controller.state(), crate::controller::CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_prompts_replace_and_submit() {
        let (addr, _) = spawn_app(FrameSize::new(8, 8)).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/prompts", addr);

        let replaced: Value = client
            .put(&url)
            .json(&json!({"fields": ["  a cat ", "", "a dog"]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(replaced["fields"], json!(["  a cat ", "", "a dog"]));
        assert_eq!(replaced["sent"], json!([]));
        assert_eq!(replaced["policy"], "on_submit");

        let submitted: Value = client
            .post(format!("{}/submit", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(submitted["sent"], json!(["a cat", "a dog"]));

        let current: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(current, submitted);
    }

    #[tokio::test]
    async fn test_overlay_snapshot_and_viewer_socket() {
        let (addr, state) = spawn_app(FrameSize::new(8, 8)).await;

        let snapshot: Value = reqwest::get(format!("http://{}/overlay", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snapshot["size"], Value::Null);

        let (mut viewer, _) = connect_async(format!("ws://{}/overlay/ws", addr))
            .await
            .unwrap();
        let Some(Ok(Message::Text(first))) = viewer.next().await else {
            panic!("expected an overlay frame");
        };
        let first: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first["event"], "overlay");

        state.controller.start().await.unwrap();

        let mut saw_started = false;
        while !saw_started {
            let Some(Ok(Message::Text(text))) = viewer.next().await else {
                panic!("viewer socket closed");
            };
            let value: Value = serde_json::from_str(&text).unwrap();
            saw_started = value["event"] == "session"
                && value["data"] == json!({"event": "started", "width": 8, "height": 8});
        }

        state.controller.stop().await;
    }
}
