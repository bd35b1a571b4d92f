use crate::camera::{FrameSize, MediaDevice, TestPatternDevice};
use crate::config::{CameraConfig, Config, DeviceSelector};
use crate::controller::CaptureController;
use crate::overlay::{Canvas, OverlayRenderer};
use crate::prompts::PromptSet;
use crate::server::{HttpServer, SharedState};
use crate::telemetry::Metrics;
use crate::transport::TransportChannel;

use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);

    let transport = match TransportChannel::open(&config.prediction_service, metrics.clone()).await
    {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::error!("Failed to connect to prediction service: {:?}", e);
            return Err(e.into());
        }
    };

    let device = build_device(&config.camera)?;
    tracing::info!("Using camera device {}", device.name());

    let prompts = Arc::new(PromptSet::new(config.prompts.snapshot_policy));
    let canvas = Arc::new(Canvas::new());

    let renderer = OverlayRenderer::new(canvas.clone(), metrics.clone());
    let subscription = transport.on_prediction(move |message| renderer.on_prediction(&message));

    let controller = Arc::new(CaptureController::new(
        device,
        prompts.clone(),
        transport.clone(),
        canvas.clone(),
        metrics.clone(),
        &config.camera,
    ));

    let state = SharedState {
        controller: controller.clone(),
        prompts,
        canvas,
        camera_config: config.camera.clone(),
        metrics,
    };
    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    controller.stop().await;
    subscription.revoke();
    transport.close().await;

    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = server_handle.await {
        tracing::error!("Server exited with error: {:?}", e);
    }

    Ok(())
}

fn build_device(camera: &CameraConfig) -> anyhow::Result<Arc<dyn MediaDevice>> {
    match camera.device {
        DeviceSelector::TestPattern => Ok(Arc::new(TestPatternDevice::new(FrameSize::new(
            camera.width,
            camera.height,
        )))),
        #[cfg(feature = "opencv")]
        DeviceSelector::Webcam(index) => Ok(Arc::new(crate::webcam::OpenCvDevice::new(index))),
        #[cfg(not(feature = "opencv"))]
        DeviceSelector::Webcam(index) => Err(anyhow::anyhow!(
            "camera device {} requested but this build has no webcam support; rebuild with --features opencv",
            index
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
