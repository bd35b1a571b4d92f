use crate::camera::{CameraError, FrameSize, MediaDevice, MediaStream};
use crate::codec::{EncodedFrame, FrameCodec};
use crate::config::CameraConfig;
use crate::overlay::Canvas;
use crate::prompts::PromptSet;
use crate::protocol::OutboundFrameMessage;
use crate::telemetry::Metrics;
use crate::transport::FrameSink;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, timeout, MissedTickBehavior},
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to start camera: {0}")]
    Camera(#[from] CameraError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Emitted once per session; viewers bring the feed into view on it.
    Started { width: u32, height: u32 },
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub size: Option<FrameSize>,
    pub interval_ms: u64,
    pub device: String,
}

struct CameraSession {
    stream: Arc<dyn MediaStream>,
    ticker: JoinHandle<()>,
    live: Arc<AtomicBool>,
    size: FrameSize,
}

/// Everything one capture tick needs, shared by all ticks of a session.
struct TickContext {
    stream: Arc<dyn MediaStream>,
    live: Arc<AtomicBool>,
    deadline: Duration,
    prompts: Arc<PromptSet>,
    codec: FrameCodec,
    sink: Arc<dyn FrameSink>,
    latest_frame: Arc<watch::Sender<Option<EncodedFrame>>>,
    metrics: Arc<Metrics>,
}

/// Owns the camera lifecycle and the periodic capture, encode, send loop.
pub struct CaptureController {
    device: Arc<dyn MediaDevice>,
    prompts: Arc<PromptSet>,
    sink: Arc<dyn FrameSink>,
    canvas: Arc<Canvas>,
    metrics: Arc<Metrics>,
    codec: FrameCodec,
    interval: Duration,
    tick_timeout: Duration,
    state: watch::Sender<CaptureState>,
    session: Mutex<Option<CameraSession>>,
    events: broadcast::Sender<SessionEvent>,
    latest_frame: Arc<watch::Sender<Option<EncodedFrame>>>,
}

impl CaptureController {
    pub fn new(
        device: Arc<dyn MediaDevice>,
        prompts: Arc<PromptSet>,
        sink: Arc<dyn FrameSink>,
        canvas: Arc<Canvas>,
        metrics: Arc<Metrics>,
        camera_config: &CameraConfig,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        let (events, _) = broadcast::channel(16);
        let (latest_frame, _) = watch::channel(None);
        Self {
            device,
            prompts,
            sink,
            canvas,
            metrics,
            codec: FrameCodec::new(camera_config.jpeg_quality),
            interval: camera_config.get_capture_interval(),
            tick_timeout: camera_config.get_tick_timeout(),
            state,
            session: Mutex::new(None),
            events,
            latest_frame: Arc::new(latest_frame),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Most recent frame that was encoded for sending.
    pub fn latest_frame(&self) -> watch::Receiver<Option<EncodedFrame>> {
        self.latest_frame.subscribe()
    }

    pub async fn status(&self) -> CaptureStatus {
        let session = self.session.lock().await;
        CaptureStatus {
            state: self.state(),
            size: session.as_ref().map(|s| s.size),
            interval_ms: self.interval.as_millis() as u64,
            device: self.device.name(),
        }
    }

    /// Capture timers currently armed: 1 while streaming, otherwise 0.
    pub async fn active_timers(&self) -> usize {
        let session = self.session.lock().await;
        session
            .as_ref()
            .map_or(0, |s| usize::from(!s.ticker.is_finished()))
    }

    /// Opens the camera and starts ticking. Starting an already streaming
    /// controller returns the current frame size.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<FrameSize, CaptureError> {
        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            tracing::debug!("Camera already streaming");
            return Ok(active.size);
        }

        self.state.send_replace(CaptureState::Starting);
        let stream = match self.device.open().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to open {}: {}", self.device.name(), e);
                self.state.send_replace(CaptureState::Idle);
                return Err(e.into());
            }
        };

        let size = stream.size();
        self.canvas.bind(size);

        let live = Arc::new(AtomicBool::new(true));
        let ctx = Arc::new(TickContext {
            stream: stream.clone(),
            live: live.clone(),
            deadline: self.tick_timeout,
            prompts: self.prompts.clone(),
            codec: self.codec,
            sink: self.sink.clone(),
            latest_frame: self.latest_frame.clone(),
            metrics: self.metrics.clone(),
        });
        let ticker = tokio::spawn(run_ticker(ctx, self.interval));

        *session = Some(CameraSession {
            stream,
            ticker,
            live,
            size,
        });
        self.state.send_replace(CaptureState::Streaming);
        let _ = self.events.send(SessionEvent::Started {
            width: size.width,
            height: size.height,
        });
        tracing::info!(
            "Camera streaming at {}x{} every {:?}",
            size.width,
            size.height,
            self.interval
        );

        Ok(size)
    }

    /// Cancels the timer and releases the camera. Does nothing when idle.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            tracing::debug!("Camera already stopped");
            return;
        };

        self.state.send_replace(CaptureState::Stopping);
        active.live.store(false, Ordering::SeqCst);
        active.ticker.abort();
        active.stream.stop();
        self.canvas.release();
        self.latest_frame.send_replace(None);

        self.state.send_replace(CaptureState::Idle);
        let _ = self.events.send(SessionEvent::Stopped);
        tracing::info!("Camera stopped");
    }
}

async fn run_ticker(ctx: Arc<TickContext>, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick: Option<Instant> = None;

    loop {
        ticker.tick().await;
        if !ctx.live.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        if let Some(previous) = last_tick.replace(now) {
            let elapsed = now.duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                ctx.metrics.record_capture_fps(1.0 / elapsed);
            }
        }

        // Each tick runs on its own so a slow capture never delays the next.
        // A tick that outlives its deadline is dropped, hung read included.
        let tick_ctx = ctx.clone();
        tokio::spawn(async move {
            if timeout(tick_ctx.deadline, capture_tick(&tick_ctx)).await.is_err() {
                tick_ctx.metrics.record_frame_dropped();
                tracing::warn!("Capture tick exceeded {:?}, abandoned", tick_ctx.deadline);
            }
        });
    }
}

async fn capture_tick(ctx: &TickContext) {
    let frame = match ctx.stream.read_frame().await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("Skipping tick, no frame: {}", e);
            return;
        }
    };

    let started = Instant::now();
    let encoded = match ctx.codec.encode(frame).await {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::debug!("Skipping tick, encode failed: {}", e);
            return;
        }
    };
    ctx.metrics.record_encode_duration(started.elapsed());

    let image = encoded.to_data_uri();
    // `stop` clears the latest frame through the same channel lock, so a
    // frame is published only while the session is still live.
    let published = ctx.latest_frame.send_if_modified(|latest| {
        if !ctx.live.load(Ordering::SeqCst) {
            return false;
        }
        *latest = Some(encoded);
        true
    });
    if !published {
        tracing::debug!("Session ended during capture, dropping frame");
        return;
    }

    ctx.sink.send(OutboundFrameMessage {
        image,
        prompts: ctx.prompts.snapshot(),
    });
}
