use crate::config::PredictionServiceConfig;
use crate::protocol::{self, InboundEvent, OutboundFrameMessage, PredictionMessage};
use crate::telemetry::Metrics;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::instrument;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to prediction service: {0}")]
    ConnectionFailed(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("Maximum connection retries exceeded ({0})")]
    MaxRetriesExceeded(u32),
}

/// Where captured frames go.
pub trait FrameSink: Send + Sync + 'static {
    /// Fire-and-forget: never waits for the peer and never reports failure.
    fn send(&self, message: OutboundFrameMessage);
}

pub type PredictionHandler = Arc<dyn Fn(PredictionMessage) + Send + Sync>;

/// Holds at most one prediction handler.
#[derive(Default)]
struct HandlerSlot {
    next_id: AtomicU64,
    current: Mutex<Option<(u64, PredictionHandler)>>,
}

impl HandlerSlot {
    fn register(&self, handler: PredictionHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.current.lock().replace((id, handler)).is_some() {
            tracing::debug!("Replaced previous prediction handler");
        }
        id
    }

    fn revoke(&self, id: u64) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some((active, _)) if *active == id => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    fn dispatch(&self, message: PredictionMessage) -> bool {
        // Call outside the lock so a handler may re-register.
        let handler = self.current.lock().as_ref().map(|(_, h)| h.clone());
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }
}

/// Registration returned by [`TransportChannel::on_prediction`]. Dropping it
/// revokes the handler unless a newer one has replaced it.
pub struct PredictionSubscription {
    id: u64,
    slot: Weak<HandlerSlot>,
}

impl PredictionSubscription {
    pub fn revoke(self) {
        drop(self);
    }
}

impl Drop for PredictionSubscription {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.revoke(self.id);
        }
    }
}

/// The long-lived connection to the prediction service.
pub struct TransportChannel {
    outbound_tx: mpsc::Sender<String>,
    handlers: Arc<HandlerSlot>,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl TransportChannel {
    /// Connects (retrying with backoff) and starts the connection task.
    #[instrument(skip(config, metrics), fields(url = %config.url))]
    pub async fn open(
        config: &PredictionServiceConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, TransportError> {
        let socket = connect_with_retry(config).await?;
        tracing::info!("Connected to prediction service");

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(HandlerSlot::default());
        let connected = Arc::new(AtomicBool::new(true));

        let connection = Connection {
            config: config.clone(),
            outbound_rx,
            handlers: handlers.clone(),
            connected: connected.clone(),
            shutdown_rx,
        };
        let task = tokio::spawn(connection.run(socket));

        Ok(Self {
            outbound_tx,
            handlers,
            connected,
            shutdown_tx,
            task: Mutex::new(Some(task)),
            metrics,
        })
    }

    /// Installs the prediction handler, replacing any previous one.
    pub fn on_prediction<F>(&self, handler: F) -> PredictionSubscription
    where
        F: Fn(PredictionMessage) + Send + Sync + 'static,
    {
        let id = self.handlers.register(Arc::new(handler));
        PredictionSubscription {
            id,
            slot: Arc::downgrade(&self.handlers),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the socket and waits for the connection task to finish.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Transport task ended abnormally: {:?}", e);
            }
        }
        tracing::info!("Transport channel closed");
    }
}

impl FrameSink for TransportChannel {
    fn send(&self, message: OutboundFrameMessage) {
        let text = match protocol::encode_frame(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode frame message: {}", e);
                return;
            }
        };
        match self.outbound_tx.try_send(text) {
            Ok(()) => self.metrics.record_frame_sent(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_frame_dropped();
                tracing::warn!("Outbound queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_frame_dropped();
                tracing::debug!("Transport closed, dropping frame");
            }
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);
/// While reconnecting, failures are summarized once per this many attempts.
const RECONNECT_LOG_EVERY: u32 = 10;

/// Exponential backoff with jitter, capped at [`MAX_RETRY_DELAY`].
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_RETRY_DELAY,
        }
    }

    async fn wait(&mut self) {
        let jitter = rand::random::<f32>() * 0.2 + 0.9;
        sleep(self.delay.mul_f32(jitter)).await;
        self.delay = (self.delay * 2).min(MAX_RETRY_DELAY);
    }
}

async fn try_connect(config: &PredictionServiceConfig) -> Result<Socket, TransportError> {
    let connect_timeout = config.get_connect_timeout();
    match timeout(connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(connect_timeout)),
    }
}

/// Initial connection: gives up after `max_retries` attempts.
async fn connect_with_retry(config: &PredictionServiceConfig) -> Result<Socket, TransportError> {
    let max_retries = config.max_retries.max(1);
    let mut backoff = Backoff::new();

    for _ in 0..max_retries {
        match try_connect(config).await {
            Ok(socket) => return Ok(socket),
            Err(e) => tracing::error!("Failed to connect to prediction service: {}", e),
        }
        backoff.wait().await;
    }

    Err(TransportError::MaxRetriesExceeded(max_retries))
}

/// Re-establishes a lost connection. Keeps trying at the capped delay until
/// it succeeds; the caller cancels it on shutdown.
async fn reconnect(config: &PredictionServiceConfig) -> Socket {
    let mut backoff = Backoff::new();
    let mut attempts: u32 = 0;

    loop {
        match try_connect(config).await {
            Ok(socket) => return socket,
            Err(e) => {
                attempts += 1;
                if attempts % RECONNECT_LOG_EVERY == 1 {
                    tracing::warn!(
                        "Prediction service still unreachable after {} attempts: {}",
                        attempts,
                        e
                    );
                } else {
                    tracing::debug!("Reconnect attempt {} failed: {}", attempts, e);
                }
            }
        }
        backoff.wait().await;
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

struct Connection {
    config: PredictionServiceConfig,
    outbound_rx: mpsc::Receiver<String>,
    handlers: Arc<HandlerSlot>,
    connected: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, mut socket: Socket) {
        loop {
            self.connected.store(true, Ordering::SeqCst);
            let end = self.pump(socket).await;
            self.connected.store(false, Ordering::SeqCst);

            if let SessionEnd::Shutdown = end {
                break;
            }

            tracing::warn!("Prediction service connection lost, reconnecting");
            socket = tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                socket = reconnect(&self.config) => socket,
            };
            // Frames queued for the lost socket are stale by now.
            while self.outbound_rx.try_recv().is_ok() {}
            tracing::info!("Reconnected to prediction service");
        }
        tracing::info!("Transport connection task stopped");
    }

    async fn pump(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!("Failed to send close frame: {}", e);
                    }
                    return SessionEnd::Shutdown;
                }
                outbound = self.outbound_rx.recv() => {
                    let Some(text) = outbound else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::error!("Failed to send frame: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Prediction service closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("Prediction service receive error: {}", e);
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }

    fn handle_inbound(&self, text: &str) {
        match protocol::decode_inbound(text) {
            Ok(InboundEvent::Prediction(message)) => {
                if !self.handlers.dispatch(message) {
                    tracing::debug!("No prediction handler registered, dropping prediction");
                }
            }
            Ok(InboundEvent::Other(event)) => {
                tracing::debug!("Ignoring `{}` event", event);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed inbound message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FrameSize;
    use crate::overlay::{Canvas, DrawCommand, OverlayRenderer};
    use axum::{
        extract::{
            ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
            State,
        },
        response::IntoResponse,
        routing::get,
        Router,
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone)]
    struct FakeService {
        received_tx: mpsc::UnboundedSender<String>,
        push_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    }

    async fn ws_handler(
        ws: WebSocketUpgrade,
        State(service): State<FakeService>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_socket(socket, service))
    }

    async fn serve_socket(socket: WebSocket, service: FakeService) {
        let (mut sink, mut stream) = socket.split();
        let mut push_rx = service.push_rx.lock().await;
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = service.received_tx.send(text.as_str().to_owned());
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                push = push_rx.recv() => match push {
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    struct FakeHandle {
        server: tokio::task::JoinHandle<()>,
        received: mpsc::UnboundedReceiver<String>,
        push: mpsc::UnboundedSender<String>,
    }

    /// Serves a prediction service on `listener` that records what it
    /// receives and sends whatever the test pushes.
    fn serve_fake(listener: tokio::net::TcpListener) -> FakeHandle {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, push_rx) = mpsc::unbounded_channel();
        let service = FakeService {
            received_tx,
            push_rx: Arc::new(AsyncMutex::new(push_rx)),
        };
        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(service);
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        FakeHandle {
            server,
            received,
            push,
        }
    }

    fn service_config(addr: std::net::SocketAddr) -> PredictionServiceConfig {
        PredictionServiceConfig {
            url: format!("ws://{}/ws", addr),
            connect_timeout_ms: 1000,
            max_retries: 3,
            outbound_capacity: 4,
        }
    }

    async fn fake_service() -> (
        PredictionServiceConfig,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = service_config(listener.local_addr().unwrap());
        let fake = serve_fake(listener);
        (config, fake.received, fake.push)
    }

    fn frame(prompt: &str) -> OutboundFrameMessage {
        OutboundFrameMessage {
            image: "data:image/jpeg;base64,AAAA".into(),
            prompts: vec![prompt.into()],
        }
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    const CAT_PREDICTION: &str = r#"{"event":"prediction","data":{"type":"detections","data":[{"box":[10,10,50,50],"text":"cat"}]}}"#;
    const NULL_SCORE_PREDICTION: &str =
        r#"{"event":"prediction","data":{"type":"scores","data":{"cat":null}}}"#;
    const LIST_TYPE_PREDICTION: &str =
        r#"{"event":"prediction","data":{"type":["yolo"],"data":[]}}"#;

    async fn next_render(rx: &mut mpsc::UnboundedReceiver<()>) {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_publishes_frame_event() {
        let (config, mut received, _push) = fake_service().await;
        let channel = TransportChannel::open(&config, metrics()).await.unwrap();

        channel.send(frame("a cat"));

        let text = timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "frame");
        assert_eq!(value["data"]["prompts"][0], "a cat");

        channel.close().await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_prediction_reaches_handler_once_after_reregistration() {
        let (config, _received, push) = fake_service().await;
        let channel = TransportChannel::open(&config, metrics()).await.unwrap();

        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let counter = first_calls.clone();
        let first = channel.on_prediction(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second_calls.clone();
        let _second = channel.on_prediction(move |message| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = seen_tx.send(message);
        });
        // Revoking the stale registration must not remove the current one.
        first.revoke();

        push.send("garbage".into()).unwrap();
        push.send(CAT_PREDICTION.into()).unwrap();

        let message = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, PredictionMessage::Detections(ref d) if d.len() == 1));
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_malformed_prediction_clears_overlay() {
        let (config, _received, push) = fake_service().await;
        let channel = TransportChannel::open(&config, metrics()).await.unwrap();
        let canvas = Arc::new(Canvas::new());
        canvas.bind(FrameSize::new(640, 480));
        let renderer = OverlayRenderer::new(canvas.clone(), metrics());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _subscription = channel.on_prediction(move |message| {
            renderer.on_prediction(&message);
            let _ = seen_tx.send(());
        });

        push.send(CAT_PREDICTION.into()).unwrap();
        next_render(&mut seen_rx).await;
        assert_eq!(canvas.snapshot().commands.len(), 3);

        push.send(NULL_SCORE_PREDICTION.into()).unwrap();
        next_render(&mut seen_rx).await;
        assert_eq!(canvas.snapshot().commands, vec![DrawCommand::Clear]);

        push.send(CAT_PREDICTION.into()).unwrap();
        next_render(&mut seen_rx).await;
        push.send(LIST_TYPE_PREDICTION.into()).unwrap();
        next_render(&mut seen_rx).await;
        assert_eq!(canvas.snapshot().commands, vec![DrawCommand::Clear]);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_outage_longer_than_retry_budget() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = PredictionServiceConfig {
            max_retries: 1,
            ..service_config(addr)
        };
        let first = serve_fake(listener);
        let channel = TransportChannel::open(&config, metrics()).await.unwrap();

        // Take the service down: stop accepting and drop the live socket.
        first.server.abort();
        let _ = first.server.await;
        drop(first.push);
        timeout(Duration::from_secs(2), async {
            while channel.is_connected() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Several failed attempts, well past `max_retries`.
        sleep(Duration::from_millis(400)).await;

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let mut second = serve_fake(listener);

        let received = timeout(Duration::from_secs(5), async {
            loop {
                channel.send(frame("after outage"));
                match timeout(Duration::from_millis(100), second.received.recv()).await {
                    Ok(Some(text)) => break text,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert!(received.contains("after outage"));
        assert!(channel.is_connected());

        channel.close().await;
    }

    #[tokio::test]
    async fn test_open_fails_after_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = PredictionServiceConfig {
            url: format!("ws://{}/ws", addr),
            connect_timeout_ms: 200,
            max_retries: 2,
            outbound_capacity: 1,
        };

        let result = TransportChannel::open(&config, metrics()).await;
        assert!(matches!(result, Err(TransportError::MaxRetriesExceeded(2))));
    }

    #[test]
    fn test_handler_slot_replaces_and_revokes() {
        let slot = Arc::new(HandlerSlot::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let first = slot.register(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = calls.clone();
        let second = slot.register(Arc::new(move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        }));

        assert!(slot.dispatch(PredictionMessage::Scores(Vec::new())));
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        assert!(!slot.revoke(first));
        assert!(slot.revoke(second));
        assert!(!slot.dispatch(PredictionMessage::Scores(Vec::new())));
    }

    #[test]
    fn test_dropping_subscription_revokes_handler() {
        let slot = Arc::new(HandlerSlot::default());
        let id = slot.register(Arc::new(|_| {}));
        let subscription = PredictionSubscription {
            id,
            slot: Arc::downgrade(&slot),
        };

        drop(subscription);

        assert!(!slot.dispatch(PredictionMessage::Scores(Vec::new())));
    }
}
