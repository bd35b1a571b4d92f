use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct Metrics {
    request_counter: IntCounterVec,
    frames_sent: IntCounter,
    frames_dropped: IntCounter,
    predictions_received: IntCounter,
    encode_duration: Histogram,
    capture_fps: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new_custom(Some("live_annotate".into()), None)?;

        let request_counter = IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests"),
            &["route"],
        )?;

        let frames_sent = IntCounter::new("frames_sent_total", "Frames handed to the transport")?;

        let frames_dropped = IntCounter::new(
            "frames_dropped_total",
            "Frames discarded because the transport could not take them",
        )?;

        let predictions_received = IntCounter::new(
            "predictions_received_total",
            "Prediction events received from the prediction service",
        )?;

        let boundaries = generate_boundaries((5, 15, 25, 105, 505));

        let encode_duration = Histogram::with_opts(
            HistogramOpts::new(
                "encode_duration_ms",
                "Duration of frame encoding in milliseconds",
            )
            .buckets(boundaries),
        )?;

        let capture_fps = Gauge::new("capture_fps", "Observed capture tick rate")?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(predictions_received.clone()))?;
        registry.register(Box::new(encode_duration.clone()))?;
        registry.register(Box::new(capture_fps.clone()))?;

        Ok(Metrics {
            request_counter,
            frames_sent,
            frames_dropped,
            predictions_received,
            encode_duration,
            capture_fps,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        self.request_counter.with_label_values(&[route]).inc();
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.inc();
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.inc();
    }

    pub fn record_prediction(&self) {
        self.predictions_received.inc();
    }

    pub fn record_encode_duration(&self, duration: Duration) {
        self.encode_duration.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_capture_fps(&self, fps: f64) {
        self.capture_fps.set(fps);
    }

    pub fn render(&self) -> Result<String, TelemetryError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
