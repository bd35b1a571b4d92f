//! Messages exchanged with the prediction service.
//!
//! Every WebSocket text message is an envelope `{"event": <name>, "data": <payload>}`.
//! The client publishes `frame` events and listens for `prediction` events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const FRAME_EVENT: &str = "frame";
pub const PREDICTION_EVENT: &str = "prediction";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Score for `{0}` is not a number")]
    InvalidScore(String),
    #[error("Expected a label to score mapping, got {0}")]
    InvalidScores(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub event: String,
    pub data: T,
}

/// One captured frame plus the prompts it should be judged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrameMessage {
    /// JPEG as a `data:image/jpeg;base64,...` URI.
    pub image: String,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// A prediction as delivered by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionMessage {
    Detections(Vec<Detection>),
    /// Scores in the order the service listed them.
    Scores(Vec<LabelScore>),
    Unrecognized { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawPrediction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(rename = "box")]
    bbox: [f32; 4],
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

impl From<RawDetection> for Detection {
    fn from(raw: RawDetection) -> Self {
        let [x1, y1, x2, y2] = raw.bbox;
        Detection {
            bbox: BoundingBox { x1, y1, x2, y2 },
            label: raw.text.or(raw.label).unwrap_or_default(),
            confidence: raw.confidence,
        }
    }
}

impl TryFrom<RawPrediction> for PredictionMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawPrediction) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            // "yolo" and "clip" are the tags older services still emit
            "detections" | "yolo" => {
                let items: Vec<RawDetection> = serde_json::from_value(raw.data)?;
                Ok(Self::Detections(items.into_iter().map(Detection::from).collect()))
            }
            "scores" | "clip" => {
                let map = match raw.data {
                    Value::Object(map) => map,
                    other => return Err(ProtocolError::InvalidScores(other.to_string())),
                };
                map.into_iter()
                    .map(|(label, value)| match value.as_f64() {
                        Some(score) => Ok(LabelScore { label, score }),
                        None => Err(ProtocolError::InvalidScore(label)),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::Scores)
            }
            _ => Ok(Self::Unrecognized { kind: raw.kind }),
        }
    }
}

impl PredictionMessage {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawPrediction = serde_json::from_value(value)?;
        raw.try_into()
    }
}

#[derive(Debug)]
pub enum InboundEvent {
    Prediction(PredictionMessage),
    Other(String),
}

/// Decodes one inbound text message. A `prediction` whose payload cannot be
/// read still yields a prediction, as [`PredictionMessage::Unrecognized`], so
/// the overlay is cleared instead of keeping the previous drawing.
pub fn decode_inbound(text: &str) -> Result<InboundEvent, ProtocolError> {
    let envelope: Envelope<Value> = serde_json::from_str(text)?;
    if envelope.event != PREDICTION_EVENT {
        return Ok(InboundEvent::Other(envelope.event));
    }

    let kind = match envelope.data.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
        None => "missing".to_string(),
    };
    let message = PredictionMessage::from_value(envelope.data).unwrap_or_else(|e| {
        tracing::warn!("Malformed `{}` prediction: {}", kind, e);
        PredictionMessage::Unrecognized { kind }
    });
    Ok(InboundEvent::Prediction(message))
}

pub fn encode_frame(message: &OutboundFrameMessage) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        event: FRAME_EVENT.to_string(),
        data: message,
    };
    Ok(serde_json::to_string(&envelope)?)
}
