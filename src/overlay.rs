use crate::camera::FrameSize;
use crate::protocol::{Detection, LabelScore, PredictionMessage};
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

pub const DETECTION_COLOR: &str = "red";
pub const DETECTION_LINE_WIDTH: f32 = 2.0;
pub const DETECTION_FONT_PX: u32 = 16;
/// Labels sit this far above the top-left corner of their box.
pub const LABEL_OFFSET: f32 = 5.0;

pub const SCORE_COLOR: &str = "black";
pub const SCORE_FONT_PX: u32 = 18;
pub const SCORE_ORIGIN_X: f32 = 10.0;
pub const SCORE_ORIGIN_Y: f32 = 30.0;
pub const SCORE_LINE_HEIGHT: f32 = 25.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
    Clear,
    StrokeRect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: &'static str,
        line_width: f32,
    },
    FillText {
        text: String,
        x: f32,
        y: f32,
        color: &'static str,
        font_px: u32,
    },
}

/// Draw commands accumulated for one render pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisplayList {
    commands: Vec<DrawCommand>,
}

impl DisplayList {
    pub fn clear(&mut self) {
        self.commands.clear();
        self.commands.push(DrawCommand::Clear);
    }

    pub fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.commands.push(DrawCommand::StrokeRect {
            x,
            y,
            width,
            height,
            color: DETECTION_COLOR,
            line_width: DETECTION_LINE_WIDTH,
        });
    }

    pub fn fill_text(&mut self, text: String, x: f32, y: f32, color: &'static str, font_px: u32) {
        self.commands.push(DrawCommand::FillText {
            text,
            x,
            y,
            color,
            font_px,
        });
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }
}

/// What viewers paint on top of the live video.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverlayFrame {
    /// Increments on every published change.
    pub seq: u64,
    pub size: Option<FrameSize>,
    pub commands: Vec<DrawCommand>,
}

#[derive(Debug, Default)]
struct CanvasState {
    size: Option<FrameSize>,
    commands: Vec<DrawCommand>,
    seq: u64,
}

/// The annotation surface. It is bound to the active camera session's frame
/// size and detached when the session ends; a detached canvas ignores paints.
#[derive(Debug)]
pub struct Canvas {
    state: Mutex<CanvasState>,
    frames: watch::Sender<OverlayFrame>,
}

impl Canvas {
    pub fn new() -> Self {
        let (frames, _) = watch::channel(OverlayFrame::default());
        Self {
            state: Mutex::new(CanvasState::default()),
            frames,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<OverlayFrame> {
        self.frames.subscribe()
    }

    pub fn snapshot(&self) -> OverlayFrame {
        self.frames.borrow().clone()
    }

    pub fn size(&self) -> Option<FrameSize> {
        self.state.lock().size
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().size.is_some()
    }

    pub fn bind(&self, size: FrameSize) {
        let mut state = self.state.lock();
        state.size = Some(size);
        state.commands = vec![DrawCommand::Clear];
        self.publish(&mut state);
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.size = None;
        state.commands = vec![DrawCommand::Clear];
        self.publish(&mut state);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.commands = vec![DrawCommand::Clear];
        self.publish(&mut state);
    }

    /// Replaces the whole display list. Returns `false` when detached.
    pub fn present(&self, list: DisplayList) -> bool {
        let mut state = self.state.lock();
        if state.size.is_none() {
            return false;
        }
        state.commands = list.commands;
        self.publish(&mut state);
        true
    }

    fn publish(&self, state: &mut CanvasState) {
        state.seq += 1;
        self.frames.send_replace(OverlayFrame {
            seq: state.seq,
            size: state.size,
            commands: state.commands.clone(),
        });
    }
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the display list for one prediction: a clear followed by whatever
/// the prediction calls for.
pub fn draw(message: &PredictionMessage) -> DisplayList {
    let mut list = DisplayList::default();
    list.clear();
    match message {
        PredictionMessage::Detections(detections) => draw_detections(&mut list, detections),
        PredictionMessage::Scores(scores) => draw_scores(&mut list, scores),
        PredictionMessage::Unrecognized { kind } => {
            tracing::warn!("Unknown prediction type: {}", kind);
        }
    }
    list
}

fn draw_detections(list: &mut DisplayList, detections: &[Detection]) {
    for detection in detections {
        let bbox = &detection.bbox;
        list.stroke_rect(bbox.x1, bbox.y1, bbox.width(), bbox.height());
        list.fill_text(
            detection.label.clone(),
            bbox.x1,
            bbox.y1 - LABEL_OFFSET,
            DETECTION_COLOR,
            DETECTION_FONT_PX,
        );
    }
}

fn draw_scores(list: &mut DisplayList, scores: &[LabelScore]) {
    let mut y = SCORE_ORIGIN_Y;
    for entry in scores {
        list.fill_text(
            format!("{} ({:.2})", entry.label, entry.score),
            SCORE_ORIGIN_X,
            y,
            SCORE_COLOR,
            SCORE_FONT_PX,
        );
        y += SCORE_LINE_HEIGHT;
    }
}

/// Paints every inbound prediction onto the shared canvas.
#[derive(Clone)]
pub struct OverlayRenderer {
    canvas: Arc<Canvas>,
    metrics: Arc<Metrics>,
}

impl OverlayRenderer {
    pub fn new(canvas: Arc<Canvas>, metrics: Arc<Metrics>) -> Self {
        Self { canvas, metrics }
    }

    pub fn on_prediction(&self, message: &PredictionMessage) {
        self.metrics.record_prediction();
        if !self.canvas.present(draw(message)) {
            tracing::debug!("Canvas detached, dropping prediction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BoundingBox;

    fn attached_canvas() -> Arc<Canvas> {
        let canvas = Arc::new(Canvas::new());
        canvas.bind(FrameSize::new(640, 480));
        canvas
    }

    fn renderer(canvas: &Arc<Canvas>) -> OverlayRenderer {
        OverlayRenderer::new(canvas.clone(), Arc::new(Metrics::new().unwrap()))
    }

    fn cat_detection() -> PredictionMessage {
        PredictionMessage::Detections(vec![Detection {
            bbox: BoundingBox {
                x1: 10.0,
                y1: 10.0,
                x2: 50.0,
                y2: 50.0,
            },
            label: "cat".into(),
            confidence: None,
        }])
    }

    #[test]
    fn test_detection_draws_box_and_label_above_it() {
        let canvas = attached_canvas();
        renderer(&canvas).on_prediction(&cat_detection());

        assert_eq!(
            canvas.snapshot().commands,
            vec![
                DrawCommand::Clear,
                DrawCommand::StrokeRect {
                    x: 10.0,
                    y: 10.0,
                    width: 40.0,
                    height: 40.0,
                    color: "red",
                    line_width: 2.0,
                },
                DrawCommand::FillText {
                    text: "cat".into(),
                    x: 10.0,
                    y: 5.0,
                    color: "red",
                    font_px: 16,
                },
            ]
        );
    }

    #[test]
    fn test_scores_render_as_stacked_lines() {
        let canvas = attached_canvas();
        let message = PredictionMessage::Scores(vec![
            LabelScore {
                label: "cat".into(),
                score: 0.873,
            },
            LabelScore {
                label: "dog".into(),
                score: 0.421,
            },
        ]);

        renderer(&canvas).on_prediction(&message);

        let texts: Vec<(String, f32, f32)> = canvas
            .snapshot()
            .commands
            .into_iter()
            .filter_map(|c| match c {
                DrawCommand::FillText { text, x, y, .. } => Some((text, x, y)),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                ("cat (0.87)".to_string(), 10.0, 30.0),
                ("dog (0.42)".to_string(), 10.0, 55.0),
            ]
        );
    }

    #[test]
    fn test_unknown_prediction_leaves_surface_blank() {
        let canvas = attached_canvas();
        let renderer = renderer(&canvas);

        renderer.on_prediction(&cat_detection());
        renderer.on_prediction(&PredictionMessage::Unrecognized {
            kind: "heatmap".into(),
        });

        assert_eq!(canvas.snapshot().commands, vec![DrawCommand::Clear]);
    }

    #[test]
    fn test_render_is_idempotent() {
        let canvas = attached_canvas();
        let renderer = renderer(&canvas);

        renderer.on_prediction(&cat_detection());
        let first = canvas.snapshot();
        renderer.on_prediction(&cat_detection());
        let second = canvas.snapshot();

        assert_eq!(first.commands, second.commands);
        assert_eq!(second.seq, first.seq + 1);
    }

    #[test]
    fn test_detached_canvas_ignores_predictions() {
        let canvas = Arc::new(Canvas::new());
        let before = canvas.snapshot();

        renderer(&canvas).on_prediction(&cat_detection());

        assert_eq!(canvas.snapshot(), before);
        assert!(!canvas.is_attached());
    }

    #[test]
    fn test_release_blanks_and_detaches() {
        let canvas = attached_canvas();
        renderer(&canvas).on_prediction(&cat_detection());

        canvas.release();

        let frame = canvas.snapshot();
        assert_eq!(frame.size, None);
        assert_eq!(frame.commands, vec![DrawCommand::Clear]);
    }

    #[test]
    fn test_subscribers_see_each_render() {
        let canvas = attached_canvas();
        let mut rx = canvas.subscribe();
        rx.borrow_and_update();

        renderer(&canvas).on_prediction(&cat_detection());

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().commands.len(), 3);
    }
}
