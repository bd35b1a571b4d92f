use futures::future::BoxFuture;
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera access denied: {0}")]
    PermissionDenied(String),
    #[error("No usable camera device: {0}")]
    DeviceUnavailable(String),
    #[error("Media stream has been stopped")]
    StreamEnded,
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One raw RGB frame, alive only between capture and encode.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at: SystemTime,
}

impl CapturedFrame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: SystemTime::now(),
        }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.image.width(), self.image.height())
    }
}

/// Something a camera session can be opened on.
pub trait MediaDevice: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Acquires the device. Resolves to an error when access is refused or no
    /// device answers.
    fn open(&self) -> BoxFuture<'_, Result<Arc<dyn MediaStream>, CameraError>>;
}

/// A live stream handed out by a [`MediaDevice`].
pub trait MediaStream: Send + Sync + 'static {
    fn size(&self) -> FrameSize;

    fn read_frame(&self) -> BoxFuture<'_, Result<CapturedFrame, CameraError>>;

    /// Stops every track of the stream. Safe to call more than once.
    fn stop(&self);

    fn active_tracks(&self) -> usize;
}

/// Synthetic camera producing a moving colour gradient. Used when no webcam is
/// configured and for local runs without hardware.
#[derive(Debug, Clone)]
pub struct TestPatternDevice {
    size: FrameSize,
}

impl TestPatternDevice {
    pub fn new(size: FrameSize) -> Self {
        Self { size }
    }
}

impl MediaDevice for TestPatternDevice {
    fn name(&self) -> String {
        format!("test-pattern {}x{}", self.size.width, self.size.height)
    }

    fn open(&self) -> BoxFuture<'_, Result<Arc<dyn MediaStream>, CameraError>> {
        Box::pin(async move {
            if self.size.is_empty() {
                return Err(CameraError::DeviceUnavailable(
                    "test pattern configured with a zero dimension".into(),
                ));
            }
            let stream: Arc<dyn MediaStream> = Arc::new(TestPatternStream {
                size: self.size,
                live: AtomicBool::new(true),
                frames: AtomicU64::new(0),
            });
            Ok(stream)
        })
    }
}

#[derive(Debug)]
pub struct TestPatternStream {
    size: FrameSize,
    live: AtomicBool,
    frames: AtomicU64,
}

impl TestPatternStream {
    fn render(&self, offset: u64) -> RgbImage {
        let FrameSize { width, height } = self.size;
        RgbImage::from_fn(width, height, |x, y| {
            let shifted = (x as u64 + offset * 8) % width as u64;
            Rgb([
                (shifted * 255 / width as u64) as u8,
                (y as u64 * 255 / height as u64) as u8,
                (offset % 256) as u8,
            ])
        })
    }
}

impl MediaStream for TestPatternStream {
    fn size(&self) -> FrameSize {
        self.size
    }

    fn read_frame(&self) -> BoxFuture<'_, Result<CapturedFrame, CameraError>> {
        Box::pin(async move {
            if !self.live.load(Ordering::SeqCst) {
                return Err(CameraError::StreamEnded);
            }
            let offset = self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(CapturedFrame::new(self.render(offset)))
        })
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.live.load(Ordering::SeqCst))
    }
}
