use crate::camera::{CameraError, CapturedFrame, FrameSize, MediaDevice, MediaStream};
use futures::future::BoxFuture;
use image::RgbImage;
use opencv::{core::Mat, imgproc, prelude::*, videoio};
use parking_lot::Mutex;
use std::sync::Arc;

/// Webcam opened through OpenCV's `VideoCapture`.
#[derive(Debug, Clone)]
pub struct OpenCvDevice {
    index: i32,
}

impl OpenCvDevice {
    pub fn new(index: i32) -> Self {
        Self { index }
    }
}

impl MediaDevice for OpenCvDevice {
    fn name(&self) -> String {
        format!("webcam {}", self.index)
    }

    fn open(&self) -> BoxFuture<'_, Result<Arc<dyn MediaStream>, CameraError>> {
        let index = self.index;
        Box::pin(async move {
            let opened = tokio::task::spawn_blocking(move || -> Result<_, CameraError> {
                let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)?;
                if !capture.is_opened()? {
                    return Err(CameraError::DeviceUnavailable(format!(
                        "webcam {} could not be opened",
                        index
                    )));
                }
                let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
                let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
                Ok((capture, FrameSize::new(width, height)))
            })
            .await
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))??;

            let (capture, size) = opened;
            let stream: Arc<dyn MediaStream> = Arc::new(OpenCvStream {
                capture: Arc::new(Mutex::new(Some(capture))),
                size,
            });
            Ok(stream)
        })
    }
}

pub struct OpenCvStream {
    capture: Arc<Mutex<Option<videoio::VideoCapture>>>,
    size: FrameSize,
}

fn mat_to_rgb(frame: &Mat) -> Result<RgbImage, CameraError> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let rgb = if rgb.is_continuous() {
        rgb
    } else {
        rgb.try_clone()?
    };
    let width = rgb.cols() as u32;
    let height = rgb.rows() as u32;
    let data = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| CameraError::ReadFrameFailed("unexpected frame layout".into()))
}

impl MediaStream for OpenCvStream {
    fn size(&self) -> FrameSize {
        self.size
    }

    fn read_frame(&self) -> BoxFuture<'_, Result<CapturedFrame, CameraError>> {
        let capture = self.capture.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = capture.lock();
                let cam = guard.as_mut().ok_or(CameraError::StreamEnded)?;
                let mut frame = Mat::default();
                let grabbed = cam
                    .read(&mut frame)
                    .map_err(|e| CameraError::ReadFrameFailed(e.to_string()))?;
                if !grabbed || frame.empty() {
                    return Err(CameraError::ReadFrameFailed("empty frame".into()));
                }
                Ok(CapturedFrame::new(mat_to_rgb(&frame)?))
            })
            .await
            .map_err(|e| CameraError::ReadFrameFailed(e.to_string()))?
        })
    }

    fn stop(&self) {
        if let Some(mut cam) = self.capture.lock().take() {
            if let Err(e) = cam.release() {
                tracing::warn!("Failed to release webcam: {:?}", e);
            }
        }
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.capture.lock().is_some())
    }
}
