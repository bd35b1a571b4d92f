use crate::codec::EncodedFrame;
use bytes::Bytes;
use futures::stream;
use std::{convert::Infallible, time::Duration};
use tokio::{sync::watch, time::sleep};
use tracing::instrument;

pub const FRAME_BOUNDARY: &str = "frame";

/// MJPEG view of the frames the capture loop sends out.
#[derive(Clone)]
pub struct VideoStream {
    frames: watch::Receiver<Option<EncodedFrame>>,
    video_stream_delay: u64,
}

impl VideoStream {
    pub fn new(frames: watch::Receiver<Option<EncodedFrame>>, video_stream_delay: u64) -> Self {
        Self {
            frames,
            video_stream_delay,
        }
    }

    /// Yields one multipart part per new frame. Waits for the first frame
    /// when the camera is idle; ends once a streaming session stops or the
    /// controller goes away.
    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
        let delay = Duration::from_millis(self.video_stream_delay);
        let mut frames = self.frames;
        frames.mark_changed();

        stream::unfold((frames, false), move |(mut frames, mut seen)| async move {
            loop {
                if frames.changed().await.is_err() {
                    return None;
                }
                let latest = frames.borrow_and_update().clone();
                match latest {
                    Some(frame) => {
                        seen = true;
                        sleep(delay).await;
                        return Some((Ok(multipart_part(&frame.jpeg)), (frames, seen)));
                    }
                    None if seen => return None,
                    None => continue,
                }
            }
        })
    }
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        jpeg.len()
    );
    let mut body = part_header.into_bytes();
    body.extend_from_slice(jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}
