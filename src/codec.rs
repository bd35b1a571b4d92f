use crate::camera::{CapturedFrame, FrameSize};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use std::time::SystemTime;
use thiserror::Error;

const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame has no pixels")]
    EmptyFrame,
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(#[from] image::ImageError),
    #[error("Encoder task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A JPEG-compressed frame ready to be shipped.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub size: FrameSize,
    pub captured_at: SystemTime,
}

impl EncodedFrame {
    pub fn to_data_uri(&self) -> String {
        let mut uri =
            String::with_capacity(JPEG_DATA_URI_PREFIX.len() + self.jpeg.len() * 4 / 3 + 4);
        uri.push_str(JPEG_DATA_URI_PREFIX);
        STANDARD.encode_string(&self.jpeg, &mut uri);
        uri
    }
}

/// Decodes a `data:<mime>;base64,<payload>` URI, or a bare base64 string.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, CodecError> {
    let payload = match uri.split_once(',') {
        Some((_, payload)) => payload,
        None => uri,
    };
    Ok(STANDARD.decode(payload.trim())?)
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    quality: u8,
}

impl FrameCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encodes on the calling thread.
    pub fn encode_blocking(&self, frame: &CapturedFrame) -> Result<EncodedFrame, CodecError> {
        let size = frame.size();
        if size.is_empty() {
            return Err(CodecError::EmptyFrame);
        }

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality).encode_image(&frame.image)?;

        Ok(EncodedFrame {
            jpeg: Bytes::from(buf),
            size,
            captured_at: frame.captured_at,
        })
    }

    /// Encodes on the blocking pool so the capture loop never stalls on
    /// compression.
    pub async fn encode(&self, frame: CapturedFrame) -> Result<EncodedFrame, CodecError> {
        let codec = *self;
        tokio::task::spawn_blocking(move || codec.encode_blocking(&frame)).await?
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(80)
    }
}
