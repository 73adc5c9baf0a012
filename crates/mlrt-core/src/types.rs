//! Host frame containers exchanged with inference runtimes.

use std::sync::Arc;

use crate::error::{EngineError, Result};

/// One planar 32-bit float frame (`channels` planes of `width * height`).
#[derive(Clone, Debug, PartialEq)]
pub struct PlanarFrame {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Arc<[f32]>,
}

impl PlanarFrame {
    pub fn new(width: u32, height: u32, channels: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(EngineError::InvalidConfig(format!(
                "frame {width}x{height}x{channels} needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data: Arc::from(data),
        })
    }

    pub fn plane(&self, channel: u32) -> &[f32] {
        let len = self.width as usize * self.height as usize;
        let start = channel as usize * len;
        &self.data[start..start + len]
    }
}

/// An ordered sequence of frames sharing one format.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStream {
    pub frames: Vec<PlanarFrame>,
}

impl FrameStream {
    pub fn new(frames: Vec<PlanarFrame>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `(width, height)` of the first frame.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.frames.first().map(|f| (f.width, f.height))
    }
}

/// Check that every input stream has the same number of frames and the same
/// spatial size, returning that `(width, height)`.
pub fn check_streams(inputs: &[FrameStream]) -> Result<(u32, u32)> {
    let Some(first) = inputs.first() else {
        return Err(EngineError::InvalidConfig(
            "at least one input stream is required".into(),
        ));
    };
    let dims = first.dimensions().ok_or_else(|| {
        EngineError::InvalidConfig("input streams must contain at least one frame".into())
    })?;
    for (index, stream) in inputs.iter().enumerate() {
        if stream.len() != first.len() {
            return Err(EngineError::InvalidConfig(format!(
                "input stream {index} has {} frames, expected {}",
                stream.len(),
                first.len()
            )));
        }
        if let Some(frame) = stream
            .frames
            .iter()
            .find(|f| (f.width, f.height) != dims)
        {
            return Err(EngineError::InvalidConfig(format!(
                "input stream {index} mixes frame sizes: {}x{} vs {}x{}",
                frame.width, frame.height, dims.0, dims.1
            )));
        }
    }
    Ok(dims)
}
