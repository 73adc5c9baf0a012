//! Per-model facts the planner and backends need: input channel count,
//! spatial alignment and the overlap used when the caller gives none.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::tiling::AxisPair;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    /// Input channels expected by the network (e.g. 3 for planar RGB).
    pub channels: u32,
    /// Required spatial alignment of every tile dimension.
    pub multiple: u32,
    /// Overlap used when the caller does not specify one.
    pub default_overlap: AxisPair,
}

impl ModelProfile {
    pub fn new(name: impl Into<String>, channels: u32, multiple: u32) -> Result<Self> {
        let name = name.into();
        if channels == 0 || multiple == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "model '{name}': channels and multiple must be at least 1"
            )));
        }
        Ok(Self {
            name,
            channels,
            multiple,
            default_overlap: AxisPair::Uniform(0),
        })
    }

    pub fn with_default_overlap(mut self, overlap: impl Into<AxisPair>) -> Self {
        self.default_overlap = overlap.into();
        self
    }

    /// Caller overlap, or this model's default.
    pub fn resolve_overlap(&self, overlap: Option<AxisPair>) -> AxisPair {
        overlap.unwrap_or(self.default_overlap)
    }
}

/// Waifu2x network variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waifu2xModel {
    AnimeStyleArt,
    AnimeStyleArtRgb,
    Photo,
    Upconv7AnimeStyleArtRgb,
    Upconv7Photo,
    Upresnet10,
    Cunet,
}

impl Waifu2xModel {
    pub const ALL: [Waifu2xModel; 7] = [
        Self::AnimeStyleArt,
        Self::AnimeStyleArtRgb,
        Self::Photo,
        Self::Upconv7AnimeStyleArtRgb,
        Self::Upconv7Photo,
        Self::Upresnet10,
        Self::Cunet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AnimeStyleArt => "anime_style_art",
            Self::AnimeStyleArtRgb => "anime_style_art_rgb",
            Self::Photo => "photo",
            Self::Upconv7AnimeStyleArtRgb => "upconv_7_anime_style_art_rgb",
            Self::Upconv7Photo => "upconv_7_photo",
            Self::Upresnet10 => "upresnet10",
            Self::Cunet => "cunet",
        }
    }

    pub fn profile(self) -> ModelProfile {
        let (channels, multiple, overlap) = match self {
            Self::AnimeStyleArt => (1, 1, 8),
            Self::AnimeStyleArtRgb
            | Self::Photo
            | Self::Upconv7AnimeStyleArtRgb
            | Self::Upconv7Photo => (3, 1, 8),
            Self::Upresnet10 => (3, 1, 4),
            Self::Cunet => (3, 4, 4),
        };
        ModelProfile {
            name: format!("waifu2x/{}", self.name()),
            channels,
            multiple,
            default_overlap: AxisPair::Uniform(overlap),
        }
    }
}
