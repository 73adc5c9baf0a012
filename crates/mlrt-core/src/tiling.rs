//! Tile geometry planning.
//!
//! A frame is either processed as one tile, or split into a grid of
//! near-equal tiles whose pairwise overlap hides seams at tile borders.
//! Tile sizes produced from a tile *count* are always rounded up to the
//! model's spatial alignment; explicit tile *sizes* are taken verbatim and
//! checked afterwards with [`TileGeometry::ensure_aligned`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// A scalar or per-axis `(w, h)` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisPair {
    Uniform(u32),
    PerAxis(u32, u32),
}

impl AxisPair {
    pub fn split(self) -> (u32, u32) {
        match self {
            Self::Uniform(v) => (v, v),
            Self::PerAxis(w, h) => (w, h),
        }
    }
}

impl From<u32> for AxisPair {
    fn from(v: u32) -> Self {
        Self::Uniform(v)
    }
}

impl From<(u32, u32)> for AxisPair {
    fn from((w, h): (u32, u32)) -> Self {
        Self::PerAxis(w, h)
    }
}

/// How the caller asked for the frame to be split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileRequest {
    /// Tiling disabled: one tile covering the full frame.
    #[default]
    Whole,
    /// Number of tiles per axis.
    Count(AxisPair),
    /// Explicit tile size per axis, used verbatim.
    Size(AxisPair),
}

/// Final tile geometry for one inference call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    pub tile_w: u32,
    pub tile_h: u32,
    pub overlap_w: u32,
    pub overlap_h: u32,
}

impl TileGeometry {
    /// Spatial tile size as `(w, h)`.
    pub fn tile(&self) -> (u32, u32) {
        (self.tile_w, self.tile_h)
    }

    /// Overlap as `(w, h)`.
    pub fn overlap(&self) -> (u32, u32) {
        (self.overlap_w, self.overlap_h)
    }

    /// Reject tile sizes that violate the model's spatial alignment.
    ///
    /// Must pass before any backend is invoked.
    pub fn ensure_aligned(&self, multiple: u32) -> Result<()> {
        if multiple == 0 {
            return Err(EngineError::InvalidTiling(
                "alignment multiple must be at least 1".into(),
            ));
        }
        if self.tile_w == 0 || self.tile_h == 0 {
            return Err(EngineError::InvalidTiling(format!(
                "tile size must be non-zero, got {}x{}",
                self.tile_w, self.tile_h
            )));
        }
        if self.tile_w % multiple != 0 {
            return Err(EngineError::AlignmentViolation {
                axis: "width",
                size: self.tile_w,
                multiple,
            });
        }
        if self.tile_h % multiple != 0 {
            return Err(EngineError::AlignmentViolation {
                axis: "height",
                size: self.tile_h,
                multiple,
            });
        }
        Ok(())
    }
}

/// Tile size along one axis for `tiles` tiles overlapping by `overlap`.
///
/// `ceil((dim + 2*overlap*(tiles-1)) / (tiles*multiple)) * multiple`, never
/// smaller than `multiple`.
pub fn calc_size(dim: u32, tiles: u32, overlap: u32, multiple: u32) -> Result<u32> {
    if tiles == 0 {
        return Err(EngineError::InvalidTiling("tile count must be at least 1".into()));
    }
    if multiple == 0 {
        return Err(EngineError::InvalidTiling(
            "alignment multiple must be at least 1".into(),
        ));
    }
    let span = u64::from(dim) + 2 * u64::from(overlap) * u64::from(tiles - 1);
    let step = u64::from(tiles) * u64::from(multiple);
    let size = span.div_ceil(step).max(1) * u64::from(multiple);
    u32::try_from(size)
        .map_err(|_| EngineError::InvalidTiling(format!("tile size {size} overflows u32")))
}

/// Compute the tile geometry for a `width`×`height` frame.
pub fn plan_tiles(
    request: TileRequest,
    width: u32,
    height: u32,
    multiple: u32,
    overlap: AxisPair,
) -> Result<TileGeometry> {
    let (overlap_w, overlap_h) = overlap.split();
    let geometry = match request {
        TileRequest::Whole => TileGeometry {
            tile_w: width,
            tile_h: height,
            overlap_w: 0,
            overlap_h: 0,
        },
        TileRequest::Count(tiles) => {
            let (tiles_w, tiles_h) = tiles.split();
            TileGeometry {
                tile_w: calc_size(width, tiles_w, overlap_w, multiple)?,
                tile_h: calc_size(height, tiles_h, overlap_h, multiple)?,
                overlap_w,
                overlap_h,
            }
        }
        TileRequest::Size(size) => {
            let (tile_w, tile_h) = size.split();
            TileGeometry {
                tile_w,
                tile_h,
                overlap_w,
                overlap_h,
            }
        }
    };

    debug!(
        ?request,
        width,
        height,
        multiple,
        tile_w = geometry.tile_w,
        tile_h = geometry.tile_h,
        overlap_w = geometry.overlap_w,
        overlap_h = geometry.overlap_h,
        "Tile geometry planned"
    );
    Ok(geometry)
}
