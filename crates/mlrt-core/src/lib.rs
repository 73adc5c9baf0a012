#![doc = include_str!("../README.md")]

pub mod artifact;
pub mod backend;
pub mod error;
pub mod model;
pub mod paths;
pub mod tiling;
pub mod types;

pub use artifact::NetworkArtifact;
pub use backend::{Backend, BackendKind, BackendSelection, BackendSpec, TensorRtSpec, normalize};
pub use error::{EngineError, Result};
pub use model::ModelProfile;
pub use tiling::{AxisPair, TileGeometry, TileRequest, calc_size, plan_tiles};
pub use types::{FrameStream, PlanarFrame};
