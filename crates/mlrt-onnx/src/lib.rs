#![doc = include_str!("../README.md")]

pub mod patch;
pub mod proto;

pub use patch::{ConstantPattern, GraphPatch, ScaleLayout, persist_patched_graph};
pub use proto::ModelProto;
pub use prost::Message;

use mlrt_core::error::EngineError;

fn error_from_decode(err: prost::DecodeError) -> EngineError {
    EngineError::GraphDecode(err.to_string())
}
