#![doc = include_str!("../README.md")]

pub mod cache_key;
pub mod compiler;
pub mod device;
pub mod engine_cache;
pub mod lock;

pub use cache_key::EngineCacheKey;
pub use compiler::{BuildMode, CompileRequest, EngineCompiler, TrtExec};
pub use device::{DeviceProbe, NamedDevice, PositionalDevice};
pub use engine_cache::{EngineBuilder, EngineSource, ResolvedEngine};
