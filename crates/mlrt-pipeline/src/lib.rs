#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
#[cfg(feature = "ort-runtime")]
pub mod ort_runtime;
pub mod runtime;

pub use config::{CONFIG_SCHEMA_VERSION, CompilerConfig, PatchConfig, RunConfig};
pub use dispatch::{CallContext, EngineCall, InferenceDispatcher, InferenceRuntime};
#[cfg(feature = "ort-runtime")]
pub use ort_runtime::OrtRuntime;
pub use runtime::{InferenceJob, InferencePipeline, PreparedCall};
