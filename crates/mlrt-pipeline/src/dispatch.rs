//! Backend dispatch with a single fallback retry.
//!
//! Every [`BackendSpec`] variant maps to exactly one [`EngineCall`]
//! contract; an [`InferenceRuntime`] executes the call. When the primary
//! attempt fails for any reason and a fallback selection is configured, the
//! failure is logged once and the whole call is retried on the fallback with
//! the same inputs, geometry and network. A failing fallback is not retried.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use mlrt_core::backend::{
    NcnnVkOptions, OrtCpuOptions, OrtCudaOptions, OvCpuOptions, OvGpuOptions, TensorRtSpec,
};
use mlrt_core::error::{EngineError, Result};
use mlrt_core::types::check_streams;
use mlrt_core::{BackendKind, BackendSelection, BackendSpec, FrameStream, NetworkArtifact, TileGeometry, normalize};
use mlrt_tensorrt::EngineBuilder;

/// ONNX Runtime execution provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrtProvider {
    Cpu,
    Cuda,
}

/// OpenVINO target device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OvDevice {
    Cpu,
    Gpu(u32),
}

impl OvDevice {
    /// OpenVINO device string (`CPU`, `GPU.0`, ...).
    pub fn label(self) -> String {
        match self {
            Self::Cpu => "CPU".into(),
            Self::Gpu(id) => format!("GPU.{id}"),
        }
    }
}

/// The fixed external call contracts.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    Ort {
        provider: OrtProvider,
        network: NetworkArtifact,
        geometry: TileGeometry,
        device_id: u32,
        num_streams: u32,
        fp16: bool,
        fp16_blacklist_ops: Option<Vec<String>>,
        cudnn_benchmark: bool,
        use_cuda_graph: bool,
        verbosity: u32,
    },
    OpenVino {
        device: OvDevice,
        network: NetworkArtifact,
        geometry: TileGeometry,
        fp16: bool,
        fp16_blacklist_ops: Option<Vec<String>>,
        num_streams: u32,
        bind_thread: bool,
    },
    TensorRt {
        engine: PathBuf,
        geometry: TileGeometry,
        device_id: u32,
        num_streams: u32,
        use_cuda_graph: bool,
        verbose: bool,
    },
    Ncnn {
        network: NetworkArtifact,
        geometry: TileGeometry,
        device_id: u32,
        fp16: bool,
        num_streams: u32,
    },
}

impl EngineCall {
    /// Backend kind family of this contract, for error reporting.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ort { .. } => "ort",
            Self::OpenVino { .. } => "openvino",
            Self::TensorRt { .. } => "tensorrt",
            Self::Ncnn { .. } => "ncnn",
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Ort {
                provider: OrtProvider::Cpu,
                ..
            } => BackendKind::OrtCpu,
            Self::Ort { .. } => BackendKind::OrtCuda,
            Self::OpenVino {
                device: OvDevice::Cpu,
                ..
            } => BackendKind::OvCpu,
            Self::OpenVino { .. } => BackendKind::OvGpu,
            Self::TensorRt { .. } => BackendKind::TensorRt,
            Self::Ncnn { .. } => BackendKind::NcnnVk,
        }
    }

    pub fn geometry(&self) -> &TileGeometry {
        match self {
            Self::Ort { geometry, .. }
            | Self::OpenVino { geometry, .. }
            | Self::TensorRt { geometry, .. }
            | Self::Ncnn { geometry, .. } => geometry,
        }
    }
}

/// Executes engine calls. Implementations wrap the real runtimes.
pub trait InferenceRuntime: Send + Sync {
    fn invoke(&self, call: &EngineCall, inputs: &[FrameStream]) -> Result<FrameStream>;
}

/// Everything a call needs besides the backend configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CallContext {
    pub network: NetworkArtifact,
    pub geometry: TileGeometry,
    /// Model input channels, used to normalize the fallback.
    pub channels: u32,
}

pub struct InferenceDispatcher {
    runtime: Arc<dyn InferenceRuntime>,
    engines: Option<Arc<EngineBuilder>>,
    fallback: Option<BackendSelection>,
}

impl InferenceDispatcher {
    pub fn new(runtime: Arc<dyn InferenceRuntime>) -> Self {
        Self {
            runtime,
            engines: None,
            fallback: None,
        }
    }

    pub fn with_engine_builder(mut self, engines: Arc<EngineBuilder>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn with_fallback(mut self, fallback: Option<BackendSelection>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback(&self) -> Option<&BackendSelection> {
        self.fallback.as_ref()
    }

    /// Map `spec` to its call contract, compiling an engine if needed.
    pub fn engine_call(&self, spec: &BackendSpec, ctx: &CallContext) -> Result<EngineCall> {
        let network = ctx.network.clone();
        let geometry = ctx.geometry;
        Ok(match spec {
            BackendSpec::OrtCpu(OrtCpuOptions {
                num_streams,
                verbosity,
                fp16,
                fp16_blacklist_ops,
            }) => EngineCall::Ort {
                provider: OrtProvider::Cpu,
                network,
                geometry,
                device_id: 0,
                num_streams: *num_streams,
                fp16: *fp16,
                fp16_blacklist_ops: fp16_blacklist_ops.clone(),
                cudnn_benchmark: false,
                use_cuda_graph: false,
                verbosity: *verbosity,
            },
            BackendSpec::OrtCuda(OrtCudaOptions {
                device_id,
                cudnn_benchmark,
                num_streams,
                verbosity,
                fp16,
                use_cuda_graph,
                fp16_blacklist_ops,
            }) => EngineCall::Ort {
                provider: OrtProvider::Cuda,
                network,
                geometry,
                device_id: *device_id,
                num_streams: *num_streams,
                fp16: *fp16,
                fp16_blacklist_ops: fp16_blacklist_ops.clone(),
                cudnn_benchmark: *cudnn_benchmark,
                use_cuda_graph: *use_cuda_graph,
                verbosity: *verbosity,
            },
            BackendSpec::OvCpu(OvCpuOptions {
                fp16,
                num_streams,
                bind_thread,
                fp16_blacklist_ops,
            }) => EngineCall::OpenVino {
                device: OvDevice::Cpu,
                network,
                geometry,
                fp16: *fp16,
                fp16_blacklist_ops: fp16_blacklist_ops.clone(),
                num_streams: *num_streams,
                bind_thread: *bind_thread,
            },
            BackendSpec::OvGpu(OvGpuOptions {
                fp16,
                num_streams,
                device_id,
                fp16_blacklist_ops,
            }) => EngineCall::OpenVino {
                device: OvDevice::Gpu(*device_id),
                network,
                geometry,
                fp16: *fp16,
                fp16_blacklist_ops: fp16_blacklist_ops.clone(),
                num_streams: *num_streams,
                bind_thread: false,
            },
            BackendSpec::TensorRt(trt) => self.tensorrt_call(trt, ctx)?,
            BackendSpec::NcnnVk(NcnnVkOptions {
                fp16,
                device_id,
                num_streams,
            }) => EngineCall::Ncnn {
                network,
                geometry,
                device_id: *device_id,
                fp16: *fp16,
                num_streams: *num_streams,
            },
        })
    }

    fn tensorrt_call(&self, spec: &TensorRtSpec, ctx: &CallContext) -> Result<EngineCall> {
        if !ctx.network.is_path() {
            return Err(EngineError::UnsupportedArtifact {
                backend: BackendKind::TensorRt,
            });
        }
        let engines = self
            .engines
            .as_ref()
            .ok_or(EngineError::EngineUnavailable(BackendKind::TensorRt))?;
        let engine = engines.resolve(&ctx.network, spec)?;
        let options = &spec.options;
        Ok(EngineCall::TensorRt {
            engine: engine.path,
            geometry: ctx.geometry,
            device_id: options.device_id,
            num_streams: options.num_streams,
            use_cuda_graph: options.use_cuda_graph,
            verbose: options.verbose,
        })
    }

    fn attempt(&self, spec: &BackendSpec, ctx: &CallContext, inputs: &[FrameStream]) -> Result<FrameStream> {
        let call = self.engine_call(spec, ctx)?;
        debug!(backend = %spec.kind(), contract = call.label(), "Invoking backend");
        self.runtime.invoke(&call, inputs)
    }

    /// Run one inference call, retrying once on the fallback backend.
    pub fn dispatch(
        &self,
        spec: &BackendSpec,
        ctx: &CallContext,
        inputs: &[FrameStream],
    ) -> Result<FrameStream> {
        check_streams(inputs)?;

        let err = match self.attempt(spec, ctx, inputs) {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };
        let Some(fallback) = &self.fallback else {
            return Err(err);
        };

        warn!(
            backend = %spec.kind(),
            fallback = %fallback.kind(),
            error = %err,
            recoverable = err.is_recoverable(),
            "Primary backend failed; retrying on fallback"
        );
        let fallback_spec = normalize(fallback, ctx.channels, &ctx.geometry)?;
        self.attempt(&fallback_spec, ctx, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl InferenceRuntime for Echo {
        fn invoke(&self, _call: &EngineCall, inputs: &[FrameStream]) -> Result<FrameStream> {
            Ok(inputs[0].clone())
        }
    }

    fn ctx(network: NetworkArtifact) -> CallContext {
        CallContext {
            network,
            geometry: TileGeometry {
                tile_w: 64,
                tile_h: 64,
                overlap_w: 0,
                overlap_h: 0,
            },
            channels: 3,
        }
    }

    #[test]
    fn every_backend_maps_to_one_contract() {
        let dispatcher = InferenceDispatcher::new(Arc::new(Echo));
        let ctx = ctx(NetworkArtifact::from(vec![1, 2, 3]));
        let expected = [
            (BackendKind::OrtCpu, "ort"),
            (BackendKind::OrtCuda, "ort"),
            (BackendKind::OvCpu, "openvino"),
            (BackendKind::OvGpu, "openvino"),
            (BackendKind::NcnnVk, "ncnn"),
        ];
        for (kind, label) in expected {
            let spec = normalize(&kind.into(), 3, &ctx.geometry).unwrap();
            assert_eq!(dispatcher.engine_call(&spec, &ctx).unwrap().label(), label);
        }
    }

    #[test]
    fn ov_gpu_uses_device_ordinal() {
        let dispatcher = InferenceDispatcher::new(Arc::new(Echo));
        let ctx = ctx(NetworkArtifact::from(vec![0]));
        let spec = BackendSpec::OvGpu(OvGpuOptions {
            device_id: 1,
            ..OvGpuOptions::default()
        });
        let EngineCall::OpenVino { device, .. } = dispatcher.engine_call(&spec, &ctx).unwrap() else {
            panic!("expected openvino contract");
        };
        assert_eq!(device.label(), "GPU.1");
    }

    #[test]
    fn tensorrt_rejects_in_memory_network() {
        let dispatcher = InferenceDispatcher::new(Arc::new(Echo));
        let ctx = ctx(NetworkArtifact::from(vec![0]));
        let spec = normalize(&BackendKind::TensorRt.into(), 3, &ctx.geometry).unwrap();
        let err = dispatcher.engine_call(&spec, &ctx).expect_err("bytes");
        assert!(matches!(err, EngineError::UnsupportedArtifact { .. }));
    }

    #[test]
    fn tensorrt_without_builder_is_unavailable() {
        let dispatcher = InferenceDispatcher::new(Arc::new(Echo));
        let ctx = ctx(NetworkArtifact::Path("/models/x.onnx".into()));
        let spec = normalize(&BackendKind::TensorRt.into(), 3, &ctx.geometry).unwrap();
        let err = dispatcher.engine_call(&spec, &ctx).expect_err("no builder");
        assert_eq!(err.error_code(), 402);
    }
}
