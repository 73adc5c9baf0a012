//! Backend selection, option sets and normalization.
//!
//! Callers hand over a [`BackendSelection`]: either a "use defaults" marker
//! for a backend kind or a fully configured [`Backend`]. [`normalize`] turns
//! it into an immutable [`BackendSpec`] for one inference call. Only the
//! compiling backend (TensorRT) carries derived fields; they are never
//! accepted from the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::tiling::TileGeometry;

/// Backend kinds understood by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OrtCpu,
    OrtCuda,
    OvCpu,
    OvGpu,
    TensorRt,
    NcnnVk,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        Self::OrtCpu,
        Self::OrtCuda,
        Self::OvCpu,
        Self::OvGpu,
        Self::TensorRt,
        Self::NcnnVk,
    ];

    /// User-facing name; identical to the serialized config spelling.
    pub fn label(self) -> &'static str {
        match self {
            Self::OrtCpu => "ort_cpu",
            Self::OrtCuda => "ort_cuda",
            Self::OvCpu => "ov_cpu",
            Self::OvGpu => "ov_gpu",
            Self::TensorRt => "tensor_rt",
            Self::NcnnVk => "ncnn_vk",
        }
    }

    /// Whether the backend needs an ahead-of-time compiled engine.
    pub fn requires_compilation(self) -> bool {
        matches!(self, Self::TensorRt)
    }

    /// Accepts labels case-insensitively, with `-` for `_`, plus `tensorrt`.
    pub fn parse(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        if normalized == "tensorrt" {
            return Ok(Self::TensorRt);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == normalized)
            .ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "Unknown backend '{s}'. Use one of: ort_cpu, ort_cuda, ov_cpu, ov_gpu, tensor_rt, ncnn_vk"
                ))
            })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Option sets ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrtCpuOptions {
    pub num_streams: u32,
    pub verbosity: u32,
    pub fp16: bool,
    pub fp16_blacklist_ops: Option<Vec<String>>,
}

impl Default for OrtCpuOptions {
    fn default() -> Self {
        Self {
            num_streams: 1,
            verbosity: 2,
            fp16: false,
            fp16_blacklist_ops: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrtCudaOptions {
    pub device_id: u32,
    pub cudnn_benchmark: bool,
    pub num_streams: u32,
    pub verbosity: u32,
    pub fp16: bool,
    pub use_cuda_graph: bool,
    pub fp16_blacklist_ops: Option<Vec<String>>,
}

impl Default for OrtCudaOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            cudnn_benchmark: true,
            num_streams: 1,
            verbosity: 2,
            fp16: false,
            use_cuda_graph: false,
            fp16_blacklist_ops: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvCpuOptions {
    pub fp16: bool,
    pub num_streams: u32,
    pub bind_thread: bool,
    pub fp16_blacklist_ops: Option<Vec<String>>,
}

impl Default for OvCpuOptions {
    fn default() -> Self {
        Self {
            fp16: false,
            num_streams: 1,
            bind_thread: true,
            fp16_blacklist_ops: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvGpuOptions {
    pub fp16: bool,
    pub num_streams: u32,
    pub device_id: u32,
    pub fp16_blacklist_ops: Option<Vec<String>>,
}

impl Default for OvGpuOptions {
    fn default() -> Self {
        Self {
            fp16: false,
            num_streams: 1,
            device_id: 0,
            fp16_blacklist_ops: None,
        }
    }
}

/// Caller-facing TensorRT options. Shape bounds are optional here and
/// resolved during [`normalize`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorRtOptions {
    /// Maximum compilation shape `(w, h)`; defaults to the tile size.
    pub max_shapes: Option<(u32, u32)>,
    /// Optimization shape `(w, h)`; defaults to the maximum shape.
    pub opt_shapes: Option<(u32, u32)>,
    pub fp16: bool,
    pub device_id: u32,
    /// Builder workspace in MiB.
    pub workspace_mib: u64,
    pub verbose: bool,
    pub use_cuda_graph: bool,
    pub num_streams: u32,
    pub use_cublas: bool,
    pub static_shape: bool,
    /// Allow TF32 tensor-core math.
    pub tf32: bool,
    /// Keep the compiler diagnostic log.
    pub log: bool,
}

impl Default for TensorRtOptions {
    fn default() -> Self {
        Self {
            max_shapes: None,
            opt_shapes: None,
            fp16: false,
            device_id: 0,
            workspace_mib: 128,
            verbose: false,
            use_cuda_graph: false,
            num_streams: 1,
            use_cublas: false,
            static_shape: true,
            tf32: true,
            log: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NcnnVkOptions {
    pub fp16: bool,
    pub device_id: u32,
    pub num_streams: u32,
}

impl Default for NcnnVkOptions {
    fn default() -> Self {
        Self {
            fp16: false,
            device_id: 0,
            num_streams: 1,
        }
    }
}

/// A fully specified, caller-owned backend configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    OrtCpu(OrtCpuOptions),
    OrtCuda(OrtCudaOptions),
    OvCpu(OvCpuOptions),
    OvGpu(OvGpuOptions),
    TensorRt(TensorRtOptions),
    NcnnVk(NcnnVkOptions),
}

impl Backend {
    /// Default-valued configuration for `kind`.
    pub fn defaults(kind: BackendKind) -> Self {
        match kind {
            BackendKind::OrtCpu => Self::OrtCpu(OrtCpuOptions::default()),
            BackendKind::OrtCuda => Self::OrtCuda(OrtCudaOptions::default()),
            BackendKind::OvCpu => Self::OvCpu(OvCpuOptions::default()),
            BackendKind::OvGpu => Self::OvGpu(OvGpuOptions::default()),
            BackendKind::TensorRt => Self::TensorRt(TensorRtOptions::default()),
            BackendKind::NcnnVk => Self::NcnnVk(NcnnVkOptions::default()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::OrtCpu(_) => BackendKind::OrtCpu,
            Self::OrtCuda(_) => BackendKind::OrtCuda,
            Self::OvCpu(_) => BackendKind::OvCpu,
            Self::OvGpu(_) => BackendKind::OvGpu,
            Self::TensorRt(_) => BackendKind::TensorRt,
            Self::NcnnVk(_) => BackendKind::NcnnVk,
        }
    }

    /// Structural checks that do not depend on the tile geometry.
    pub fn validate(&self) -> Result<()> {
        let streams = match self {
            Self::OrtCpu(o) => o.num_streams,
            Self::OrtCuda(o) => o.num_streams,
            Self::OvCpu(o) => o.num_streams,
            Self::OvGpu(o) => o.num_streams,
            Self::TensorRt(o) => o.num_streams,
            Self::NcnnVk(o) => o.num_streams,
        };
        if streams == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "{}: num_streams must be at least 1",
                self.kind()
            )));
        }

        if let Self::TensorRt(o) = self {
            if o.workspace_mib == 0 {
                return Err(EngineError::InvalidConfig(
                    "tensorrt: workspace_mib must be at least 1".into(),
                ));
            }
            for (label, shape) in [("max_shapes", o.max_shapes), ("opt_shapes", o.opt_shapes)] {
                if let Some((w, h)) = shape
                    && (w == 0 || h == 0)
                {
                    return Err(EngineError::InvalidConfig(format!(
                        "tensorrt: {label} must be non-zero, got {w}x{h}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What the caller selected: a default marker or a configured instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    Defaults(BackendKind),
    Configured(Backend),
}

impl BackendSelection {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Defaults(kind) => *kind,
            Self::Configured(backend) => backend.kind(),
        }
    }
}

impl From<Backend> for BackendSelection {
    fn from(backend: Backend) -> Self {
        Self::Configured(backend)
    }
}

impl From<BackendKind> for BackendSelection {
    fn from(kind: BackendKind) -> Self {
        Self::Defaults(kind)
    }
}

// ─── Normalized spec ─────────────────────────────────────────────────────────

/// TensorRT options with derived fields resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRtSpec {
    pub options: TensorRtOptions,
    /// Input channel count required by the model.
    pub channels: u32,
    /// Resolved maximum compilation shape `(w, h)`.
    pub max_shapes: (u32, u32),
    /// Resolved optimization shape `(w, h)`.
    pub opt_shapes: (u32, u32),
}

/// Normalized backend configuration for exactly one inference call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    OrtCpu(OrtCpuOptions),
    OrtCuda(OrtCudaOptions),
    OvCpu(OvCpuOptions),
    OvGpu(OvGpuOptions),
    TensorRt(TensorRtSpec),
    NcnnVk(NcnnVkOptions),
}

impl BackendSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::OrtCpu(_) => BackendKind::OrtCpu,
            Self::OrtCuda(_) => BackendKind::OrtCuda,
            Self::OvCpu(_) => BackendKind::OvCpu,
            Self::OvGpu(_) => BackendKind::OvGpu,
            Self::TensorRt(_) => BackendKind::TensorRt,
            Self::NcnnVk(_) => BackendKind::NcnnVk,
        }
    }
}

/// Resolve `selection` into a [`BackendSpec`] for a model with `channels`
/// input channels processed with `geometry`.
///
/// The selection is cloned before any derived field is filled in, so a
/// configuration reused across calls is never mutated.
pub fn normalize(
    selection: &BackendSelection,
    channels: u32,
    geometry: &TileGeometry,
) -> Result<BackendSpec> {
    let backend = match selection {
        BackendSelection::Defaults(kind) => Backend::defaults(*kind),
        BackendSelection::Configured(backend) => backend.clone(),
    };
    backend.validate()?;

    let spec = match backend {
        Backend::OrtCpu(o) => BackendSpec::OrtCpu(o),
        Backend::OrtCuda(o) => BackendSpec::OrtCuda(o),
        Backend::OvCpu(o) => BackendSpec::OvCpu(o),
        Backend::OvGpu(o) => BackendSpec::OvGpu(o),
        Backend::NcnnVk(o) => BackendSpec::NcnnVk(o),
        Backend::TensorRt(options) => {
            BackendSpec::TensorRt(resolve_tensorrt(options, channels, geometry)?)
        }
    };

    debug!(backend = %spec.kind(), channels, tile_w = geometry.tile_w, tile_h = geometry.tile_h, "Backend normalized");
    Ok(spec)
}

fn resolve_tensorrt(
    options: TensorRtOptions,
    channels: u32,
    geometry: &TileGeometry,
) -> Result<TensorRtSpec> {
    if channels == 0 {
        return Err(EngineError::InvalidConfig(
            "tensorrt: model channel count must be at least 1".into(),
        ));
    }
    let tile = geometry.tile();
    let max_shapes = options.max_shapes.unwrap_or(tile);
    let opt_shapes = options.opt_shapes.unwrap_or(max_shapes);

    if tile.0 > max_shapes.0 || tile.1 > max_shapes.1 {
        return Err(EngineError::InvalidConfig(format!(
            "tensorrt: tile {}x{} exceeds max_shapes {}x{}",
            tile.0, tile.1, max_shapes.0, max_shapes.1
        )));
    }
    if opt_shapes.0 > max_shapes.0 || opt_shapes.1 > max_shapes.1 {
        return Err(EngineError::InvalidConfig(format!(
            "tensorrt: opt_shapes {}x{} exceeds max_shapes {}x{}",
            opt_shapes.0, opt_shapes.1, max_shapes.0, max_shapes.1
        )));
    }
    if options.static_shape && max_shapes != tile {
        return Err(EngineError::InvalidConfig(format!(
            "tensorrt: static_shape engines must be built for the tile size {}x{}, got max_shapes {}x{}",
            tile.0, tile.1, max_shapes.0, max_shapes.1
        )));
    }

    Ok(TensorRtSpec {
        options,
        channels,
        max_shapes,
        opt_shapes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(w: u32, h: u32) -> TileGeometry {
        TileGeometry {
            tile_w: w,
            tile_h: h,
            overlap_w: 8,
            overlap_h: 8,
        }
    }

    #[test]
    fn defaults_marker_resolves_to_default_instance() {
        let spec = normalize(
            &BackendSelection::Defaults(BackendKind::OrtCuda),
            3,
            &geometry(256, 256),
        )
        .unwrap();
        assert_eq!(spec, BackendSpec::OrtCuda(OrtCudaOptions::default()));
    }

    #[test]
    fn tensorrt_shapes_default_to_tile_geometry() {
        let spec = normalize(
            &BackendSelection::Defaults(BackendKind::TensorRt),
            3,
            &geometry(492, 544),
        )
        .unwrap();
        let BackendSpec::TensorRt(trt) = spec else {
            panic!("expected tensorrt spec");
        };
        assert_eq!(trt.channels, 3);
        assert_eq!(trt.max_shapes, (492, 544));
        assert_eq!(trt.opt_shapes, (492, 544));
    }

    #[test]
    fn tensorrt_opt_defaults_to_supplied_max() {
        let selection = BackendSelection::Configured(Backend::TensorRt(TensorRtOptions {
            max_shapes: Some((1024, 1024)),
            static_shape: false,
            ..TensorRtOptions::default()
        }));
        let BackendSpec::TensorRt(trt) = normalize(&selection, 4, &geometry(512, 512)).unwrap()
        else {
            panic!("expected tensorrt spec");
        };
        assert_eq!(trt.max_shapes, (1024, 1024));
        assert_eq!(trt.opt_shapes, (1024, 1024));
        assert_eq!(trt.channels, 4);
    }

    #[test]
    fn normalization_never_mutates_caller_config() {
        let selection = BackendSelection::Configured(Backend::TensorRt(TensorRtOptions {
            static_shape: false,
            ..TensorRtOptions::default()
        }));
        let before = selection.clone();
        let a = normalize(&selection, 3, &geometry(256, 256)).unwrap();
        let b = normalize(&selection, 1, &geometry(128, 64)).unwrap();
        assert_eq!(selection, before);
        assert_ne!(a, b);
        let BackendSpec::TensorRt(b) = b else {
            panic!("expected tensorrt spec");
        };
        assert_eq!(b.max_shapes, (128, 64));
        assert_eq!(b.channels, 1);
    }

    #[test]
    fn tile_larger_than_max_shape_is_rejected() {
        let selection = BackendSelection::Configured(Backend::TensorRt(TensorRtOptions {
            max_shapes: Some((256, 256)),
            static_shape: false,
            ..TensorRtOptions::default()
        }));
        let err = normalize(&selection, 3, &geometry(512, 256)).expect_err("tile too large");
        assert!(err.to_string().contains("exceeds max_shapes"));
    }

    #[test]
    fn static_shape_requires_tile_sized_engine() {
        let selection = BackendSelection::Configured(Backend::TensorRt(TensorRtOptions {
            max_shapes: Some((1024, 1024)),
            ..TensorRtOptions::default()
        }));
        let err = normalize(&selection, 3, &geometry(512, 512)).expect_err("static mismatch");
        assert!(err.to_string().contains("static_shape"));
    }

    #[test]
    fn zero_streams_is_a_configuration_error() {
        let selection = BackendSelection::Configured(Backend::OvCpu(OvCpuOptions {
            num_streams: 0,
            ..OvCpuOptions::default()
        }));
        let err = normalize(&selection, 3, &geometry(64, 64)).expect_err("zero streams");
        assert_eq!(err.error_code(), 102);
    }

    #[test]
    fn backend_kind_parses_labels() {
        assert_eq!(BackendKind::parse("TensorRT").unwrap(), BackendKind::TensorRt);
        assert_eq!(BackendKind::parse("tensor_rt").unwrap(), BackendKind::TensorRt);
        assert_eq!(BackendKind::parse("ort_cuda").unwrap(), BackendKind::OrtCuda);
        assert_eq!(BackendKind::parse("ORT-CUDA").unwrap(), BackendKind::OrtCuda);
        assert!(BackendKind::parse("coreml").is_err());
    }

    #[test]
    fn labels_match_serialized_names() {
        for kind in BackendKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.label());
            assert_eq!(kind.to_string(), kind.label());
            assert_eq!(BackendKind::parse(kind.label()).unwrap(), kind);
        }
    }
}
