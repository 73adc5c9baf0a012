//! End-to-end inference flow for one call:
//! plan tiles → check alignment → normalize backend → patch graph →
//! (compile) → dispatch with fallback.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use mlrt_core::error::{EngineError, Result};
use mlrt_core::types::check_streams;
use mlrt_core::{
    AxisPair, BackendSelection, BackendSpec, FrameStream, ModelProfile, NetworkArtifact,
    TileGeometry, TileRequest, normalize, paths, plan_tiles,
};
use mlrt_onnx::{GraphPatch, persist_patched_graph};

use crate::config::RunConfig;
use crate::dispatch::{CallContext, InferenceDispatcher, InferenceRuntime};

/// What to run, independent of the frames.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceJob {
    pub network: NetworkArtifact,
    pub model: ModelProfile,
    pub tiles: TileRequest,
    pub overlap: Option<AxisPair>,
    pub backend: BackendSelection,
    pub patch: Option<GraphPatch>,
}

impl InferenceJob {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            network: NetworkArtifact::Path(config.network.clone()),
            model: config.model.clone(),
            tiles: config.tiles,
            overlap: config.overlap,
            backend: config.backend.clone(),
            patch: config.patch.as_ref().map(|p| p.to_patch()),
        }
    }
}

/// A job resolved for a concrete frame size, ready to dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedCall {
    pub spec: BackendSpec,
    pub context: CallContext,
}

pub struct InferencePipeline {
    dispatcher: InferenceDispatcher,
    temp_root: PathBuf,
}

impl InferencePipeline {
    pub fn new(dispatcher: InferenceDispatcher) -> Self {
        Self {
            dispatcher,
            temp_root: paths::default_temp_root(),
        }
    }

    /// Dispatcher with fallback and `trtexec` engine builder from `config`.
    pub fn from_config(config: &RunConfig, runtime: Arc<dyn InferenceRuntime>) -> Self {
        let dispatcher = InferenceDispatcher::new(runtime)
            .with_engine_builder(Arc::new(config.compiler.engine_builder()))
            .with_fallback(config.fallback.clone());
        Self::new(dispatcher).with_temp_root(config.compiler.temp_root())
    }

    /// Where patched graphs go when the network directory is read-only.
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn dispatcher(&self) -> &InferenceDispatcher {
        &self.dispatcher
    }

    /// Plan, validate, normalize and patch for a `width`×`height` input.
    pub fn prepare(&self, job: &InferenceJob, width: u32, height: u32) -> Result<PreparedCall> {
        let overlap = job.model.resolve_overlap(job.overlap);
        let geometry = plan_tiles(job.tiles, width, height, job.model.multiple, overlap)?;
        geometry.ensure_aligned(job.model.multiple)?;

        let spec = normalize(&job.backend, job.model.channels, &geometry)?;
        let network = match &job.patch {
            Some(patch) => self.patched_network(job, patch, &spec)?,
            None => job.network.clone(),
        };

        Ok(PreparedCall {
            spec,
            context: CallContext {
                network,
                geometry,
                channels: job.model.channels,
            },
        })
    }

    fn patched_network(
        &self,
        job: &InferenceJob,
        patch: &GraphPatch,
        spec: &BackendSpec,
    ) -> Result<NetworkArtifact> {
        let original = job.network.load()?;
        let patched = patch.apply(&original)?;

        let needs_path = spec.kind().requires_compilation()
            || self
                .dispatcher
                .fallback()
                .is_some_and(|f| f.kind().requires_compilation());
        if !needs_path {
            return Ok(NetworkArtifact::from(patched));
        }

        let base = match job.network.path() {
            Some(path) => path.to_path_buf(),
            None => {
                std::fs::create_dir_all(&self.temp_root)
                    .map_err(|err| EngineError::io(&self.temp_root, err))?;
                self.temp_root.join("network.onnx")
            }
        };
        let written = persist_patched_graph(&base, &patch.tag(), &patched, &self.temp_root)?;
        Ok(NetworkArtifact::Path(written))
    }

    /// Run `job` over `inputs`.
    pub fn run(&self, job: &InferenceJob, inputs: &[FrameStream]) -> Result<FrameStream> {
        let (width, height) = check_streams(inputs)?;
        let prepared = self.prepare(job, width, height)?;
        let TileGeometry {
            tile_w,
            tile_h,
            overlap_w,
            overlap_h,
        } = prepared.context.geometry;
        info!(
            model = %job.model.name,
            backend = %prepared.spec.kind(),
            width,
            height,
            tile_w,
            tile_h,
            overlap_w,
            overlap_h,
            frames = inputs[0].len(),
            "Dispatching inference"
        );
        self.dispatcher
            .dispatch(&prepared.spec, &prepared.context, inputs)
    }
}
