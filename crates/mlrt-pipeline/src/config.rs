//! Versioned JSON run configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mlrt_core::error::{EngineError, Result};
use mlrt_core::{AxisPair, BackendSelection, ModelProfile, TileRequest, paths};
use mlrt_onnx::GraphPatch;
use mlrt_tensorrt::{BuildMode, EngineBuilder, TrtExec};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Graph patch as written in a config file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchConfig {
    Scale(f64),
    Coefficient { op_type: String, value: f32 },
}

impl PatchConfig {
    pub fn to_patch(&self) -> GraphPatch {
        match self {
            Self::Scale(scale) => GraphPatch::scale(*scale),
            Self::Coefficient { op_type, value } => GraphPatch::coefficient(op_type.clone(), *value),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildModeConfig {
    #[default]
    BuildOnly,
    BuildAndBenchmark,
}

impl From<BuildModeConfig> for BuildMode {
    fn from(mode: BuildModeConfig) -> Self {
        match mode {
            BuildModeConfig::BuildOnly => BuildMode::BuildOnly,
            BuildModeConfig::BuildAndBenchmark => BuildMode::BuildAndBenchmark,
        }
    }
}

/// External compiler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// `trtexec` binary; `MLRT_TRTEXEC` or `PATH` when unset.
    pub trtexec: Option<PathBuf>,
    /// Skip version detection and use this string in cache keys.
    pub version: Option<String>,
    pub timing_cache: Option<PathBuf>,
    pub build_mode: BuildModeConfig,
    /// Secondary cache location; `<system temp>/mlrt` when unset.
    pub temp_root: Option<PathBuf>,
    /// Name of the network's image input.
    pub input_name: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            trtexec: None,
            version: None,
            timing_cache: None,
            build_mode: BuildModeConfig::default(),
            temp_root: None,
            input_name: "input".into(),
        }
    }
}

impl CompilerConfig {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(paths::default_temp_root)
    }

    pub fn trtexec(&self) -> TrtExec {
        let mut trtexec = match &self.trtexec {
            Some(path) => TrtExec::new(path),
            None => TrtExec::from_env(),
        };
        if let Some(cache) = &self.timing_cache {
            trtexec = trtexec.with_timing_cache(cache);
        }
        if let Some(version) = &self.version {
            trtexec = trtexec.with_version(version);
        }
        trtexec
    }

    pub fn engine_builder(&self) -> EngineBuilder {
        EngineBuilder::new(Arc::new(self.trtexec()))
            .with_temp_root(self.temp_root())
            .with_mode(self.build_mode.into())
            .with_input_name(&self.input_name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub config_schema_version: u32,
    pub network: PathBuf,
    pub model: ModelProfile,
    #[serde(default)]
    pub tiles: TileRequest,
    /// Overrides the model's default overlap.
    #[serde(default)]
    pub overlap: Option<AxisPair>,
    pub backend: BackendSelection,
    #[serde(default)]
    pub fallback: Option<BackendSelection>,
    #[serde(default)]
    pub patch: Option<PatchConfig>,
    #[serde(default)]
    pub compiler: CompilerConfig,
}

impl RunConfig {
    pub fn new(network: impl Into<PathBuf>, model: ModelProfile, backend: BackendSelection) -> Self {
        Self {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            network: network.into(),
            model,
            tiles: TileRequest::default(),
            overlap: None,
            backend,
            fallback: None,
            patch: None,
            compiler: CompilerConfig::default(),
        }
    }

    /// Parse a config document, checking the schema version before decoding.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::InvalidConfig(format!("Invalid run config JSON: {err}")))?;

        let Some(version_value) = value.get("config_schema_version") else {
            return Err(EngineError::InvalidConfig(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::InvalidConfig(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != CONFIG_SCHEMA_VERSION as u64 {
            return Err(EngineError::InvalidConfig(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {version}"
            )));
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|err| EngineError::InvalidConfig(format!("Invalid run config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| EngineError::io(path, err))?;
        Self::from_json_str(&data)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| EngineError::InvalidConfig(format!("Cannot serialize run config: {err}")))
    }

    /// Structural checks; nothing is normalized here.
    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(EngineError::InvalidConfig(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {}",
                self.config_schema_version
            )));
        }
        if self.model.channels == 0 || self.model.multiple == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "model '{}': channels and multiple must be at least 1",
                self.model.name
            )));
        }
        for selection in std::iter::once(&self.backend).chain(self.fallback.as_ref()) {
            if let BackendSelection::Configured(backend) = selection {
                backend.validate()?;
            }
        }
        if let Some(PatchConfig::Scale(scale)) = &self.patch
            && (!scale.is_finite() || *scale <= 0.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "patch scale must be a positive finite number, got {scale}"
            )));
        }
        if self.compiler.input_name.is_empty() {
            return Err(EngineError::InvalidConfig(
                "compiler.input_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}
