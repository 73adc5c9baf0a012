//! On-disk engine cache.
//!
//! A request is a hit when the engine for its key is readable at the
//! primary path (next to the network) or at that path's temp mirror. On a
//! double miss the engine is compiled under [`CompileLock`] into
//! `<target>.partial` and renamed into place, so readers never observe a
//! truncated engine. The cache is unbounded and never evicts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use mlrt_core::error::{EngineError, Result};
use mlrt_core::{BackendKind, NetworkArtifact, TensorRtSpec, paths};

use crate::cache_key::EngineCacheKey;
use crate::compiler::{BuildMode, CompileRequest, EngineCompiler};
use crate::device::{DeviceProbe, default_probe, device_identifier};
use crate::lock::CompileLock;

/// Where a resolved engine came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineSource {
    Cached,
    Compiled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEngine {
    pub path: PathBuf,
    pub key: EngineCacheKey,
    pub source: EngineSource,
}

/// Resolves (and on a miss compiles) engines for normalized TensorRT specs.
pub struct EngineBuilder {
    compiler: Arc<dyn EngineCompiler>,
    probe: Arc<dyn DeviceProbe>,
    temp_root: PathBuf,
    lock: CompileLock,
    mode: BuildMode,
    input_name: String,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("temp_root", &self.temp_root)
            .field("mode", &self.mode)
            .field("input_name", &self.input_name)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    pub fn new(compiler: Arc<dyn EngineCompiler>) -> Self {
        let temp_root = paths::default_temp_root();
        Self {
            compiler,
            probe: Arc::from(default_probe()),
            lock: CompileLock::new(&temp_root),
            temp_root,
            mode: BuildMode::default(),
            input_name: "input".into(),
        }
    }

    pub fn with_device_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Root of the secondary cache location and of the lock files.
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self.lock = CompileLock::new(&self.temp_root);
        self
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Cache key for `network` under `spec`. Reads the network and queries
    /// the compiler version, but never compiles.
    pub fn key(&self, network: &Path, spec: &TensorRtSpec) -> Result<EngineCacheKey> {
        let bytes = std::fs::read(network).map_err(|err| EngineError::io(network, err))?;
        let version = self.compiler.version()?;
        let device = device_identifier(self.probe.as_ref(), spec.options.device_id);
        Ok(EngineCacheKey::new(&bytes, spec, &version, &device))
    }

    /// Readable cached engine for `key`: primary first, then the mirror.
    pub fn lookup(&self, network: &Path, key: &EngineCacheKey) -> Option<PathBuf> {
        let primary = key.engine_path(network);
        let secondary = paths::temp_mirror(&self.temp_root, &primary);
        [primary, secondary]
            .into_iter()
            .find(|candidate| paths::is_readable(candidate))
    }

    /// Return a ready engine for `network`, compiling it on a cache miss.
    pub fn resolve(&self, network: &NetworkArtifact, spec: &TensorRtSpec) -> Result<ResolvedEngine> {
        let Some(network) = network.path() else {
            return Err(EngineError::UnsupportedArtifact {
                backend: BackendKind::TensorRt,
            });
        };
        let key = self.key(network, spec)?;

        if let Some(path) = self.lookup(network, &key) {
            debug!(engine = %path.display(), "Engine cache hit");
            return Ok(ResolvedEngine {
                path,
                key,
                source: EngineSource::Cached,
            });
        }

        let primary = key.engine_path(network);
        let target = paths::writable_location(&primary, &self.temp_root)?;

        self.lock.with_lock(&target, || {
            // Another thread or process may have finished while we waited.
            if let Some(path) = self.lookup(network, &key) {
                debug!(engine = %path.display(), "Engine appeared while waiting for lock");
                return Ok(ResolvedEngine {
                    path,
                    key: key.clone(),
                    source: EngineSource::Cached,
                });
            }
            self.compile(network, spec, &target)?;
            Ok(ResolvedEngine {
                path: target.clone(),
                key: key.clone(),
                source: EngineSource::Compiled,
            })
        })
    }

    fn compile(&self, network: &Path, spec: &TensorRtSpec, target: &Path) -> Result<()> {
        let mut partial = target.as_os_str().to_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let started = Instant::now();
        let request = CompileRequest {
            network,
            output: &partial,
            spec,
            input_name: &self.input_name,
            mode: self.mode,
        };
        if let Err(err) = self.compiler.compile(&request) {
            let _ = std::fs::remove_file(&partial);
            return Err(err);
        }
        if !partial.is_file() {
            return Err(EngineError::CompileFailed {
                message: format!("compiler produced no engine at {}", partial.display()),
                log: None,
            });
        }
        std::fs::rename(&partial, target).map_err(|err| EngineError::io(target, err))?;
        info!(
            engine = %target.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Engine compiled"
        );
        Ok(())
    }
}
