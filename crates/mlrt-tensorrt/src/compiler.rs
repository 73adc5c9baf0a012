//! External engine compilation.
//!
//! [`EngineCompiler`] is the seam the cache compiles through. [`TrtExec`]
//! drives NVIDIA's `trtexec` as a blocking subprocess; its diagnostic log
//! goes to `MLRT_TRTEXEC_LOG` when set (always kept) or to a generated temp
//! file that is removed on success and kept on failure.

use std::env;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use mlrt_core::TensorRtSpec;
use mlrt_core::error::{EngineError, Result};

/// Whether the compiler only builds or also benchmarks the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildMode {
    #[default]
    BuildOnly,
    BuildAndBenchmark,
}

/// One compilation job. The compiler must leave a complete engine at
/// `output` or return an error.
#[derive(Clone, Copy, Debug)]
pub struct CompileRequest<'a> {
    pub network: &'a Path,
    pub output: &'a Path,
    pub spec: &'a TensorRtSpec,
    /// Name of the network's image input tensor.
    pub input_name: &'a str,
    pub mode: BuildMode,
}

pub trait EngineCompiler: Send + Sync {
    /// Version string folded into cache keys.
    fn version(&self) -> Result<String>;

    fn compile(&self, request: &CompileRequest<'_>) -> Result<()>;
}

/// `trtexec` subprocess compiler.
#[derive(Debug)]
pub struct TrtExec {
    binary: PathBuf,
    timing_cache: Option<PathBuf>,
    version: OnceLock<String>,
}

impl TrtExec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timing_cache: None,
            version: OnceLock::new(),
        }
    }

    /// `MLRT_TRTEXEC` if set, else `trtexec` from `PATH`.
    pub fn from_env() -> Self {
        Self::new(env::var_os("MLRT_TRTEXEC").unwrap_or_else(|| "trtexec".into()))
    }

    pub fn with_timing_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.timing_cache = Some(path.into());
        self
    }

    /// Skip `--help` detection and use a known version string.
    pub fn with_version(self, version: impl Into<String>) -> Self {
        let _ = self.version.set(version.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Command-line arguments for `request`.
    pub fn arguments(&self, request: &CompileRequest<'_>) -> Vec<String> {
        let spec = request.spec;
        let options = &spec.options;
        let input = request.input_name;
        let channels = spec.channels;
        let shape = |(w, h): (u32, u32)| format!("{input}:1x{channels}x{h}x{w}");

        let mut args = vec![
            format!("--onnx={}", request.network.display()),
            format!("--saveEngine={}", request.output.display()),
        ];
        if options.static_shape {
            args.push(format!("--shapes={}", shape(spec.max_shapes)));
        } else {
            args.push(format!("--minShapes={}", shape((1, 1))));
            args.push(format!("--optShapes={}", shape(spec.opt_shapes)));
            args.push(format!("--maxShapes={}", shape(spec.max_shapes)));
        }
        args.push(format!("--memPoolSize=workspace:{}", options.workspace_mib));
        if options.fp16 {
            args.push("--fp16".into());
        }
        if !options.tf32 {
            args.push("--noTF32".into());
        }
        if options.use_cuda_graph {
            args.push("--useCudaGraph".into());
        }
        args.push(if options.use_cublas {
            "--tacticSources=+CUBLAS,+CUBLAS_LT".into()
        } else {
            "--tacticSources=-CUBLAS,-CUBLAS_LT".into()
        });
        args.push(format!("--device={}", options.device_id));
        if let Some(cache) = &self.timing_cache {
            args.push(format!("--timingCacheFile={}", cache.display()));
        }
        if options.verbose {
            args.push("--verbose".into());
        }
        if request.mode == BuildMode::BuildOnly {
            args.push("--skipInference".into());
        }
        args
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        if err.kind() == ErrorKind::NotFound {
            EngineError::CompilerUnavailable(format!(
                "'{}' not found; install TensorRT or set MLRT_TRTEXEC",
                self.binary.display()
            ))
        } else {
            EngineError::io(&self.binary, err)
        }
    }
}

impl EngineCompiler for TrtExec {
    fn version(&self) -> Result<String> {
        if let Some(version) = self.version.get() {
            return Ok(version.clone());
        }
        let output = Command::new(&self.binary)
            .arg("--help")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| self.spawn_error(err))?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let version = parse_version(&text).ok_or_else(|| {
            EngineError::CompilerUnavailable(format!(
                "could not read a TensorRT version from '{} --help'",
                self.binary.display()
            ))
        })?;
        debug!(version = %version, "Detected trtexec version");
        Ok(self.version.get_or_init(|| version).clone())
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<()> {
        let args = self.arguments(request);
        let log = LogTarget::resolve(request.spec.options.log);
        info!(
            binary = %self.binary.display(),
            network = %request.network.display(),
            log = ?log.path(),
            "Running trtexec"
        );
        debug!(args = ?args, "trtexec arguments");

        let (stdout, stderr) = log.stdio()?;
        let status = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|err| self.spawn_error(err))?;

        if !status.success() {
            return Err(EngineError::CompileFailed {
                message: format!("trtexec exited with {status}"),
                log: log.path().map(Path::to_path_buf),
            });
        }
        if !request.output.is_file() {
            return Err(EngineError::CompileFailed {
                message: format!(
                    "trtexec succeeded but wrote no engine at {}",
                    request.output.display()
                ),
                log: log.path().map(Path::to_path_buf),
            });
        }
        log.finish_success();
        Ok(())
    }
}

/// Where compiler output goes.
#[derive(Debug)]
enum LogTarget {
    /// `MLRT_TRTEXEC_LOG`; never deleted.
    Requested(PathBuf),
    /// Generated temp file; deleted after a successful build.
    Temporary(PathBuf),
    Discard,
}

impl LogTarget {
    fn resolve(keep_log: bool) -> Self {
        if let Some(path) = env::var_os("MLRT_TRTEXEC_LOG") {
            return Self::Requested(PathBuf::from(path));
        }
        if !keep_log {
            return Self::Discard;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self::Temporary(env::temp_dir().join(format!(
            "trtexec_{}_{nanos}.log",
            std::process::id()
        )))
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::Requested(path) | Self::Temporary(path) => Some(path),
            Self::Discard => None,
        }
    }

    fn stdio(&self) -> Result<(Stdio, Stdio)> {
        let Some(path) = self.path() else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let file = File::create(path).map_err(|err| EngineError::io(path, err))?;
        let clone = file.try_clone().map_err(|err| EngineError::io(path, err))?;
        Ok((Stdio::from(file), Stdio::from(clone)))
    }

    fn finish_success(&self) {
        if let Self::Temporary(path) = self
            && let Err(err) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %err, "Failed to remove trtexec log");
        }
    }
}

/// Extract the version digits from text such as `[TensorRT v8601]`.
pub fn parse_version(text: &str) -> Option<String> {
    let start = text.find("TensorRT v")? + "TensorRT v".len();
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (!digits.is_empty()).then_some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlrt_core::backend::TensorRtOptions;

    fn spec(options: TensorRtOptions) -> TensorRtSpec {
        TensorRtSpec {
            options,
            channels: 3,
            max_shapes: (640, 360),
            opt_shapes: (320, 180),
        }
    }

    fn args_for(options: TensorRtOptions, mode: BuildMode) -> Vec<String> {
        let spec = spec(options);
        let request = CompileRequest {
            network: Path::new("/models/x.onnx"),
            output: Path::new("/models/x.onnx.engine.partial"),
            spec: &spec,
            input_name: "input",
            mode,
        };
        TrtExec::new("trtexec").with_version("8601").arguments(&request)
    }

    #[test]
    fn version_is_parsed_from_banner() {
        let banner = "&&&& RUNNING TensorRT.trtexec [TensorRT v8601] # trtexec --help";
        assert_eq!(parse_version(banner).as_deref(), Some("8601"));
        assert_eq!(parse_version("no banner here"), None);
    }

    #[test]
    fn static_build_uses_exact_shape() {
        let args = args_for(TensorRtOptions::default(), BuildMode::BuildOnly);
        assert!(args.contains(&"--shapes=input:1x3x360x640".to_string()));
        assert!(args.contains(&"--memPoolSize=workspace:128".to_string()));
        assert!(args.contains(&"--tacticSources=-CUBLAS,-CUBLAS_LT".to_string()));
        assert!(args.contains(&"--skipInference".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--minShapes")));
    }

    #[test]
    fn dynamic_build_with_flags() {
        let args = args_for(
            TensorRtOptions {
                static_shape: false,
                fp16: true,
                tf32: false,
                use_cublas: true,
                use_cuda_graph: true,
                device_id: 1,
                ..TensorRtOptions::default()
            },
            BuildMode::BuildAndBenchmark,
        );
        for expected in [
            "--minShapes=input:1x3x1x1",
            "--optShapes=input:1x3x180x320",
            "--maxShapes=input:1x3x360x640",
            "--fp16",
            "--noTF32",
            "--useCudaGraph",
            "--tacticSources=+CUBLAS,+CUBLAS_LT",
            "--device=1",
        ] {
            assert!(args.contains(&expected.to_string()), "missing {expected}: {args:?}");
        }
        assert!(!args.contains(&"--skipInference".to_string()));
    }

    #[test]
    fn missing_binary_is_compiler_unavailable() {
        let compiler = TrtExec::new("/nonexistent/mlrt/trtexec");
        let err = compiler.version().expect_err("binary is missing");
        assert_eq!(err.error_code(), 302);
    }
}
