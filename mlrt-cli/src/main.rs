//! mlrt CLI entrypoint.
//!
//! ```bash
//! mlrt plan --width 1920 --height 1080 --tiles 4 --overlap 8 --multiple 2
//! mlrt engine-path --network model.onnx --tile 960x540 --fp16 --json
//! mlrt build --config run.json --width 1920 --height 1080
//! mlrt patch --network rife.onnx --scale 2
//! mlrt check-config --config run.json --json
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Args, Parser, Subcommand};
use serde_json::{Value, json};

use mlrt_core::backend::TensorRtOptions;
use mlrt_core::error::{EngineError, Result};
use mlrt_core::model::Waifu2xModel;
use mlrt_core::{
    AxisPair, Backend, BackendSelection, BackendSpec, FrameStream, TileGeometry, TileRequest,
    normalize, paths, plan_tiles,
};
use mlrt_onnx::{GraphPatch, persist_patched_graph};
use mlrt_pipeline::{EngineCall, InferenceJob, InferencePipeline, InferenceRuntime, RunConfig};
use mlrt_tensorrt::{EngineBuilder, EngineSource, NamedDevice, TrtExec};

#[derive(Parser, Debug)]
#[command(
    name = "mlrt",
    version,
    about = "Tile planning, engine caching and graph patching for ML inference backends",
    arg_required_else_help = true,
    after_help = "Examples:\n  mlrt plan --width 1920 --height 1080 --tiles 4 --overlap 8 --multiple 2\n  mlrt engine-path --network model.onnx --tile 960x540 --fp16 --json\n  mlrt build --config run.json --width 1920 --height 1080\n  mlrt patch --network rife.onnx --scale 2\n  mlrt check-config --config run.json --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the tile geometry for a frame size.
    Plan(PlanArgs),
    /// Print the cache path of the engine for a network and TensorRT options.
    EnginePath(EnginePathArgs),
    /// Resolve (and compile on a miss) the engine described by a run config.
    Build(BuildArgs),
    /// Write a patched copy of an ONNX graph.
    Patch(PatchArgs),
    /// Validate a run config document.
    CheckConfig(CheckConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    /// Frame width.
    #[arg(long = "width")]
    width: u32,

    /// Frame height.
    #[arg(long = "height")]
    height: u32,

    /// Tile count per axis: `N` or `WxH`.
    #[arg(long = "tiles", value_parser = parse_axis_pair, conflicts_with = "tile_size")]
    tiles: Option<AxisPair>,

    /// Explicit tile size: `N` or `WxH`.
    #[arg(long = "tile-size", value_parser = parse_axis_pair)]
    tile_size: Option<AxisPair>,

    /// Overlap: `N` or `WxH` (model default when omitted).
    #[arg(long = "overlap", value_parser = parse_axis_pair)]
    overlap: Option<AxisPair>,

    /// Spatial alignment of tile sizes.
    #[arg(long = "multiple", default_value_t = 1)]
    multiple: u32,

    /// Built-in waifu2x model supplying alignment and default overlap.
    #[arg(long = "model", value_parser = parse_waifu2x, conflicts_with = "multiple")]
    model: Option<Waifu2xModel>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct EnginePathArgs {
    /// ONNX network path.
    #[arg(short = 'n', long = "network")]
    network: PathBuf,

    /// Tile size the engine is built for: `N` or `WxH`.
    #[arg(long = "tile", value_parser = parse_axis_pair)]
    tile: AxisPair,

    /// Input channels of the network.
    #[arg(long = "channels", default_value_t = 3)]
    channels: u32,

    /// Maximum dynamic shape `WxH` (implies a dynamic engine).
    #[arg(long = "max-shapes", value_parser = parse_axis_pair)]
    max_shapes: Option<AxisPair>,

    /// Optimization shape `WxH` for a dynamic engine.
    #[arg(long = "opt-shapes", value_parser = parse_axis_pair)]
    opt_shapes: Option<AxisPair>,

    #[arg(long = "fp16", default_value_t = false)]
    fp16: bool,

    /// Disable TF32 tensor-core math.
    #[arg(long = "no-tf32", default_value_t = false)]
    no_tf32: bool,

    /// Builder workspace in MiB.
    #[arg(long = "workspace", default_value_t = 128)]
    workspace: u64,

    #[arg(long = "cublas", default_value_t = false)]
    cublas: bool,

    /// CUDA device ordinal.
    #[arg(short = 'd', long = "device", default_value_t = 0)]
    device: u32,

    /// Device name used in the cache key instead of probing.
    #[arg(long = "device-name")]
    device_name: Option<String>,

    /// trtexec binary (defaults to `MLRT_TRTEXEC` or `trtexec` on PATH).
    #[arg(long = "trtexec")]
    trtexec: Option<PathBuf>,

    /// Compiler version used in the cache key instead of querying trtexec.
    #[arg(long = "trt-version")]
    trt_version: Option<String>,

    /// Secondary cache root for read-only network directories.
    #[arg(long = "temp-root")]
    temp_root: Option<PathBuf>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct BuildArgs {
    /// Run config JSON path.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Frame width the engine must serve.
    #[arg(long = "width")]
    width: u32,

    /// Frame height the engine must serve.
    #[arg(long = "height")]
    height: u32,

    /// Device name used in the cache key instead of probing.
    #[arg(long = "device-name")]
    device_name: Option<String>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("patch").required(true).args(["scale", "coefficient_op"])))]
struct PatchArgs {
    /// ONNX network path.
    #[arg(short = 'n', long = "network")]
    network: PathBuf,

    /// Rescale factor for resize/multiplier constants.
    #[arg(long = "scale")]
    scale: Option<f64>,

    /// Operator whose last instance receives an input coefficient.
    #[arg(long = "coefficient-op", requires = "coefficient")]
    coefficient_op: Option<String>,

    /// Coefficient multiplied into the operator input.
    #[arg(long = "coefficient")]
    coefficient: Option<f32>,

    /// Secondary location when the network directory is read-only.
    #[arg(long = "temp-root")]
    temp_root: Option<PathBuf>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct CheckConfigArgs {
    /// Run config JSON path.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Optional frame width; with `--height`, also plans and normalizes.
    #[arg(long = "width", requires = "height")]
    width: Option<u32>,

    #[arg(long = "height", requires = "width")]
    height: Option<u32>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let (command, json) = match &cli.command {
        Commands::Plan(args) => ("plan", args.json),
        Commands::EnginePath(args) => ("engine-path", args.json),
        Commands::Build(args) => ("build", args.json),
        Commands::Patch(args) => ("patch", args.json),
        Commands::CheckConfig(args) => ("check-config", args.json),
    };

    let result = match cli.command {
        Commands::Plan(args) => run_plan(args),
        Commands::EnginePath(args) => run_engine_path(args),
        Commands::Build(args) => run_build(args),
        Commands::Patch(args) => run_patch(args),
        Commands::CheckConfig(args) => run_check_config(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if json {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn parse_axis_pair(value: &str) -> std::result::Result<AxisPair, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid value '{value}': expected N or WxH"))
    };
    match value.split_once(['x', 'X']) {
        Some((w, h)) => Ok(AxisPair::PerAxis(parse(w)?, parse(h)?)),
        None => Ok(AxisPair::Uniform(parse(value)?)),
    }
}

fn parse_waifu2x(value: &str) -> std::result::Result<Waifu2xModel, String> {
    let normalized = value.to_ascii_lowercase().replace('-', "_");
    Waifu2xModel::ALL
        .into_iter()
        .find(|model| model.name() == normalized)
        .ok_or_else(|| {
            let names: Vec<_> = Waifu2xModel::ALL.iter().map(|m| m.name()).collect();
            format!("unknown model '{value}'. Use one of: {}", names.join(", "))
        })
}

fn print_output(json: bool, value: Value, human: String) {
    if json {
        println!("{value}");
    } else {
        println!("{human}");
    }
}

fn command_error_json(command: &str, err: &EngineError) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}

fn geometry_json(geometry: &TileGeometry) -> Value {
    json!({
        "tile": [geometry.tile_w, geometry.tile_h],
        "overlap": [geometry.overlap_w, geometry.overlap_h],
    })
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let (multiple, default_overlap) = match args.model {
        Some(model) => {
            let profile = model.profile();
            (profile.multiple, profile.default_overlap)
        }
        None => (args.multiple, AxisPair::Uniform(0)),
    };
    let overlap = args.overlap.unwrap_or(default_overlap);
    let request = match (args.tiles, args.tile_size) {
        (Some(tiles), _) => TileRequest::Count(tiles),
        (None, Some(size)) => TileRequest::Size(size),
        (None, None) => TileRequest::Whole,
    };

    let geometry = plan_tiles(request, args.width, args.height, multiple, overlap)?;
    geometry.ensure_aligned(multiple)?;

    let mut value = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "plan",
        "ok": true,
        "width": args.width,
        "height": args.height,
        "multiple": multiple,
    });
    value["geometry"] = geometry_json(&geometry);
    print_output(
        args.json,
        value,
        format!(
            "plan: frame={}x{} tile={}x{} overlap={}x{} multiple={}",
            args.width,
            args.height,
            geometry.tile_w,
            geometry.tile_h,
            geometry.overlap_w,
            geometry.overlap_h,
            multiple
        ),
    );
    Ok(())
}

fn run_engine_path(args: EnginePathArgs) -> Result<()> {
    let (tile_w, tile_h) = args.tile.split();
    let geometry = TileGeometry {
        tile_w,
        tile_h,
        overlap_w: 0,
        overlap_h: 0,
    };
    let dynamic = args.max_shapes.is_some() || args.opt_shapes.is_some();
    let options = TensorRtOptions {
        max_shapes: args.max_shapes.map(AxisPair::split),
        opt_shapes: args.opt_shapes.map(AxisPair::split),
        fp16: args.fp16,
        device_id: args.device,
        workspace_mib: args.workspace,
        use_cublas: args.cublas,
        static_shape: !dynamic,
        tf32: !args.no_tf32,
        ..TensorRtOptions::default()
    };
    let selection = BackendSelection::Configured(Backend::TensorRt(options));
    let BackendSpec::TensorRt(spec) = normalize(&selection, args.channels, &geometry)? else {
        return Err(EngineError::InvalidConfig("expected a tensorrt spec".into()));
    };

    let mut trtexec = match &args.trtexec {
        Some(path) => TrtExec::new(path),
        None => TrtExec::from_env(),
    };
    if let Some(version) = &args.trt_version {
        trtexec = trtexec.with_version(version);
    }
    let mut builder = EngineBuilder::new(Arc::new(trtexec))
        .with_temp_root(args.temp_root.unwrap_or_else(paths::default_temp_root));
    if let Some(name) = args.device_name {
        builder = builder.with_device_probe(Arc::new(NamedDevice(name)));
    }

    let key = builder.key(&args.network, &spec)?;
    let cached = builder.lookup(&args.network, &key);
    let path = cached.clone().unwrap_or_else(|| key.engine_path(&args.network));

    print_output(
        args.json,
        json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "engine-path",
            "ok": true,
            "network": args.network.display().to_string(),
            "engine": path.display().to_string(),
            "cached": cached.is_some(),
            "dynamic": key.is_dynamic(),
            "shapes": key.shape_descriptor(),
            "compiler_version": &key.compiler_version,
            "device": &key.device,
        }),
        format!(
            "engine-path: {} cached={}",
            path.display(),
            cached.is_some()
        ),
    );
    Ok(())
}

/// Runtime for commands that prepare calls but never execute them.
struct PrepareOnly;

impl InferenceRuntime for PrepareOnly {
    fn invoke(&self, call: &EngineCall, _inputs: &[FrameStream]) -> Result<FrameStream> {
        Err(EngineError::RuntimeUnavailable(call.backend()))
    }
}

fn run_build(args: BuildArgs) -> Result<()> {
    let config = RunConfig::from_path(&args.config)?;
    let pipeline = InferencePipeline::from_config(&config, Arc::new(PrepareOnly));
    let job = InferenceJob::from_config(&config);
    let prepared = pipeline.prepare(&job, args.width, args.height)?;

    let BackendSpec::TensorRt(spec) = &prepared.spec else {
        return Err(EngineError::InvalidConfig(format!(
            "build requires a tensorrt backend, got {}",
            prepared.spec.kind()
        )));
    };
    let mut builder = config.compiler.engine_builder();
    if let Some(name) = args.device_name {
        builder = builder.with_device_probe(Arc::new(NamedDevice(name)));
    }
    let resolved = builder.resolve(&prepared.context.network, spec)?;
    let compiled = resolved.source == EngineSource::Compiled;

    let mut value = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "build",
        "ok": true,
        "engine": resolved.path.display().to_string(),
        "compiled": compiled,
        "shapes": resolved.key.shape_descriptor(),
    });
    value["geometry"] = geometry_json(&prepared.context.geometry);
    print_output(
        args.json,
        value,
        format!(
            "build: {} ({})",
            resolved.path.display(),
            if compiled { "compiled" } else { "cached" }
        ),
    );
    Ok(())
}

fn run_patch(args: PatchArgs) -> Result<()> {
    let patch = match (args.scale, args.coefficient_op, args.coefficient) {
        (Some(scale), _, _) => GraphPatch::scale(scale),
        (None, Some(op_type), Some(coefficient)) => GraphPatch::coefficient(op_type, coefficient),
        _ => {
            return Err(EngineError::InvalidConfig(
                "patch needs --scale or --coefficient-op with --coefficient".into(),
            ));
        }
    };

    let original = std::fs::read(&args.network).map_err(|err| EngineError::io(&args.network, err))?;
    let patched = patch.apply(&original)?;
    let temp_root = args.temp_root.unwrap_or_else(paths::default_temp_root);
    let tag = patch.tag();
    let written = persist_patched_graph(&args.network, &tag, &patched, &temp_root)?;

    print_output(
        args.json,
        json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "patch",
            "ok": true,
            "tag": tag,
            "output": written.display().to_string(),
            "bytes": patched.len(),
        }),
        format!("patch: {} -> {}", tag, written.display()),
    );
    Ok(())
}

fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = RunConfig::from_path(&args.config)?;
    let fallback = config.fallback.as_ref().map(|f| f.kind().to_string());
    let patch = config.patch.as_ref().map(|p| p.to_patch().tag());

    let mut value = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "check-config",
        "ok": true,
        "config_schema_version": config.config_schema_version,
        "model": &config.model.name,
        "backend": config.backend.kind().to_string(),
        "fallback": fallback,
        "patch": patch,
    });
    let mut human = format!(
        "check-config: ok model={} backend={} fallback={}",
        config.model.name,
        config.backend.kind(),
        fallback.as_deref().unwrap_or("none")
    );

    if let (Some(width), Some(height)) = (args.width, args.height) {
        let overlap = config.model.resolve_overlap(config.overlap);
        let geometry = plan_tiles(config.tiles, width, height, config.model.multiple, overlap)?;
        geometry.ensure_aligned(config.model.multiple)?;
        let spec = normalize(&config.backend, config.model.channels, &geometry)?;
        value["geometry"] = geometry_json(&geometry);
        value["spec"] = serde_json::to_value(&spec)
            .map_err(|err| EngineError::InvalidConfig(format!("Cannot serialize spec: {err}")))?;
        human.push_str(&format!(
            " tile={}x{} overlap={}x{}",
            geometry.tile_w, geometry.tile_h, geometry.overlap_w, geometry.overlap_h
        ));
    }

    print_output(args.json, value, human);
    Ok(())
}
