use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use mlrt_core::backend::{Backend, TensorRtOptions};
use mlrt_core::error::{EngineError, Result};
use mlrt_core::{
    AxisPair, BackendKind, BackendSelection, FrameStream, ModelProfile, NetworkArtifact,
    PlanarFrame, TileRequest,
};
use mlrt_onnx::proto::{GraphProto, ModelProto, NodeProto, TensorProto};
use mlrt_onnx::patch::read_values;
use mlrt_onnx::{GraphPatch, Message};
use mlrt_pipeline::{EngineCall, InferenceDispatcher, InferenceJob, InferencePipeline, InferenceRuntime};
use mlrt_tensorrt::{CompileRequest, EngineBuilder, EngineCompiler, NamedDevice};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "mlrt_pipeline_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<EngineCall>>,
}

impl InferenceRuntime for RecordingRuntime {
    fn invoke(&self, call: &EngineCall, inputs: &[FrameStream]) -> Result<FrameStream> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(inputs[0].clone())
    }
}

#[derive(Default)]
struct StubCompiler {
    compiled: Mutex<Vec<PathBuf>>,
    calls: AtomicUsize,
}

impl EngineCompiler for StubCompiler {
    fn version(&self) -> Result<String> {
        Ok("10003".into())
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.compiled.lock().unwrap().push(request.network.to_path_buf());
        std::fs::write(request.output, b"engine").map_err(|e| EngineError::io(request.output, e))
    }
}

/// Resize and multiplier constants hold their own 1-based ordinal, so every
/// rewritten value identifies the rule applied to it.
fn rife_like_graph() -> Vec<u8> {
    let mut nodes = Vec::new();
    for i in 1..=11 {
        let v = i as f32;
        nodes.push(NodeProto::constant(
            format!("onnx::Resize_{i}"),
            TensorProto::from_f32("", &[4], &[1.0, 1.0, v, v]),
        ));
    }
    for i in 1..=7 {
        nodes.push(NodeProto::constant(
            format!("onnx::Mul_{i}"),
            TensorProto::from_f32("", &[], &[i as f32]),
        ));
    }
    ModelProto {
        ir_version: Some(8),
        graph: Some(GraphProto {
            node: nodes,
            ..GraphProto::default()
        }),
        ..ModelProto::default()
    }
    .encode_to_vec()
}

/// `(resize spatial values, multiplier values)` in graph order.
fn rewritten_constants(bytes: &[u8]) -> (Vec<f64>, Vec<f64>) {
    let model = ModelProto::decode_bytes(bytes).unwrap();
    let mut resize = Vec::new();
    let mut mul = Vec::new();
    for node in &model.graph.unwrap().node {
        let Some(tensor) = node.constant_value() else {
            continue;
        };
        let values = read_values(tensor).unwrap();
        if node.output[0].starts_with("onnx::Resize") {
            assert_eq!(values[..2], [1.0, 1.0]);
            assert_eq!(values[2], values[3]);
            resize.push(values[2]);
        } else {
            mul.extend(values);
        }
    }
    (resize, mul)
}

fn frames(width: u32, height: u32) -> Vec<FrameStream> {
    let frame = PlanarFrame::new(width, height, 3, vec![0.25; (width * height * 3) as usize]).unwrap();
    vec![FrameStream::new(vec![frame.clone()]), FrameStream::new(vec![frame])]
}

fn engine_builder(compiler: Arc<StubCompiler>, dir: &Path) -> Arc<EngineBuilder> {
    Arc::new(
        EngineBuilder::new(compiler)
            .with_device_probe(Arc::new(NamedDevice("Test GPU".into())))
            .with_temp_root(dir.join("tmp")),
    )
}

#[test]
fn prepare_plans_tiles_and_resolves_shapes() {
    let pipeline = InferencePipeline::new(InferenceDispatcher::new(Arc::new(RecordingRuntime::default())));
    let job = InferenceJob {
        network: NetworkArtifact::Path("/models/x.onnx".into()),
        model: ModelProfile::new("x", 3, 2).unwrap().with_default_overlap(8),
        tiles: TileRequest::Count(AxisPair::Uniform(4)),
        overlap: None,
        backend: BackendSelection::Defaults(BackendKind::TensorRt),
        patch: None,
    };
    let prepared = pipeline.prepare(&job, 1920, 1080).unwrap();
    assert_eq!(prepared.context.geometry.tile(), (492, 282));
    let mlrt_core::BackendSpec::TensorRt(trt) = prepared.spec else {
        panic!("expected tensorrt spec");
    };
    assert_eq!(trt.max_shapes, (492, 282));
}

#[test]
fn misaligned_explicit_tile_fails_before_dispatch() {
    let runtime = Arc::new(RecordingRuntime::default());
    let pipeline = InferencePipeline::new(InferenceDispatcher::new(runtime.clone()));
    let job = InferenceJob {
        network: NetworkArtifact::from(vec![0]),
        model: ModelProfile::new("cunet", 3, 4).unwrap(),
        tiles: TileRequest::Size(AxisPair::Uniform(510)),
        overlap: None,
        backend: BackendSelection::Defaults(BackendKind::OrtCpu),
        patch: None,
    };
    let err = pipeline.run(&job, &frames(1024, 1024)).expect_err("510 % 4 != 0");
    assert!(matches!(err, EngineError::AlignmentViolation { .. }));
    assert!(runtime.calls.lock().unwrap().is_empty());
}

#[test]
fn patched_graph_is_persisted_for_tensorrt_and_compiled_once() {
    let dir = unique_temp_dir("trt");
    let network = dir.join("rife.onnx");
    std::fs::write(&network, rife_like_graph()).unwrap();

    let compiler = Arc::new(StubCompiler::default());
    let runtime = Arc::new(RecordingRuntime::default());
    let dispatcher = InferenceDispatcher::new(runtime.clone())
        .with_engine_builder(engine_builder(compiler.clone(), &dir));
    let pipeline = InferencePipeline::new(dispatcher).with_temp_root(dir.join("tmp"));

    let job = InferenceJob {
        network: NetworkArtifact::Path(network.clone()),
        model: ModelProfile::new("rife", 6, 32).unwrap(),
        tiles: TileRequest::Whole,
        overlap: None,
        backend: BackendSelection::Configured(Backend::TensorRt(TensorRtOptions {
            fp16: true,
            ..TensorRtOptions::default()
        })),
        patch: Some(GraphPatch::scale(2.0)),
    };

    pipeline.run(&job, &frames(64, 32)).unwrap();
    pipeline.run(&job, &frames(64, 32)).unwrap();

    let patched = dir.join("rife_scale2.onnx");
    let (resize, mul) = rewritten_constants(&std::fs::read(&patched).unwrap());
    assert_eq!(resize, [2.0, 1.0, 6.0, 8.0, 2.5, 12.0, 14.0, 4.0, 18.0, 20.0, 5.5]);
    assert_eq!(mul, [0.5, 4.0, 1.5, 8.0, 2.5, 12.0, 3.5]);
    assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(compiler.compiled.lock().unwrap()[0], patched);

    let calls = runtime.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let EngineCall::TensorRt { engine, .. } = &calls[0] else {
        panic!("expected tensorrt contract");
    };
    let name = engine.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("rife_scale2.onnx.64x32_fp16_workspace128_10003_Test-GPU_"), "{name}");
    assert!(name.ends_with(".engine"));
    drop(calls);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn patched_graph_stays_in_memory_for_onnx_runtime() {
    let dir = unique_temp_dir("ort");
    let network = dir.join("rife.onnx");
    std::fs::write(&network, rife_like_graph()).unwrap();

    let runtime = Arc::new(RecordingRuntime::default());
    let pipeline = InferencePipeline::new(InferenceDispatcher::new(runtime.clone()))
        .with_temp_root(dir.join("tmp"));
    let job = InferenceJob {
        network: NetworkArtifact::Path(network),
        model: ModelProfile::new("rife", 6, 32).unwrap(),
        tiles: TileRequest::Whole,
        overlap: None,
        backend: BackendSelection::Defaults(BackendKind::OrtCuda),
        patch: Some(GraphPatch::scale(0.5)),
    };
    pipeline.run(&job, &frames(64, 64)).unwrap();

    let calls = runtime.calls.lock().unwrap();
    let EngineCall::Ort { network, .. } = &calls[0] else {
        panic!("expected ort contract");
    };
    assert!(!network.is_path());
    assert!(!dir.join("rife_scale0_5.onnx").exists());
    let (resize, mul) = rewritten_constants(&network.load().unwrap());
    assert_eq!(resize, [0.5, 4.0, 1.5, 2.0, 10.0, 3.0, 3.5, 16.0, 4.5, 5.0, 22.0]);
    assert_eq!(mul, [2.0, 1.0, 6.0, 2.0, 10.0, 3.0, 14.0]);
    drop(calls);
    let _ = std::fs::remove_dir_all(dir);
}
