use std::io;
use std::sync::{Arc, Mutex};

use mlrt_core::error::{EngineError, Result};
use mlrt_core::{
    BackendKind, BackendSelection, FrameStream, NetworkArtifact, PlanarFrame, TileGeometry,
    normalize,
};
use mlrt_pipeline::{CallContext, EngineCall, InferenceDispatcher, InferenceRuntime};

/// Fails for the listed kinds and answers every other call with a frame
/// filled with `marker`.
struct StubRuntime {
    failing: Vec<BackendKind>,
    marker: f32,
    calls: Mutex<Vec<BackendKind>>,
}

impl StubRuntime {
    fn new(failing: &[BackendKind]) -> Self {
        Self {
            failing: failing.to_vec(),
            marker: 7.0,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<BackendKind> {
        self.calls.lock().unwrap().clone()
    }
}

impl InferenceRuntime for StubRuntime {
    fn invoke(&self, call: &EngineCall, inputs: &[FrameStream]) -> Result<FrameStream> {
        let backend = call.backend();
        self.calls.lock().unwrap().push(backend);
        if self.failing.contains(&backend) {
            return Err(EngineError::Inference {
                backend,
                message: format!("{backend} stub failure"),
            });
        }
        let (w, h) = inputs[0].dimensions().unwrap();
        let frame = PlanarFrame::new(w, h, 3, vec![self.marker; (w * h * 3) as usize])?;
        Ok(FrameStream::new(vec![frame]))
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn context(network: NetworkArtifact) -> CallContext {
    CallContext {
        network,
        geometry: TileGeometry {
            tile_w: 8,
            tile_h: 8,
            overlap_w: 0,
            overlap_h: 0,
        },
        channels: 3,
    }
}

fn inputs() -> Vec<FrameStream> {
    let frame = PlanarFrame::new(8, 8, 3, vec![0.5; 8 * 8 * 3]).unwrap();
    vec![FrameStream::new(vec![frame])]
}

fn dispatch_with_capture(
    dispatcher: &InferenceDispatcher,
    primary: BackendKind,
    ctx: &CallContext,
) -> (Result<FrameStream>, String) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let spec = normalize(&primary.into(), ctx.channels, &ctx.geometry).unwrap();
    let result = tracing::subscriber::with_default(subscriber, || {
        dispatcher.dispatch(&spec, ctx, &inputs())
    });
    (result, captured.text())
}

#[test]
fn fallback_result_is_returned_and_failure_logged_once() {
    let runtime = Arc::new(StubRuntime::new(&[BackendKind::OrtCuda]));
    let dispatcher = InferenceDispatcher::new(runtime.clone())
        .with_fallback(Some(BackendSelection::Defaults(BackendKind::OrtCpu)));
    let ctx = context(NetworkArtifact::from(vec![1, 2, 3]));

    let (result, logs) = dispatch_with_capture(&dispatcher, BackendKind::OrtCuda, &ctx);
    let output = result.unwrap();

    assert!(output.frames[0].data.iter().all(|&v| v == 7.0));
    assert_eq!(runtime.calls(), [BackendKind::OrtCuda, BackendKind::OrtCpu]);
    assert_eq!(logs.matches("Primary backend failed").count(), 1, "{logs}");
    assert!(logs.contains("ort_cuda stub failure"));
}

#[test]
fn without_fallback_the_original_error_propagates() {
    let runtime = Arc::new(StubRuntime::new(&[BackendKind::OvCpu]));
    let dispatcher = InferenceDispatcher::new(runtime.clone());
    let ctx = context(NetworkArtifact::from(vec![1]));

    let (result, logs) = dispatch_with_capture(&dispatcher, BackendKind::OvCpu, &ctx);
    let err = result.expect_err("primary fails");

    assert!(matches!(
        err,
        EngineError::Inference {
            backend: BackendKind::OvCpu,
            ..
        }
    ));
    assert_eq!(runtime.calls(), [BackendKind::OvCpu]);
    assert!(!logs.contains("Primary backend failed"));
}

#[test]
fn fallback_failure_is_not_retried() {
    let runtime = Arc::new(StubRuntime::new(&[BackendKind::OrtCuda, BackendKind::NcnnVk]));
    let dispatcher = InferenceDispatcher::new(runtime.clone())
        .with_fallback(Some(BackendSelection::Defaults(BackendKind::NcnnVk)));
    let ctx = context(NetworkArtifact::from(vec![1]));

    let (result, _) = dispatch_with_capture(&dispatcher, BackendKind::OrtCuda, &ctx);
    let err = result.expect_err("both fail");

    assert!(err.to_string().contains("ncnn_vk stub failure"));
    assert_eq!(runtime.calls(), [BackendKind::OrtCuda, BackendKind::NcnnVk]);
}

#[test]
fn tensorrt_on_in_memory_graph_falls_back() {
    let runtime = Arc::new(StubRuntime::new(&[]));
    let dispatcher = InferenceDispatcher::new(runtime.clone())
        .with_fallback(Some(BackendSelection::Defaults(BackendKind::OrtCpu)));
    let ctx = context(NetworkArtifact::from(vec![1]));

    let (result, logs) = dispatch_with_capture(&dispatcher, BackendKind::TensorRt, &ctx);
    assert!(result.is_ok());
    assert_eq!(runtime.calls(), [BackendKind::OrtCpu]);
    assert!(logs.contains("filesystem path is required"), "{logs}");
}

#[test]
fn mismatched_streams_fail_before_any_backend_call() {
    let runtime = Arc::new(StubRuntime::new(&[]));
    let dispatcher = InferenceDispatcher::new(runtime.clone())
        .with_fallback(Some(BackendSelection::Defaults(BackendKind::OrtCpu)));
    let ctx = context(NetworkArtifact::from(vec![1]));
    let spec = normalize(&BackendKind::OrtCpu.into(), 3, &ctx.geometry).unwrap();

    let mut streams = inputs();
    streams.push(FrameStream::default());
    assert!(dispatcher.dispatch(&spec, &ctx, &streams).is_err());
    assert!(runtime.calls().is_empty());
}
