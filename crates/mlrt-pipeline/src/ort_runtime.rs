//! ONNX Runtime implementation of the ORT call contract.
//!
//! Frames are processed tile by tile: each tile is cut from the input with
//! edge replication where it overhangs the frame, run through the session,
//! and only its core (the part not covered by a neighbour's overlap) is
//! written to the output. Input streams are concatenated along channels, so
//! two-frame models receive both frames in one tensor.

use std::collections::HashMap;
use std::fmt::Display;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use mlrt_core::error::{EngineError, Result};
use mlrt_core::{BackendKind, FrameStream, NetworkArtifact, PlanarFrame, TileGeometry};
use mlrt_tensorrt::cache_key::checksum;

use crate::dispatch::{EngineCall, InferenceRuntime, OrtProvider};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum NetworkId {
    Path(PathBuf),
    Bytes(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    network: NetworkId,
    provider: OrtProvider,
    device_id: u32,
}

/// Session cache plus tiled execution for [`EngineCall::Ort`].
#[derive(Default)]
pub struct OrtRuntime {
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<Session>>>>,
}

fn ort_error(backend: BackendKind, err: impl Display) -> EngineError {
    EngineError::Inference {
        backend,
        message: err.to_string(),
    }
}

impl OrtRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(
        &self,
        provider: OrtProvider,
        device_id: u32,
        network: &NetworkArtifact,
    ) -> Result<Arc<Mutex<Session>>> {
        let id = match network {
            NetworkArtifact::Path(path) => NetworkId::Path(path.clone()),
            NetworkArtifact::Bytes(bytes) => NetworkId::Bytes(checksum(bytes)),
        };
        let key = SessionKey {
            network: id,
            provider,
            device_id,
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Mutex::new(build_session(provider, device_id, network)?));
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }
}

fn build_session(provider: OrtProvider, device_id: u32, network: &NetworkArtifact) -> Result<Session> {
    let backend = match provider {
        OrtProvider::Cpu => BackendKind::OrtCpu,
        OrtProvider::Cuda => BackendKind::OrtCuda,
    };
    let mut builder = Session::builder().map_err(|e| ort_error(backend, e))?;
    if provider == OrtProvider::Cuda {
        let cuda = CUDAExecutionProvider::default().with_device_id(device_id as i32);
        builder = builder
            .with_execution_providers([cuda.build().error_on_failure()])
            .map_err(|e| ort_error(backend, e))?;
    }
    let builder = builder
        .with_intra_threads(1)
        .map_err(|e| ort_error(backend, e))?;
    let session = match network {
        NetworkArtifact::Path(path) => builder.commit_from_file(path),
        NetworkArtifact::Bytes(bytes) => builder.commit_from_memory(&bytes[..]),
    }
    .map_err(|e| ort_error(backend, e))?;
    info!(provider = ?provider, device_id, "ORT session created");
    Ok(session)
}

impl InferenceRuntime for OrtRuntime {
    fn invoke(&self, call: &EngineCall, inputs: &[FrameStream]) -> Result<FrameStream> {
        let EngineCall::Ort {
            provider,
            network,
            geometry,
            device_id,
            ..
        } = call
        else {
            return Err(EngineError::RuntimeUnavailable(call.backend()));
        };
        let backend = call.backend();
        let session = self.session(*provider, *device_id, network)?;
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| ort_error(backend, "network has no inputs"))?;

        let frame_count = inputs.first().map_or(0, FrameStream::len);
        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            let stacked = stack_channels(inputs, index);
            frames.push(run_tiled(&mut session, &input_name, backend, &stacked, geometry)?);
        }
        debug!(frames = frames.len(), "ORT inference finished");
        Ok(FrameStream::new(frames))
    }
}

/// Concatenate frame `index` of every stream along the channel axis.
fn stack_channels(inputs: &[FrameStream], index: usize) -> PlanarFrame {
    let first = &inputs[0].frames[index];
    let channels = inputs.iter().map(|s| s.frames[index].channels).sum();
    let data: Vec<f32> = inputs
        .iter()
        .flat_map(|s| s.frames[index].data.iter().copied())
        .collect();
    PlanarFrame {
        width: first.width,
        height: first.height,
        channels,
        data: Arc::from(data),
    }
}

/// One tile along an axis: where it is cut and which output span it owns.
#[derive(Clone, Debug, PartialEq, Eq)]
struct AxisTile {
    start: usize,
    core: Range<usize>,
}

fn axis_tiles(dim: usize, tile: usize, overlap: usize) -> Result<Vec<AxisTile>> {
    if tile >= dim {
        return Ok(vec![AxisTile {
            start: 0,
            core: 0..dim,
        }]);
    }
    if tile <= 2 * overlap {
        return Err(EngineError::InvalidTiling(format!(
            "tile {tile} leaves no core with overlap {overlap} on both sides"
        )));
    }
    let step = tile - 2 * overlap;
    let mut tiles = Vec::new();
    let mut start = 0;
    loop {
        let last = start + tile >= dim;
        let core_start = if start == 0 { 0 } else { start + overlap };
        let core_end = if last { dim } else { start + tile - overlap };
        tiles.push(AxisTile {
            start: if last { dim - tile } else { start },
            core: core_start..core_end,
        });
        if last {
            return Ok(tiles);
        }
        start += step;
    }
}

fn run_tiled(
    session: &mut Session,
    input_name: &str,
    backend: BackendKind,
    frame: &PlanarFrame,
    geometry: &TileGeometry,
) -> Result<PlanarFrame> {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let (tile_w, tile_h) = (geometry.tile_w as usize, geometry.tile_h as usize);
    let channels = frame.channels as usize;
    let columns = axis_tiles(width, tile_w, geometry.overlap_w as usize)?;
    let rows = axis_tiles(height, tile_h, geometry.overlap_h as usize)?;

    let mut output: Option<(usize, usize, Vec<f32>)> = None;
    for row in &rows {
        for column in &columns {
            let mut tile = Vec::with_capacity(channels * tile_w * tile_h);
            for c in 0..channels {
                let plane = frame.plane(c as u32);
                for ty in 0..tile_h {
                    let y = (row.start + ty).min(height - 1);
                    for tx in 0..tile_w {
                        let x = (column.start + tx).min(width - 1);
                        tile.push(plane[y * width + x]);
                    }
                }
            }

            let tensor = Tensor::from_array(([1usize, channels, tile_h, tile_w], tile))
                .map_err(|e| ort_error(backend, e))?;
            let outputs = session
                .run(ort::inputs![input_name => tensor])
                .map_err(|e| ort_error(backend, e))?;
            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ort_error(backend, e))?;
            let [_, out_c, out_h, out_w] = shape[..] else {
                return Err(ort_error(backend, format!("expected NCHW output, got {:?}", &shape[..])));
            };
            let (out_c, out_h, out_w) = (out_c as usize, out_h as usize, out_w as usize);
            if out_w % tile_w != 0 || out_h % tile_h != 0 || out_w / tile_w != out_h / tile_h {
                return Err(ort_error(
                    backend,
                    format!("output {out_w}x{out_h} is not an integer rescale of tile {tile_w}x{tile_h}"),
                ));
            }
            let scale = out_w / tile_w;

            let (_, full_w, buffer) = output.get_or_insert_with(|| {
                (out_c, width * scale, vec![0.0; out_c * width * scale * height * scale])
            });
            let full_w = *full_w;
            let full_h = height * scale;
            for c in 0..out_c {
                for y in row.core.start * scale..row.core.end * scale {
                    let ty = y - row.start * scale;
                    let src = c * out_h * out_w + ty * out_w;
                    let dst = c * full_h * full_w + y * full_w;
                    let x0 = column.core.start * scale;
                    let x1 = column.core.end * scale;
                    let tx0 = x0 - column.start * scale;
                    buffer[dst + x0..dst + x1].copy_from_slice(&data[src + tx0..src + tx0 + (x1 - x0)]);
                }
            }
        }
    }

    let (out_c, full_w, buffer) =
        output.ok_or_else(|| ort_error(backend, "frame produced no tiles"))?;
    let full_h = buffer.len() / (out_c * full_w).max(1);
    PlanarFrame::new(full_w as u32, full_h as u32, out_c as u32, buffer)
}
