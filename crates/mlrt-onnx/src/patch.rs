//! Re-parameterizing fixed-topology networks.
//!
//! A patch never edits the graph it was handed: the bytes are decoded into
//! a fresh [`ModelProto`], every target is located and validated first, and
//! only then are the rewrites applied and the model re-encoded. A graph that
//! does not match the expected structure produces an error and no output.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use prost::Message;
use tracing::{debug, info};

use crate::proto::{GraphProto, ModelProto, NodeProto, TensorProto, data_type};
use mlrt_core::error::{EngineError, Result};
use mlrt_core::paths;

/// Single-output `Constant` nodes whose output name starts with a prefix,
/// expected exactly `expected` times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantPattern {
    pub output_prefix: String,
    pub expected: usize,
}

impl ConstantPattern {
    pub fn new(output_prefix: impl Into<String>, expected: usize) -> Self {
        Self {
            output_prefix: output_prefix.into(),
            expected,
        }
    }

    /// Node indices of all matches, in declaration order.
    pub fn matches(&self, graph: &GraphProto) -> Vec<usize> {
        graph
            .node
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.op_type() == "Constant"
                    && node.output.len() == 1
                    && node.output[0].starts_with(&self.output_prefix)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Like [`matches`](Self::matches) but fails unless the count is exact.
    pub fn locate(&self, graph: &GraphProto) -> Result<Vec<usize>> {
        let found = self.matches(graph);
        if found.len() != self.expected {
            return Err(EngineError::PatternMismatch {
                pattern: self.output_prefix.clone(),
                expected: self.expected,
                found: found.len(),
            });
        }
        Ok(found)
    }
}

/// Which constants a scale rewrite touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleLayout {
    /// Resize-parameter constants (`[n, c, h, w]` scales).
    pub resize: ConstantPattern,
    /// Scalar multiplier constants.
    pub multiplier: ConstantPattern,
}

impl ScaleLayout {
    /// Layout of the exported RIFE frame-interpolation graphs.
    pub fn rife() -> Self {
        Self {
            resize: ConstantPattern::new("onnx::Resize", 11),
            multiplier: ConstantPattern::new("onnx::Mul", 7),
        }
    }
}

impl Default for ScaleLayout {
    fn default() -> Self {
        Self::rife()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Mul(f64),
    Div(f64),
}

impl Op {
    fn apply(self, value: f64) -> f64 {
        match self {
            Op::Mul(factor) => value * factor,
            Op::Div(factor) => value / factor,
        }
    }
}

/// One validated constant rewrite.
#[derive(Clone, Debug)]
struct TensorRewrite {
    node: usize,
    /// Element range to touch; `None` means every element.
    elements: Option<Range<usize>>,
    op: Op,
}

/// A graph patch request.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphPatch {
    /// Rescale resize/multiplier constants for a runtime scale factor.
    Scale { scale: f64, layout: ScaleLayout },
    /// Scale the first input of the last `op_type` node by `coefficient`.
    Coefficient { op_type: String, coefficient: f32 },
}

impl GraphPatch {
    pub fn scale(scale: f64) -> Self {
        Self::Scale {
            scale,
            layout: ScaleLayout::rife(),
        }
    }

    pub fn coefficient(op_type: impl Into<String>, coefficient: f32) -> Self {
        Self::Coefficient {
            op_type: op_type.into(),
            coefficient,
        }
    }

    /// Short path-safe tag naming this patch in derived file names.
    pub fn tag(&self) -> String {
        let tag = match self {
            Self::Scale { scale, .. } => format!("scale{scale}"),
            Self::Coefficient {
                op_type,
                coefficient,
            } => format!("{}_x{coefficient}", op_type.to_ascii_lowercase()),
        };
        tag.replace(['.', '-'], "_")
    }

    /// Decode `graph`, patch a copy and return the re-encoded bytes.
    pub fn apply(&self, graph: &[u8]) -> Result<Vec<u8>> {
        let mut model = ModelProto::decode_bytes(graph)?;
        let graph_proto = model
            .graph
            .as_mut()
            .ok_or_else(|| EngineError::GraphDecode("model has no graph".into()))?;
        match self {
            Self::Scale { scale, layout } => rewrite_scale(graph_proto, *scale, layout)?,
            Self::Coefficient {
                op_type,
                coefficient,
            } => inject_coefficient(graph_proto, op_type, *coefficient)?,
        }
        Ok(model.encode_to_vec())
    }
}

/// Multiply or divide the matched constants by `scale`.
///
/// Resize constants come as `(down, up)` for the first block and
/// `(down, flow-down, up)` for each later one. The spatial components
/// (indices 2 and 3) of the upsampling constants, 1-based ordinals 2, 5, 8
/// and 11, are divided; all others are multiplied.
/// Multiplier constants: odd ordinals are divided, even ones multiplied.
pub fn rewrite_scale(graph: &mut GraphProto, scale: f64, layout: &ScaleLayout) -> Result<()> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(EngineError::GraphPatch(format!(
            "scale must be a positive finite number, got {scale}"
        )));
    }

    let resize = layout.resize.locate(graph)?;
    let multiplier = layout.multiplier.locate(graph)?;

    let mut plan = Vec::with_capacity(resize.len() + multiplier.len());
    for (position, &node) in resize.iter().enumerate() {
        let ordinal = position + 1;
        let op = if ordinal % 3 == 2 {
            Op::Div(scale)
        } else {
            Op::Mul(scale)
        };
        plan.push(TensorRewrite {
            node,
            elements: Some(2..4),
            op,
        });
    }
    for (position, &node) in multiplier.iter().enumerate() {
        let ordinal = position + 1;
        let op = if ordinal % 2 == 1 {
            Op::Div(scale)
        } else {
            Op::Mul(scale)
        };
        plan.push(TensorRewrite {
            node,
            elements: None,
            op,
        });
    }

    // Read everything before writing anything.
    let mut staged = Vec::with_capacity(plan.len());
    for rewrite in &plan {
        let node = &graph.node[rewrite.node];
        let tensor = node.constant_value().ok_or_else(|| {
            EngineError::GraphPatch(format!(
                "constant '{}' has no tensor value",
                node.output[0]
            ))
        })?;
        let mut values = read_values(tensor)?;
        let range = rewrite.elements.clone().unwrap_or(0..values.len());
        if range.end > values.len() {
            return Err(EngineError::GraphPatch(format!(
                "constant '{}' has {} elements, expected at least {}",
                node.output[0],
                values.len(),
                range.end
            )));
        }
        for value in &mut values[range] {
            *value = rewrite.op.apply(*value);
        }
        staged.push((rewrite.node, values));
    }

    for (node, values) in staged {
        if let Some(tensor) = graph.node[node].constant_value_mut() {
            write_values(tensor, &values)?;
        }
    }

    info!(
        scale,
        resize = resize.len(),
        multiplier = multiplier.len(),
        "Scale constants rewritten"
    );
    Ok(())
}

/// Insert `Constant(coefficient)` and `Mul` in front of the last node of
/// `op_type`, rewiring that node's first input through the multiply.
pub fn inject_coefficient(graph: &mut GraphProto, op_type: &str, coefficient: f32) -> Result<()> {
    let index = graph
        .node
        .iter()
        .rposition(|node| node.op_type() == op_type)
        .ok_or_else(|| EngineError::GraphPatch(format!("graph has no '{op_type}' node")))?;
    let upstream = graph.node[index].input.first().cloned().ok_or_else(|| {
        EngineError::GraphPatch(format!("last '{op_type}' node has no inputs"))
    })?;

    let coefficient_name = unique_name(graph, "mlrt_coefficient");
    let scaled = unique_name(graph, &format!("{upstream}_mul"));

    graph.node[index].input[0] = scaled.clone();
    let constant = NodeProto::constant(
        coefficient_name.clone(),
        TensorProto::from_f32(coefficient_name.clone(), &[], &[coefficient]),
    );
    let multiply = NodeProto::simple("Mul", &[&upstream, &coefficient_name], scaled);
    graph.node.insert(index, multiply);
    graph.node.insert(index, constant);

    debug!(op_type, coefficient, upstream = %upstream, "Coefficient injected");
    Ok(())
}

fn unique_name(graph: &GraphProto, base: &str) -> String {
    let taken = |name: &str| {
        graph
            .node
            .iter()
            .any(|node| node.output.iter().chain(&node.input).any(|n| n == name))
    };
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Tensor elements as `f64`, from whichever storage field is populated.
pub fn read_values(tensor: &TensorProto) -> Result<Vec<f64>> {
    match tensor.data_type {
        Some(data_type::FLOAT) => Ok(match &tensor.raw_data {
            Some(raw) => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            None => tensor.float_data.iter().map(|&v| v as f64).collect(),
        }),
        Some(data_type::DOUBLE) => Ok(match &tensor.raw_data {
            Some(raw) => raw
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            None => tensor.double_data.clone(),
        }),
        other => Err(EngineError::GraphPatch(format!(
            "tensor '{}' has unsupported data type {:?}",
            tensor.name.as_deref().unwrap_or_default(),
            other
        ))),
    }
}

/// Store `values` back into the field they were read from.
fn write_values(tensor: &mut TensorProto, values: &[f64]) -> Result<()> {
    match (tensor.data_type, tensor.raw_data.is_some()) {
        (Some(data_type::FLOAT), true) => {
            tensor.raw_data = Some(
                values
                    .iter()
                    .flat_map(|&v| (v as f32).to_le_bytes())
                    .collect(),
            );
        }
        (Some(data_type::FLOAT), false) => {
            tensor.float_data = values.iter().map(|&v| v as f32).collect();
        }
        (Some(data_type::DOUBLE), true) => {
            tensor.raw_data = Some(values.iter().flat_map(|v| v.to_le_bytes()).collect());
        }
        (Some(data_type::DOUBLE), false) => tensor.double_data = values.to_vec(),
        (other, _) => {
            return Err(EngineError::GraphPatch(format!(
                "cannot store into tensor data type {other:?}"
            )));
        }
    }
    Ok(())
}

/// File name a patched copy of `network` is written to: `<stem>_<tag>.onnx`.
pub fn patched_graph_path(network: &Path, tag: &str) -> PathBuf {
    let stem = network
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "network".into());
    network.with_file_name(format!("{stem}_{tag}.onnx"))
}

static PARTIAL_NONCE: AtomicU64 = AtomicU64::new(0);

/// Write patched bytes next to `network`, or to its temp mirror when that
/// directory is read-only. Returns the path written.
///
/// Each call stages into its own `<target>.<pid>.<nonce>.partial` and renames
/// over the target, so concurrent writers never share a staging file and
/// readers only ever see a complete graph. An existing target with identical
/// contents is left alone.
pub fn persist_patched_graph(
    network: &Path,
    tag: &str,
    bytes: &[u8],
    temp_root: &Path,
) -> Result<PathBuf> {
    let target = paths::writable_location(&patched_graph_path(network, tag), temp_root)?;
    if is_identical(&target, bytes) {
        debug!(path = %target.display(), "Patched graph already up to date");
        return Ok(target);
    }

    let nonce = PARTIAL_NONCE.fetch_add(1, Ordering::Relaxed);
    let mut partial = target.clone().into_os_string();
    partial.push(format!(".{}.{nonce}.partial", std::process::id()));
    let partial = PathBuf::from(partial);

    std::fs::write(&partial, bytes).map_err(|err| EngineError::io(&partial, err))?;
    if let Err(err) = std::fs::rename(&partial, &target) {
        let _ = std::fs::remove_file(&partial);
        return Err(EngineError::io(&target, err));
    }
    info!(path = %target.display(), bytes = bytes.len(), "Patched graph written");
    Ok(target)
}

fn is_identical(target: &Path, bytes: &[u8]) -> bool {
    match std::fs::metadata(target) {
        Ok(meta) if meta.len() == bytes.len() as u64 => {
            std::fs::read(target).is_ok_and(|existing| existing == bytes)
        }
        _ => false,
    }
}
