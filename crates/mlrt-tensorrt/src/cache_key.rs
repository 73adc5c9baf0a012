//! Content-addressed engine cache keys.
//!
//! Every input that changes the compiled engine is part of the key, and the
//! key renders to a path-safe suffix appended to the network path:
//!
//! ```text
//! <network>.<shapes>[_fp16][_no-tf32]_workspace<N>_<version>[_cublas]_<device>_<checksum>.engine
//! ```
//!
//! `<shapes>` is `<maxW>x<maxH>` for static engines and
//! `opt<W>x<H>_max<W>x<H>` for dynamic ones.

use std::fmt;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use mlrt_core::TensorRtSpec;

use crate::device::sanitize;

/// Fast non-cryptographic checksum of network bytes.
pub fn checksum(bytes: &[u8]) -> u64 {
    xxh64(bytes, 0)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineCacheKey {
    pub checksum: u64,
    pub max_shapes: (u32, u32),
    /// Present only for dynamic-shape engines.
    pub opt_shapes: Option<(u32, u32)>,
    pub fp16: bool,
    pub tf32: bool,
    pub workspace_mib: u64,
    pub use_cublas: bool,
    pub compiler_version: String,
    /// Path-safe device identifier (see [`crate::device::device_identifier`]).
    pub device: String,
}

impl EngineCacheKey {
    pub fn new(
        network: &[u8],
        spec: &TensorRtSpec,
        compiler_version: &str,
        device: &str,
    ) -> Self {
        let options = &spec.options;
        Self {
            checksum: checksum(network),
            max_shapes: spec.max_shapes,
            opt_shapes: (!options.static_shape).then_some(spec.opt_shapes),
            fp16: options.fp16,
            tf32: options.tf32,
            workspace_mib: options.workspace_mib,
            use_cublas: options.use_cublas,
            compiler_version: sanitize(compiler_version),
            device: sanitize(device),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.opt_shapes.is_some()
    }

    /// Shape part of the suffix.
    pub fn shape_descriptor(&self) -> String {
        let (max_w, max_h) = self.max_shapes;
        match self.opt_shapes {
            None => format!("{max_w}x{max_h}"),
            Some((opt_w, opt_h)) => format!("opt{opt_w}x{opt_h}_max{max_w}x{max_h}"),
        }
    }

    /// Primary artifact location next to `network`.
    pub fn engine_path(&self, network: &Path) -> PathBuf {
        let mut name = network.as_os_str().to_os_string();
        name.push(format!(".{self}.engine"));
        PathBuf::from(name)
    }
}

impl fmt::Display for EngineCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shape_descriptor())?;
        if self.fp16 {
            f.write_str("_fp16")?;
        }
        if !self.tf32 {
            f.write_str("_no-tf32")?;
        }
        write!(f, "_workspace{}_{}", self.workspace_mib, self.compiler_version)?;
        if self.use_cublas {
            f.write_str("_cublas")?;
        }
        write!(f, "_{}_{:016x}", self.device, self.checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlrt_core::backend::TensorRtOptions;

    fn spec(options: TensorRtOptions) -> TensorRtSpec {
        TensorRtSpec {
            options,
            channels: 3,
            max_shapes: (492, 544),
            opt_shapes: (256, 256),
        }
    }

    fn path_for(options: TensorRtOptions) -> PathBuf {
        EngineCacheKey::new(b"network", &spec(options), "8601", "RTX-4090")
            .engine_path(Path::new("/models/rife.onnx"))
    }

    #[test]
    fn static_name_layout() {
        let path = path_for(TensorRtOptions::default());
        let expected = format!(
            "/models/rife.onnx.492x544_workspace128_8601_RTX-4090_{:016x}.engine",
            checksum(b"network")
        );
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    fn dynamic_name_carries_opt_shape() {
        let path = path_for(TensorRtOptions {
            static_shape: false,
            fp16: true,
            tf32: false,
            use_cublas: true,
            ..TensorRtOptions::default()
        });
        let name = path.to_string_lossy().into_owned();
        assert!(
            name.contains(".opt256x256_max492x544_fp16_no-tf32_workspace128_8601_cublas_RTX-4090_"),
            "{name}"
        );
    }

    #[test]
    fn key_is_deterministic() {
        assert_eq!(path_for(TensorRtOptions::default()), path_for(TensorRtOptions::default()));
    }

    #[test]
    fn every_behavioral_flag_changes_the_path() {
        let base = path_for(TensorRtOptions::default());
        let variants = [
            TensorRtOptions { fp16: true, ..TensorRtOptions::default() },
            TensorRtOptions { tf32: false, ..TensorRtOptions::default() },
            TensorRtOptions { workspace_mib: 256, ..TensorRtOptions::default() },
            TensorRtOptions { use_cublas: true, ..TensorRtOptions::default() },
            TensorRtOptions { static_shape: false, ..TensorRtOptions::default() },
        ];
        for options in variants {
            assert_ne!(path_for(options.clone()), base, "{options:?}");
        }

        let other_content = EngineCacheKey::new(b"network2", &spec(TensorRtOptions::default()), "8601", "RTX-4090");
        let other_version = EngineCacheKey::new(b"network", &spec(TensorRtOptions::default()), "8602", "RTX-4090");
        let other_device = EngineCacheKey::new(b"network", &spec(TensorRtOptions::default()), "8601", "device0");
        for key in [other_content, other_version, other_device] {
            assert_ne!(key.engine_path(Path::new("/models/rife.onnx")), base);
        }
    }
}
