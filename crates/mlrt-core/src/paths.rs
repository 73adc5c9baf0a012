//! On-disk locations for derived artifacts (compiled engines, patched graphs).
//!
//! Derived files live next to their source network. When that directory is
//! read-only they go to a mirror of the same absolute path under a temp
//! root, e.g. `/models/x.onnx` → `<temp_root>/models/x.onnx`.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Default root of the secondary location: `<system temp>/mlrt`.
pub fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("mlrt")
}

/// Mirror `path` under `temp_root`, dropping drive prefixes and the root.
pub fn temp_mirror(temp_root: &Path, path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut mirrored = temp_root.to_path_buf();
    for component in absolute.components() {
        match component {
            Component::Normal(part) => mirrored.push(part),
            Component::ParentDir => {
                mirrored.pop();
            }
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
        }
    }
    mirrored
}

/// Whether `path` can be read right now.
pub fn is_readable(path: &Path) -> bool {
    path.is_file() && std::fs::File::open(path).is_ok()
}

/// Create-then-delete a zero-byte file at `path`.
///
/// Returns `Ok(false)` on permission failures, `Ok(true)` when the file
/// could be created, and an error for anything else.
pub fn probe_writable(path: &Path) -> Result<bool> {
    let existed = path.exists();
    match OpenOptions::new().write(true).create(true).open(path) {
        Ok(file) => {
            drop(file);
            if !existed {
                std::fs::remove_file(path).map_err(|err| EngineError::io(path, err))?;
            }
            Ok(true)
        }
        Err(err) if matches!(err.kind(), ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem) => {
            debug!(path = %path.display(), error = %err, "Writability probe denied");
            Ok(false)
        }
        Err(err) => Err(EngineError::io(path, err)),
    }
}

/// Pick where a derived file should be written: `primary` when writable,
/// otherwise its temp mirror (parent directories created).
///
/// The probe uses a sibling of `primary`, so concurrent readers never see a
/// zero-byte file at the real path. Each call gets its own probe name, so
/// threads of one process never delete each other's probe.
pub fn writable_location(primary: &Path, temp_root: &Path) -> Result<PathBuf> {
    static PROBE_NONCE: AtomicU64 = AtomicU64::new(0);
    let nonce = PROBE_NONCE.fetch_add(1, Ordering::Relaxed);
    let mut probe = primary.as_os_str().to_os_string();
    probe.push(format!(".{}.{nonce}.probe", std::process::id()));
    if probe_writable(Path::new(&probe))? {
        return Ok(primary.to_path_buf());
    }
    let secondary = temp_mirror(temp_root, primary);
    if let Some(parent) = secondary.parent() {
        std::fs::create_dir_all(parent).map_err(|err| EngineError::io(parent, err))?;
    }
    warn!(
        primary = %primary.display(),
        secondary = %secondary.display(),
        "Primary location is not writable; redirecting to temp mirror"
    );
    Ok(secondary)
}
