//! Network artifacts handed to backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// A serialized network, either on disk or in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkArtifact {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl NetworkArtifact {
    pub fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Bytes(_) => None,
        }
    }

    /// Serialized network bytes, reading from disk for the path form.
    pub fn load(&self) -> Result<Arc<[u8]>> {
        match self {
            Self::Path(path) => std::fs::read(path)
                .map(Arc::from)
                .map_err(|err| EngineError::io(path, err)),
            Self::Bytes(bytes) => Ok(Arc::clone(bytes)),
        }
    }
}

impl From<PathBuf> for NetworkArtifact {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Vec<u8>> for NetworkArtifact {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Arc::from(bytes))
    }
}
