//! File-backed routes document.
//!
//! The routes file is the source of truth across restarts: read once at
//! startup and rewritten whole on every admin mutation. Writes go through a
//! temp file followed by a rename so a crash mid-write never leaves a
//! truncated document behind.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::route_table::RouteRule;

/// The persisted shape: `{"routes": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutesDoc {
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutesStoreError {
    #[error("failed to read routes file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse routes file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write routes file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the routes document. A missing file yields an empty table.
pub fn load(path: &Path) -> Result<RoutesDoc, RoutesStoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "routes file absent, starting with empty table");
            return Ok(RoutesDoc::default());
        }
        Err(source) => {
            return Err(RoutesStoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content).map_err(|source| RoutesStoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Rewrite the routes document atomically: write a sibling temp file, flush,
/// then rename over the target.
pub fn save(path: &Path, doc: &RoutesDoc) -> Result<(), RoutesStoreError> {
    let json = serde_json::to_vec_pretty(doc).expect("routes document serializes");
    let tmp = path.with_extension("json.tmp");
    let write = |tmp: &Path| -> std::io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(tmp, path)
    };
    write(&tmp).map_err(|source| RoutesStoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}
