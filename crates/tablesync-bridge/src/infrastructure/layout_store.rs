//! Persistence of the dashboard layout blob (`layout.json`).
//!
//! The bridge does not interpret the layout; it only guarantees that what the
//! dashboard saved is what it gets back.  Saved files are pretty-printed with
//! sorted keys and a 4-space indent so they diff cleanly.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reading or writing the layout file.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error accessing layout at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("layout is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and writes one layout file.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the layout.
    ///
    /// # Errors
    ///
    /// [`LayoutError::Io`] if the file cannot be read (including when it does
    /// not exist), [`LayoutError::Json`] if it is not valid JSON.
    pub fn load(&self) -> Result<serde_json::Value, LayoutError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| LayoutError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads the layout, falling back to an empty object.
    ///
    /// A missing file is normal (nothing saved yet).  A corrupt file is
    /// logged and otherwise treated the same way.
    pub fn load_or_empty(&self) -> serde_json::Value {
        match self.load() {
            Ok(value) => value,
            Err(LayoutError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!("no layout at {}; serving empty layout", self.path.display());
                empty()
            }
            Err(e) => {
                warn!("{e}; serving empty layout");
                empty()
            }
        }
    }

    /// Writes `layout` pretty-printed (sorted keys, 4-space indent).
    ///
    /// The parent directory is created if needed.
    ///
    /// # Errors
    ///
    /// [`LayoutError::Io`] if the file or its directory cannot be written.
    pub fn save(&self, layout: &serde_json::Value) -> Result<(), LayoutError> {
        let bytes = to_pretty_json(layout)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LayoutError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, bytes).map_err(|source| LayoutError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!("layout saved to {}", self.path.display());
        Ok(())
    }
}

fn empty() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// `serde_json::Map` is a `BTreeMap` unless `preserve_order` is enabled, so
/// keys come out sorted at every nesting level.
fn to_pretty_json(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
