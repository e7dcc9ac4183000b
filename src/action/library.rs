// Action library: named motion scripts, swapped as a whole on reload
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use super::script::MotionScript;

pub type ScriptMap = HashMap<String, Arc<MotionScript>>;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Failed to read action file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed JSON, or a script that fails validation
    #[error("Invalid action file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk action file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFile {
    pub actions: Vec<MotionScript>,
}

/// Name -> script mapping shared by all sessions
///
/// Readers always see a complete mapping, either the one before a reload or
/// the one after. Scripts handed out stay valid across reloads.
#[derive(Debug, Default)]
pub struct ActionLibrary {
    scripts: RwLock<Arc<ScriptMap>>,
}

impl ActionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = MotionScript>) -> Self {
        let library = Self::new();
        library.reload(scripts);
        library
    }

    /// Replace every script at once
    ///
    /// On duplicate names the last script wins. Returns the number of
    /// actions in the new mapping.
    pub fn reload(&self, scripts: impl IntoIterator<Item = MotionScript>) -> usize {
        let mut map = ScriptMap::new();
        for script in scripts {
            let name = script.name().to_string();
            if map.insert(name.clone(), Arc::new(script)).is_some() {
                warn!("Duplicate action '{}', keeping the last definition", name);
            }
        }

        let count = map.len();
        *self.scripts.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        info!("Action library reloaded: {} actions", count);
        count
    }

    /// Load an action file and replace the library with its contents
    ///
    /// On any error the current library is left untouched.
    pub fn reload_from_file(&self, path: &Path) -> Result<usize, LibraryError> {
        let scripts = load_file(path)?;
        Ok(self.reload(scripts))
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<MotionScript>> {
        self.snapshot().get(name).cloned()
    }

    /// The current mapping; unaffected by later reloads
    pub fn snapshot(&self) -> Arc<ScriptMap> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sorted action names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Read and validate an action file
pub fn load_file(path: &Path) -> Result<Vec<MotionScript>, LibraryError> {
    let text = std::fs::read_to_string(path).map_err(|source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ActionFile = serde_json::from_str(&text).map_err(|source| LibraryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.actions)
}
