use crate::errors::Result;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// String key-value persistence for the printer registry.
///
/// Values are opaque strings (the registry stores serialized JSON in them),
/// mirroring browser `localStorage` so existing exports stay readable.
pub trait RegistryStore: Send {
    fn get(&self, key: &str) -> Option<String>;

    /// Replace the given entries and flush them in one write.
    fn write(&mut self, entries: &[(&str, String)]) -> Result<()>;
}

/// Store backed by a single JSON object file
pub struct JsonFileStore {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// An unreadable or unparsable file is treated as empty; the registry
    /// then falls back to its default seed and overwrites it on first save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Registry store {} is corrupt, starting empty: {}", path.display(), e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry store at {}", path.display());
                Map::new()
            }
            Err(e) => {
                warn!("Failed to read registry store {}: {}", path.display(), e);
                Map::new()
            }
        };

        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn write(&mut self, entries: &[(&str, String)]) -> Result<()> {
        for (key, value) in entries {
            self.entries.insert((*key).to_string(), Value::String(value.clone()));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write-then-rename so a crash never leaves a truncated store
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Registry store written to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store; clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    entries: Map<String, Value>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw entry without counting it as a write
    pub fn with_entry(self, key: &str, value: &str) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.insert(key.to_string(), Value::String(value.to_string()));
        }
        self
    }

    /// Number of `write` calls so far
    pub fn write_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.writes).unwrap_or(0)
    }
}

impl RegistryStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    fn write(&mut self, entries: &[(&str, String)]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        for (key, value) in entries {
            inner.entries.insert((*key).to_string(), Value::String(value.clone()));
        }
        inner.writes += 1;
        Ok(())
    }
}
