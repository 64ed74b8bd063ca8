//! Persisted instance identity.
//!
//! The handle of the managed instance survives process restarts so that
//! every process on the host drives the same instance. Files are
//! last-writer-wins; nothing here locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from a [`HandleStore`].
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem error.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache file is not valid JSON.
    #[error("corrupt cache file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity of the managed instance for one server type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Provider project ID.
    pub project_id: String,
    /// Zone the instance lives in.
    pub zone: String,
    /// Provider instance ID (or name).
    pub instance_id: String,
    /// Workload type.
    pub server_type: String,
}

impl InstanceHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance_id: impl Into<String>,
        server_type: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance_id: instance_id.into(),
            server_type: server_type.into(),
        }
    }
}

/// Storage for instance handles (keyed by server type) and last known IPs
/// (keyed by instance ID).
pub trait HandleStore: Send + Sync {
    /// Load the handle for a server type.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn load(&self, server_type: &str) -> Result<Option<InstanceHandle>, CacheError>;

    /// Persist a handle, replacing any previous one for its server type.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    fn save(&self, handle: &InstanceHandle) -> Result<(), CacheError>;

    /// Remove the handle for a server type. Removing nothing is not an error.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    fn remove(&self, server_type: &str) -> Result<(), CacheError>;

    /// Last known IP of an instance.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn load_ip(&self, instance_id: &str) -> Result<Option<String>, CacheError>;

    /// Remember the IP of an instance.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    fn save_ip(&self, instance_id: &str, ip: &str) -> Result<(), CacheError>;
}

/// File-backed store: one JSON file per server type, one plain-text file
/// per instance ID.
#[derive(Debug, Clone)]
pub struct FileHandleStore {
    dir: PathBuf,
    project_id: String,
}

impl FileHandleStore {
    /// Create a store rooted at `dir`. File names are prefixed with the
    /// project so several projects can share a directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            project_id: project_id.into(),
        }
    }

    /// Path of the handle file for a server type.
    #[must_use]
    pub fn handle_path(&self, server_type: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{server_type}_instance.json", self.project_id))
    }

    /// Path of the IP file for an instance.
    #[must_use]
    pub fn ip_path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}_{instance_id}.ip", self.project_id))
    }

    fn read_optional(path: &Path) -> Result<Option<String>, CacheError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write through a sibling temp file so readers never see a torn file.
    fn write(&self, path: &Path, content: &str) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }
}

impl HandleStore for FileHandleStore {
    fn load(&self, server_type: &str) -> Result<Option<InstanceHandle>, CacheError> {
        let path = self.handle_path(server_type);
        let Some(content) = Self::read_optional(&path)? else {
            return Ok(None);
        };
        let handle: InstanceHandle =
            serde_json::from_str(&content).map_err(|source| CacheError::Corrupt {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), zone = %handle.zone, instance_id = %handle.instance_id, "Loaded instance handle");
        Ok(Some(handle))
    }

    fn save(&self, handle: &InstanceHandle) -> Result<(), CacheError> {
        let path = self.handle_path(&handle.server_type);
        let content = serde_json::to_string_pretty(handle).map_err(|source| {
            CacheError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        self.write(&path, &content)?;
        info!(path = %path.display(), zone = %handle.zone, instance_id = %handle.instance_id, "Saved instance handle");
        Ok(())
    }

    fn remove(&self, server_type: &str) -> Result<(), CacheError> {
        let path = self.handle_path(server_type);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed instance handle");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn load_ip(&self, instance_id: &str) -> Result<Option<String>, CacheError> {
        Ok(Self::read_optional(&self.ip_path(instance_id))?
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty()))
    }

    fn save_ip(&self, instance_id: &str, ip: &str) -> Result<(), CacheError> {
        self.write(&self.ip_path(instance_id), ip)
    }
}

/// In-memory store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryHandleStore {
    handles: Mutex<HashMap<String, InstanceHandle>>,
    ips: Mutex<HashMap<String, String>>,
}

impl MemoryHandleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding a handle.
    #[must_use]
    pub fn with_handle(handle: InstanceHandle) -> Self {
        let store = Self::default();
        store
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.server_type.clone(), handle);
        store
    }
}

impl HandleStore for MemoryHandleStore {
    fn load(&self, server_type: &str) -> Result<Option<InstanceHandle>, CacheError> {
        Ok(self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_type)
            .cloned())
    }

    fn save(&self, handle: &InstanceHandle) -> Result<(), CacheError> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.server_type.clone(), handle.clone());
        Ok(())
    }

    fn remove(&self, server_type: &str) -> Result<(), CacheError> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_type);
        Ok(())
    }

    fn load_ip(&self, instance_id: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .ips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned())
    }

    fn save_ip(&self, instance_id: &str, ip: &str) -> Result<(), CacheError> {
        self.ips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string(), ip.to_string());
        Ok(())
    }
}
