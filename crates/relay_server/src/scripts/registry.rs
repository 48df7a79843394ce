//! Script catalog with concurrent lookups and serialized reloads.

use super::RegistryError;
use crate::messaging::Value;
use crate::store::{ScriptHandle, SharedStore, StoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// A registered script.
#[derive(Debug)]
pub struct ScriptEntry {
    /// Action name (file stem).
    pub name: String,
    /// Handle the store executes.
    pub handle: ScriptHandle,
    /// File the script was read from.
    pub path: PathBuf,
    /// When this version was registered.
    pub loaded_at: SystemTime,
    /// Source kept for re-registration after a store cache flush.
    source: Arc<str>,
}

/// Outcome of a directory load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Names that were registered.
    pub loaded: Vec<String>,
    /// Files that were skipped, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// Catalog mapping action names to store script handles.
///
/// Lookups take the read lock only long enough to clone an `Arc` of the
/// entry, so invocations never hold the lock across a store round-trip and
/// a reload waits for nothing but other lookups' map reads.
pub struct ScriptRegistry {
    /// Store the scripts are registered with and executed by
    store: SharedStore,
    /// Registered scripts by name
    scripts: RwLock<HashMap<String, Arc<ScriptEntry>>>,
    /// File extension (without the dot) that marks a script file
    extension: String,
}

impl ScriptRegistry {
    /// Creates an empty registry for files ending in `.{extension}`.
    pub fn new(store: SharedStore, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            store,
            scripts: RwLock::new(HashMap::new()),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Returns the action name for `path` if it is a script file.
    pub fn script_name(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?;
        if !ext.eq_ignore_ascii_case(&self.extension) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        (!stem.is_empty() && !stem.starts_with('.')).then(|| stem.to_string())
    }

    /// Loads every script file directly inside `directory`.
    ///
    /// A file that cannot be read or that the store rejects is logged and
    /// skipped; only an unreadable directory fails the whole call.
    pub async fn load_directory(&self, directory: &Path) -> Result<LoadReport, RegistryError> {
        let mut entries =
            tokio::fs::read_dir(directory)
                .await
                .map_err(|source| RegistryError::Io {
                    path: directory.to_path_buf(),
                    source,
                })?;

        let mut report = LoadReport::default();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(RegistryError::Io {
                        path: directory.to_path_buf(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if self.script_name(&path).is_none() {
                continue;
            }
            match entry.file_type().await {
                Ok(kind) if kind.is_file() || kind.is_symlink() => {}
                _ => continue,
            }

            match self.load_file(&path).await {
                Ok(name) => report.loaded.push(name),
                Err(e) => {
                    error!("Skipping script {}: {}", path.display(), e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        report.loaded.sort();
        info!(
            "📜 Loaded {} script(s) from {} ({} failed)",
            report.loaded.len(),
            directory.display(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Reads and registers a single script file, replacing any entry with
    /// the same name.
    ///
    /// Invocations already running keep the handle they captured.
    pub async fn load_file(&self, path: &Path) -> Result<String, RegistryError> {
        let name = self
            .script_name(path)
            .ok_or_else(|| RegistryError::NotAScript(path.to_path_buf()))?;

        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let handle = self
            .store
            .load_script(&source)
            .await
            .map_err(|source| RegistryError::Register {
                path: path.to_path_buf(),
                source,
            })?;

        let entry = Arc::new(ScriptEntry {
            name: name.clone(),
            handle,
            path: path.to_path_buf(),
            loaded_at: SystemTime::now(),
            source: Arc::from(source),
        });

        let replaced = {
            let mut scripts = self.scripts.write().await;
            scripts.insert(name.clone(), entry.clone())
        };

        match replaced {
            Some(old) if old.handle != entry.handle => {
                info!("🔁 Reloaded script {} ({} -> {})", name, old.handle, entry.handle)
            }
            Some(_) => debug!("Script {} unchanged", name),
            None => info!("➕ Registered script {} ({})", name, entry.handle),
        }
        Ok(name)
    }

    /// Removes a script from the catalog. Returns whether it was present.
    pub async fn unload(&self, name: &str) -> bool {
        let removed = {
            let mut scripts = self.scripts.write().await;
            scripts.remove(name)
        };
        if removed.is_some() {
            info!("➖ Unloaded script {}", name);
        }
        removed.is_some()
    }

    /// Looks up the current entry for `name`.
    pub async fn get(&self, name: &str) -> Option<Arc<ScriptEntry>> {
        self.scripts.read().await.get(name).cloned()
    }

    /// Names of all registered scripts, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered scripts.
    pub async fn len(&self) -> usize {
        self.scripts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Executes the script registered as `name`.
    ///
    /// If the store reports the handle as unknown (its script cache was
    /// flushed), the retained source is registered again and the call is
    /// retried once.
    pub async fn invoke(
        &self,
        name: &str,
        keys: &[String],
        args: &[Value],
    ) -> Result<Value, RegistryError> {
        let entry = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotLoaded(name.to_string()))?;

        match self.store.eval_script(&entry.handle, keys, args).await {
            Ok(result) => Ok(result),
            Err(StoreError::UnknownScript(_)) => {
                warn!("Store lost script {} ({}), re-registering", name, entry.handle);
                let handle = self.reregister(&entry).await?;
                self.store
                    .eval_script(&handle, keys, args)
                    .await
                    .map_err(|source| RegistryError::Invocation {
                        name: name.to_string(),
                        source,
                    })
            }
            Err(source) => Err(RegistryError::Invocation {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Uploads `entry`'s source again. The catalog is updated only if it
    /// still points at `entry`, so a concurrent hot reload wins.
    async fn reregister(&self, entry: &Arc<ScriptEntry>) -> Result<ScriptHandle, RegistryError> {
        let handle = self
            .store
            .load_script(&entry.source)
            .await
            .map_err(|source| RegistryError::Invocation {
                name: entry.name.clone(),
                source,
            })?;

        if handle != entry.handle {
            let mut scripts = self.scripts.write().await;
            if let Some(current) = scripts.get(&entry.name) {
                if Arc::ptr_eq(current, entry) {
                    let refreshed = Arc::new(ScriptEntry {
                        name: entry.name.clone(),
                        handle: handle.clone(),
                        path: entry.path.clone(),
                        loaded_at: SystemTime::now(),
                        source: entry.source.clone(),
                    });
                    scripts.insert(entry.name.clone(), refreshed);
                }
            }
        }
        Ok(handle)
    }
}
