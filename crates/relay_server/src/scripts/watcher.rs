//! Keeps a [`ScriptRegistry`] in sync with its directory.
//!
//! The `notify` callback runs on the watcher's own thread. It only classifies
//! events into load/unload intents and queues them; a single task drains
//! the queue and is the only writer touching the registry after startup.

use super::{RegistryError, ScriptRegistry};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A change to apply to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptChange {
    /// The file was created or written; (re)load it.
    Upsert(PathBuf),
    /// The file is gone; drop its entry.
    Remove(PathBuf),
    /// The file was renamed without telling us which side this is.
    Renamed(PathBuf),
}

/// Maps a filesystem event onto registry changes.
fn classify(event: Event) -> Vec<ScriptChange> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) => {
            paths.map(ScriptChange::Upsert).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(ScriptChange::Remove).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(ScriptChange::Upsert).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                changes.push(ScriptChange::Remove(from));
            }
            if let Some(to) = paths.next() {
                changes.push(ScriptChange::Upsert(to));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths.map(ScriptChange::Renamed).collect(),
        EventKind::Modify(ModifyKind::Any) | EventKind::Modify(ModifyKind::Other) => {
            paths.map(ScriptChange::Upsert).collect()
        }
        _ => Vec::new(),
    }
}

/// Background task applying directory changes to a registry.
pub struct ScriptWatcher {
    task: JoinHandle<()>,
}

impl ScriptWatcher {
    /// Starts watching `directory` (non-recursively).
    ///
    /// Fails if the watch cannot be established. Once running, errors while
    /// applying individual events are logged and the loop continues until
    /// `shutdown` flips to `true`.
    pub fn spawn(
        registry: Arc<ScriptRegistry>,
        directory: impl Into<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self, RegistryError> {
        let directory = directory.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<ScriptChange>();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for change in classify(event) {
                        // Receiver gone means the applier stopped.
                        let _ = tx.send(change);
                    }
                }
                Err(e) => warn!("Script watcher error: {}", e),
            })
            .map_err(|e| RegistryError::Watch {
                path: directory.clone(),
                reason: e.to_string(),
            })?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| RegistryError::Watch {
                path: directory.clone(),
                reason: e.to_string(),
            })?;

        info!("👀 Watching {} for script changes", directory.display());

        let task = tokio::spawn(async move {
            // Dropping the watcher stops event delivery.
            let _watcher = watcher;
            while !*shutdown.borrow_and_update() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    change = rx.recv() => match change {
                        Some(change) => apply(&registry, change).await,
                        None => break,
                    },
                }
            }
            info!("Script watcher stopped");
        });

        Ok(Self { task })
    }

    /// Waits for the watch loop to exit after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Script watcher task failed: {}", e);
            }
        }
    }

    /// Stops the watch loop without waiting for a shutdown signal.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn apply(registry: &ScriptRegistry, change: ScriptChange) {
    let path = match &change {
        ScriptChange::Upsert(path) | ScriptChange::Remove(path) | ScriptChange::Renamed(path) => {
            path.as_path()
        }
    };
    let Some(name) = registry.script_name(path) else {
        return;
    };

    match &change {
        ScriptChange::Remove(_) => {
            registry.unload(&name).await;
        }
        ScriptChange::Upsert(_) => upsert(registry, path, &name).await,
        ScriptChange::Renamed(_) => match tokio::fs::try_exists(path).await {
            Ok(true) => upsert(registry, path, &name).await,
            Ok(false) => {
                registry.unload(&name).await;
            }
            Err(e) => warn!("Cannot stat {}: {}", path.display(), e),
        },
    }
}

async fn upsert(registry: &ScriptRegistry, path: &Path, name: &str) {
    match registry.load_file(path).await {
        Ok(_) => {}
        Err(RegistryError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            // Deleted before we got to it.
            debug!("{} vanished before reload", path.display());
            registry.unload(name).await;
        }
        Err(e) => error!("Failed to reload {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Value;
    use crate::store::MemoryStore;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::{sleep, Instant};

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_classify_events() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("a.lua".into());
        assert_eq!(classify(create), vec![ScriptChange::Upsert("a.lua".into())]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("a.lua".into());
        assert_eq!(classify(write), vec![ScriptChange::Upsert("a.lua".into())]);

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path("a.lua".into());
        assert_eq!(classify(remove), vec![ScriptChange::Remove("a.lua".into())]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("a.lua".into())
            .add_path("b.lua".into());
        assert_eq!(
            classify(rename),
            vec![
                ScriptChange::Remove("a.lua".into()),
                ScriptChange::Upsert("b.lua".into())
            ]
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("a.lua".into());
        assert!(classify(access).is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_fails_to_watch() {
        let registry = Arc::new(ScriptRegistry::new(Arc::new(MemoryStore::new()), "lua"));
        let (_tx, rx) = watch::channel(false);
        let result = ScriptWatcher::spawn(registry, "/definitely/not/here", rx);
        assert!(matches!(result, Err(RegistryError::Watch { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hot_reload_and_delete() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ScriptRegistry::new(Arc::new(MemoryStore::new()), "lua"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ScriptWatcher::spawn(registry.clone(), dir.path(), shutdown_rx).unwrap();

        std::fs::write(dir.path().join("keep.lua"), r#""kept""#).unwrap();
        let path = dir.path().join("score.lua");
        std::fs::write(&path, r#""one""#).unwrap();
        eventually(|| {
            let registry = registry.clone();
            async move { registry.invoke("score", &[], &[]).await.ok() == Some(Value::from("one")) }
        })
        .await;

        eventually(|| {
            let registry = registry.clone();
            async move { registry.invoke("keep", &[], &[]).await.is_ok() }
        })
        .await;

        std::fs::write(&path, r#""two""#).unwrap();
        eventually(|| {
            let registry = registry.clone();
            async move { registry.invoke("score", &[], &[]).await.ok() == Some(Value::from("two")) }
        })
        .await;

        std::fs::write(dir.path().join("readme.txt"), "not a script").unwrap();

        std::fs::remove_file(&path).unwrap();
        eventually(|| {
            let registry = registry.clone();
            async move { registry.get("score").await.is_none() }
        })
        .await;
        assert!(matches!(
            registry.invoke("score", &[], &[]).await,
            Err(RegistryError::NotLoaded(name)) if name == "score"
        ));
        assert_eq!(registry.names().await, vec!["keep".to_string()]);
        assert_eq!(
            registry.invoke("keep", &[], &[]).await.unwrap(),
            Value::from("kept")
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher.join())
            .await
            .unwrap();
    }
}
