//! Hot-reloadable catalog of server-side scripts.
//!
//! A script directory holds one file per action; the file stem is the action
//! name. [`ScriptRegistry`] loads the directory at startup and
//! [`ScriptWatcher`] keeps the catalog in sync with the directory afterwards.

pub mod registry;
pub mod watcher;

pub use registry::{LoadReport, ScriptEntry, ScriptRegistry};
pub use watcher::ScriptWatcher;

use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the script registry and its watcher.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No script is registered under this name.
    #[error("script {0} is not loaded")]
    NotLoaded(String),

    /// The store failed to execute the script.
    #[error("script {name} failed: {source}")]
    Invocation { name: String, source: StoreError },

    /// The store refused to register a script file.
    #[error("failed to register {path}: {source}")]
    Register { path: PathBuf, source: StoreError },

    /// A file or directory could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The path is not a script file this registry manages.
    #[error("{0} is not a script file")]
    NotAScript(PathBuf),

    /// The directory watch could not be established.
    #[error("failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },
}
