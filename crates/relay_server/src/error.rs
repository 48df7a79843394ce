//! Error types for the relay server.
//!
//! Startup and lifecycle failures surface as [`ServerError`]. Per-request
//! failures never reach this type: they are converted into error envelopes
//! at the action router boundary (see [`crate::messaging::ActionError`]).

use crate::scripts::RegistryError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors that can stop the server from starting or running.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Socket creation, bind, listen or serve failures.
    #[error("Network error: {0}")]
    Network(String),

    /// The shared store could not be reached or refused an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The script registry could not be set up (for example the
    /// directory watch could not be established).
    #[error("Script registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Anything else that went wrong inside the server plumbing.
    #[error("Internal error: {0}")]
    Internal(String),
}
