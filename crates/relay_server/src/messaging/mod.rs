//! Message handling and routing.
//!
//! This module defines the request/response envelopes, the value type used
//! for script arguments and results, and the router that dispatches
//! requests to built-in actions or scripts.

pub mod router;
pub mod types;
pub mod value;

pub use router::{generate_lobby_id, ActionRouter, RouteContext};
pub use types::{ActionError, ClientEnvelope, ServerEnvelope, Status};
pub use value::Value;
