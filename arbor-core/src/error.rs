use thiserror::Error;

use crate::auth::Operation;

/// Errors raised at the data-model boundary.
///
/// Authorization denial on the write path is *not* reported through this
/// type: writes that fail authorization are silent no-ops. Only
/// [`crate::auth::Authorization::authorize`] turns a denial into
/// [`Error::NotAuthorized`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Type mismatch at '{path}': expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("Not authorized to {operation} '{path}'")]
    NotAuthorized { operation: Operation, path: String },

    #[error("Rules error: {0}")]
    Rules(String),
}

pub type Result<T> = std::result::Result<T, Error>;
