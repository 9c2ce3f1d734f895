//! `registry_facade_utils::error` is a module containing error utilities for the registry-facade project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a registry-facade-utils-related operation.
pub type RegistryFacadeUtilsResult<T> = Result<T, RegistryFacadeUtilsError>;

/// An error that occurred in one of the utility helpers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum RegistryFacadeUtilsError {
    /// An error that occurred when validating paths.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// An error that occurred during a Serde JSON operation.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Custom error.
    #[error("custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryFacadeUtilsError {
    /// Creates a new `Err` result wrapping an arbitrary error.
    pub fn custom(error: impl Into<anyhow::Error>) -> RegistryFacadeUtilsError {
        RegistryFacadeUtilsError::Custom(AnyError {
            error: error.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
