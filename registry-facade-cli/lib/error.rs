//! `registry_facade_cli::error` is a module containing error utilities for the facade's CLI.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a `registry-facade-cli` operation.
pub type CliResult<T> = Result<T, CliError>;

/// An error surfaced while parsing arguments or starting the facade process.
#[derive(pretty_error_debug::Debug, Error)]
pub enum CliError {
    /// An I/O error, usually reading TLS material off disk.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed `--static-layer` entry.
    #[error("invalid --static-layer entry {0:?}: expected \"ref:file\" or \"ref:image\"")]
    InvalidStaticLayer(String),

    /// A reference string that failed to parse as an [`oci_client::Reference`].
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    /// Error returned from the server crate's configuration validation.
    #[error(transparent)]
    Server(#[from] registry_facade_server::ServerError),

    /// Error returned while connecting to the remote spec provider.
    #[error(transparent)]
    Proto(#[from] registry_facade_proto::ProtoError),

    /// Error returned from the synthesis pipeline while resolving a static image source.
    #[error(transparent)]
    Core(#[from] registry_facade_core::CoreError),
}
