//! `registry-facade-cli` implements the command-line entrypoint for the registry facade server.

#![warn(missing_docs)]

pub mod args;
pub mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::Args;
pub use error::*;
