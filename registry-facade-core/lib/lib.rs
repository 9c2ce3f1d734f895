//! `registry-facade-core` implements the manifest/blob synthesis pipeline that sits behind
//! the registry facade's HTTP front-end: resolving an `ImageSpec`, composing layers from
//! several upstream sources, rewriting the image config, and serving blobs with byte-range
//! support.

#![warn(missing_docs)]

pub mod config_modifier;
pub mod error;
pub mod layersource;
pub mod model;
pub mod router;
pub mod specprovider;
pub mod store;
pub mod synth;
pub mod upstream;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use model::*;
