//! An in-memory spec provider, for statically configured or development deployments that have
//! no remote spec RPC endpoint.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{error::CoreError, model::ImageSpec};

use super::SpecProvider;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A provider whose specs are fixed at construction time, keyed by remainder name.
pub struct StaticSpecProvider {
    specs: HashMap<String, ImageSpec>,
}

/// A provider that hands out the same [`ImageSpec`] for every remainder name. Registered by the
/// binary under the `static` provider name (§6 `staticLayer[]`) so that an operator running with
/// no remote spec provider still has a working pull path whose layers come entirely from the
/// operator-configured static sources (§4.C) rather than from per-workspace RPC resolution.
pub struct UniformSpecProvider {
    spec: ImageSpec,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StaticSpecProvider {
    /// Creates a provider serving exactly the given `(remainder, spec)` pairs.
    pub fn new(specs: impl IntoIterator<Item = (String, ImageSpec)>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }
}

impl UniformSpecProvider {
    /// Creates a provider that serves `spec` for any remainder.
    pub fn new(spec: ImageSpec) -> Self {
        Self { spec }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SpecProvider for StaticSpecProvider {
    async fn get_spec(&self, remainder: &str) -> crate::error::CoreResult<ImageSpec> {
        self.specs
            .get(remainder)
            .cloned()
            .ok_or_else(|| CoreError::SpecNotFound(remainder.to_string()))
    }
}

#[async_trait]
impl SpecProvider for UniformSpecProvider {
    async fn get_spec(&self, _remainder: &str) -> crate::error::CoreResult<ImageSpec> {
        Ok(self.spec.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
