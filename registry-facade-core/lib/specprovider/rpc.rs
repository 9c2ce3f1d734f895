//! A [`SpecProvider`] backed by the remote image-spec RPC (§4.E, §6).

use async_trait::async_trait;
use bytes::Bytes;
use oci_client::Reference;
use registry_facade_proto::{pb, ProtoError, SpecRpcChannel};

use crate::{
    error::CoreError,
    model::{ContentLayerEntry, ImageSpec},
};

use super::SpecProvider;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Resolves specs by calling a remote `GetImageSpec` RPC over `tonic`.
pub struct RpcSpecProvider {
    channel: SpecRpcChannel,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RpcSpecProvider {
    /// Wraps an already-connected RPC channel.
    pub fn new(channel: SpecRpcChannel) -> Self {
        Self { channel }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SpecProvider for RpcSpecProvider {
    async fn get_spec(&self, remainder: &str) -> crate::error::CoreResult<ImageSpec> {
        let mut client = self.channel.client(uuid::Uuid::new_v4().to_string());

        let response = client
            .get_image_spec(pb::GetImageSpecRequest {
                name: remainder.to_string(),
            })
            .await
            .map_err(|status| map_status(remainder, status))?;

        let spec = response
            .into_inner()
            .spec
            .ok_or_else(|| CoreError::SpecMalformed(format!("{remainder}: response had no spec")))?;

        convert_spec(remainder, spec)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn map_status(remainder: &str, status: tonic::Status) -> CoreError {
    match status.code() {
        tonic::Code::NotFound => CoreError::SpecNotFound(remainder.to_string()),
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
            CoreError::SpecUnavailable(format!("{remainder}: {status}"))
        }
        _ => CoreError::SpecMalformed(format!("{remainder}: {status}")),
    }
}

fn convert_spec(remainder: &str, spec: pb::ImageSpec) -> crate::error::CoreResult<ImageSpec> {
    let base_ref: Reference = spec
        .base_ref
        .parse()
        .map_err(|_| CoreError::SpecMalformed(format!("{remainder}: invalid base_ref")))?;

    let ide_ref = if spec.ide_ref.is_empty() {
        None
    } else {
        Some(
            spec.ide_ref
                .parse()
                .map_err(|_| CoreError::SpecMalformed(format!("{remainder}: invalid ide_ref")))?,
        )
    };

    let content_layer = spec
        .content_layer
        .into_iter()
        .map(|layer| convert_content_layer(remainder, layer))
        .collect::<crate::error::CoreResult<Vec<_>>>()?;

    let entrypoint = (!spec.entrypoint.is_empty()).then_some(spec.entrypoint);
    let cmd = (!spec.cmd.is_empty()).then_some(spec.cmd);
    let user = (!spec.user.is_empty()).then_some(spec.user);

    Ok(ImageSpec::new(
        base_ref,
        ide_ref,
        content_layer,
        spec.env_vars,
        entrypoint,
        cmd,
        user,
    ))
}

fn convert_content_layer(
    remainder: &str,
    layer: pb::ContentLayer,
) -> crate::error::CoreResult<ContentLayerEntry> {
    let digest = layer
        .digest
        .parse()
        .map_err(|_| CoreError::SpecMalformed(format!("{remainder}: invalid content layer digest")))?;

    match layer.source {
        Some(pb::content_layer::Source::InlineData(data)) => Ok(ContentLayerEntry::Inline {
            media_type: layer.media_type,
            digest,
            size: layer.size,
            data: Bytes::from(data),
        }),
        Some(pb::content_layer::Source::RemoteUrl(url)) => Ok(ContentLayerEntry::Remote {
            media_type: layer.media_type,
            digest,
            size: layer.size,
            url: url
                .parse()
                .map_err(|_| CoreError::SpecMalformed(format!("{remainder}: invalid content layer url")))?,
        }),
        None => Err(CoreError::SpecMalformed(format!(
            "{remainder}: content layer has neither inline data nor a remote url"
        ))),
    }
}

impl From<ProtoError> for CoreError {
    fn from(err: ProtoError) -> Self {
        CoreError::SpecUnavailable(err.to_string())
    }
}
