//! `registry-facade-proto` carries the generated client for the remote image-spec RPC (§4.E,
//! §6) plus a thin connection wrapper that adds TLS/mTLS and request tracing.

use std::time::Duration;

use thiserror::Error;
use tonic::{
    metadata::MetadataValue,
    service::Interceptor,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity},
};
use tracing::debug;

pub mod pb {
    tonic::include_proto!("registry_facade.specprovider.v1");
}

pub use pb::spec_provider_client::SpecProviderClient;
pub use pb::{ContentLayer, GetImageSpecRequest, GetImageSpecResponse, ImageSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// mTLS material for connecting to a spec provider endpoint, all PEM-encoded.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// CA certificate used to verify the server.
    pub ca: Option<Vec<u8>>,
    /// Client certificate, for mutual TLS.
    pub cert: Option<Vec<u8>>,
    /// Client private key, for mutual TLS.
    pub key: Option<Vec<u8>>,
}

/// A connected channel to a remote spec provider, ready to be wrapped in a
/// [`SpecProviderClient`].
#[derive(Clone)]
pub struct SpecRpcChannel {
    channel: Channel,
}

/// Attaches a correlation id to every outgoing request's metadata.
#[derive(Clone)]
pub struct CorrelationIdInterceptor {
    correlation_id: String,
}

/// An error produced while establishing or configuring a spec RPC connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The configured endpoint address could not be parsed.
    #[error("invalid spec provider endpoint {0:?}: {1}")]
    InvalidEndpoint(String, #[source] tonic::transport::Error),

    /// The supplied TLS material could not be loaded.
    #[error("invalid TLS configuration: {0}")]
    InvalidTls(#[source] tonic::transport::Error),

    /// The endpoint could not be reached.
    #[error("failed to connect to spec provider: {0}")]
    ConnectFailed(#[source] tonic::transport::Error),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SpecRpcChannel {
    /// Connects to `addr` (e.g. `https://spec-provider.internal:9443`), optionally presenting
    /// and verifying TLS material. Plaintext is used when `tls` is `None`.
    pub async fn connect(addr: &str, tls: Option<TlsMaterial>) -> Result<Self, ProtoError> {
        let mut endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| ProtoError::InvalidEndpoint(addr.to_string(), e))?
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);

        if let Some(tls) = tls {
            let mut tls_config = ClientTlsConfig::new();
            if let Some(ca) = tls.ca {
                tls_config = tls_config.ca_certificate(Certificate::from_pem(ca));
            }
            if let (Some(cert), Some(key)) = (tls.cert, tls.key) {
                tls_config = tls_config.identity(Identity::from_pem(cert, key));
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(ProtoError::InvalidTls)?;
        }

        debug!(addr, "connecting to spec provider");
        let channel = endpoint.connect().await.map_err(ProtoError::ConnectFailed)?;

        Ok(Self { channel })
    }

    /// Builds a typed client over this channel, attaching a correlation id to every request.
    pub fn client(
        &self,
        correlation_id: impl Into<String>,
    ) -> SpecProviderClient<tonic::service::interceptor::InterceptedService<Channel, CorrelationIdInterceptor>> {
        SpecProviderClient::with_interceptor(
            self.channel.clone(),
            CorrelationIdInterceptor {
                correlation_id: correlation_id.into(),
            },
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Interceptor for CorrelationIdInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Ok(value) = MetadataValue::try_from(&self.correlation_id) {
            request.metadata_mut().insert("x-request-id", value);
        }
        Ok(request)
    }
}
