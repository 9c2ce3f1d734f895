//! Config modifier (§4.F): rewrites an image config's JSON to reflect the synthesized layer set.
//!
//! Operates on `serde_json::Value` trees throughout rather than a typed config struct, so that
//! re-serialization always goes through `serde_json`'s default `BTreeMap`-backed `Map` (this
//! workspace does not enable the `preserve_order` feature) and therefore always emits keys in a
//! single deterministic order — required by invariant #1 (byte-identical synthesis).

use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use moka::future::Cache;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;

use crate::{
    error::{CoreError, CoreResult},
    model::Descriptor,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Config overrides carried by an [`crate::model::ImageSpec`], applied on top of the base
/// image's config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Environment variables to append, spec wins on key collision with the base image.
    pub env_vars: Vec<String>,
    /// Overrides the base image's entrypoint, if provided.
    pub entrypoint: Option<Vec<String>>,
    /// Overrides the base image's default command, if provided.
    pub cmd: Option<Vec<String>>,
    /// Overrides the base image's user, if provided.
    pub user: Option<String>,
}

/// Rewrites a base image config to add layers contributed by the composite layer source, and
/// applies the spec's config overrides. Caches diff_id computations (the expensive part: a full
/// gzip decompression pass) keyed by the layer's compressed digest.
#[derive(Clone)]
pub struct ConfigModifier {
    diff_id_cache: Cache<Digest, Digest>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConfigModifier {
    /// Creates a modifier with a diff_id cache bounded to `max_capacity` entries (no TTL —
    /// capacity-evicted only, since a diff_id never changes for a given compressed digest).
    pub fn new(max_capacity: u64) -> Self {
        Self {
            diff_id_cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Computes the diff_id (SHA-256 of the decompressed layer bytes) for a gzip'd layer,
    /// reusing a cached result if this compressed digest has been seen before.
    pub async fn diff_id_for(&self, compressed_digest: &Digest, gzip_bytes: &[u8]) -> CoreResult<Digest> {
        let compressed_digest = compressed_digest.clone();
        let gzip_bytes = gzip_bytes.to_vec();

        self.diff_id_cache
            .try_get_with(compressed_digest.clone(), async move {
                compute_diff_id(&gzip_bytes).await
            })
            .await
            .map_err(|arc_err| reclassify(&arc_err))
    }

    /// Rewrites `base_config_bytes` (the raw JSON bytes of the base image's config, as served)
    /// to append `added_layers`' diff_ids and history entries, and applies `overrides`. Returns
    /// the new config's serialized bytes and descriptor.
    ///
    /// `added_layers` must be given as `(descriptor, gzip_bytes)` pairs in the order they are
    /// stacked onto the base image, excluding any layer already present in the base config.
    pub async fn apply(
        &self,
        base_config_bytes: &[u8],
        added_layers: &[(Descriptor, Vec<u8>)],
        overrides: &ConfigOverrides,
    ) -> CoreResult<(bytes::Bytes, Descriptor)> {
        let mut config: serde_json::Value = serde_json::from_slice(base_config_bytes)?;

        let diff_ids = config
            .get_mut("rootfs")
            .and_then(|rootfs| rootfs.get_mut("diff_ids"))
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| CoreError::custom(anyhow::anyhow!("base config has no rootfs.diff_ids array")))?;

        let history = config
            .get_mut("history")
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| CoreError::custom(anyhow::anyhow!("base config has no history array")))?;

        for (descriptor, gzip_bytes) in added_layers {
            let diff_id = self.diff_id_for(descriptor.get_digest(), gzip_bytes).await?;
            diff_ids.push(serde_json::Value::String(diff_id.to_string()));
            history.push(serde_json::json!({
                "created_by": "registry-facade",
                "empty_layer": false,
            }));
        }

        apply_overrides(&mut config, overrides)?;

        let config_bytes = serde_json::to_vec(&config)?;
        let digest = crate::model::sha256_digest(&config_bytes);
        let descriptor = Descriptor::new(
            "application/vnd.oci.image.config.v1+json",
            digest,
            config_bytes.len() as u64,
            None,
            None,
        );

        Ok((bytes::Bytes::from(config_bytes), descriptor))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decompresses `gzip_bytes` and hashes the result, matching the decompression path used when
/// extracting a layer onto disk, minus the extraction.
async fn compute_diff_id(gzip_bytes: &[u8]) -> CoreResult<Digest> {
    let mut decoder = GzipDecoder::new(tokio::io::BufReader::new(gzip_bytes));
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = decoder.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize()))
        .parse()
        .expect("sha256 hex digest is always a valid Digest"))
}

fn apply_overrides(config: &mut serde_json::Value, overrides: &ConfigOverrides) -> CoreResult<()> {
    let config_obj = config
        .get_mut("config")
        .and_then(|v| v.as_object_mut())
        .ok_or_else(|| CoreError::custom(anyhow::anyhow!("base config has no config object")))?;

    if !overrides.env_vars.is_empty() {
        let overridden_keys: std::collections::HashSet<&str> = overrides
            .env_vars
            .iter()
            .filter_map(|kv| kv.split('=').next())
            .collect();

        let mut env: Vec<String> = config_obj
            .get("Env")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .filter(|kv| {
                        kv.split('=')
                            .next()
                            .is_none_or(|key| !overridden_keys.contains(key))
                    })
                    .collect()
            })
            .unwrap_or_default();

        env.extend(overrides.env_vars.iter().cloned());
        config_obj.insert(
            "Env".to_string(),
            serde_json::Value::Array(env.into_iter().map(serde_json::Value::String).collect()),
        );
    }

    if let Some(entrypoint) = &overrides.entrypoint {
        config_obj.insert(
            "Entrypoint".to_string(),
            serde_json::Value::Array(entrypoint.iter().cloned().map(serde_json::Value::String).collect()),
        );
    }

    if let Some(cmd) = &overrides.cmd {
        config_obj.insert(
            "Cmd".to_string(),
            serde_json::Value::Array(cmd.iter().cloned().map(serde_json::Value::String).collect()),
        );
    }

    if let Some(user) = &overrides.user {
        config_obj.insert("User".to_string(), serde_json::Value::String(user.clone()));
    }

    Ok(())
}

/// See [`crate::specprovider::CachedSpecProvider::reclassify`] — the same `Arc<CoreError>`
/// un-sharing trick, needed wherever a `moka` cache wraps a `CoreError`-returning future.
fn reclassify(err: &Arc<CoreError>) -> CoreError {
    match err.as_ref() {
        CoreError::IoError(io_err) => CoreError::custom(anyhow::anyhow!("diff_id computation failed: {io_err}")),
        other => CoreError::custom(anyhow::anyhow!("{other}")),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn base_config() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Entrypoint": ["/bin/sh"],
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:aaaa"],
            },
            "history": [{"created_by": "base", "empty_layer": false}],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn appends_diff_id_and_history_per_layer() {
        let modifier = ConfigModifier::new(128);
        let gz = gzip(b"layer contents");
        let digest = crate::model::sha256_digest(&gz);
        let descriptor = Descriptor::new("application/vnd.oci.image.layer.v1.tar+gzip", digest, gz.len() as u64, None, None);

        let (bytes, _) = modifier
            .apply(&base_config(), &[(descriptor, gz)], &ConfigOverrides::default())
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let diff_ids = value["rootfs"]["diff_ids"].as_array().unwrap();
        let history = value["history"].as_array().unwrap();
        assert_eq!(diff_ids.len(), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["created_by"], "registry-facade");
    }

    #[tokio::test]
    async fn env_override_replaces_colliding_keys_last_writer_wins() {
        let modifier = ConfigModifier::new(128);
        let overrides = ConfigOverrides {
            env_vars: vec!["PATH=/opt/bin".to_string(), "FOO=bar".to_string()],
            ..Default::default()
        };

        let (bytes, _) = modifier.apply(&base_config(), &[], &overrides).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let env: Vec<&str> = value["config"]["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();

        assert_eq!(env, vec!["PATH=/opt/bin", "FOO=bar"]);
    }

    #[tokio::test]
    async fn serialization_is_deterministic() {
        let modifier = ConfigModifier::new(128);
        let (bytes1, _) = modifier.apply(&base_config(), &[], &ConfigOverrides::default()).await.unwrap();
        let (bytes2, _) = modifier.apply(&base_config(), &[], &ConfigOverrides::default()).await.unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[tokio::test]
    async fn diff_id_computation_is_cached() {
        let modifier = ConfigModifier::new(128);
        let gz = gzip(b"cached layer");
        let digest = crate::model::sha256_digest(&gz);

        let a = modifier.diff_id_for(&digest, &gz).await.unwrap();
        let b = modifier.diff_id_for(&digest, &gz).await.unwrap();
        assert_eq!(a, b);
    }
}
