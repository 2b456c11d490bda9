//! Registry access (spec §4.3 "pull" stage): fetches the manifest, config,
//! and layer blobs for a parsed [`super::reference::ImageReference`] into a
//! per-pull staging directory. Delegates the actual registry protocol to
//! `oci-client` rather than reimplementing it — only reference *parsing*
//! (see [`super::reference`]) is hand-rolled to match spec-mandated rules.

use crate::error::{Error, Result};
use crate::oci::reference::ImageReference;
use crate::resilience::{with_retry, with_timeout, CircuitBreaker, RetryOptions};
use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use std::path::{Path, PathBuf};

const PULL_TIMEOUT_MS: u64 = 30_000;

pub struct PulledImage {
    pub digest: String,
    pub layer_paths: Vec<PathBuf>,
}

fn to_oci_client_reference(image: &ImageReference) -> Result<Reference> {
    let text = image.digest.as_ref().map_or_else(
        || {
            format!(
                "{}/{}:{}",
                image.registry,
                image.repository,
                image.tag.as_deref().unwrap_or("latest")
            )
        },
        |digest| format!("{}/{}@{}", image.registry, image.repository, digest),
    );
    text.parse()
        .map_err(|e: oci_client::ParseError| Error::ImagePull { reference: image.normalized.clone(), cause: e.to_string() })
}

/// Pulls the manifest, config, and every layer blob into `staging_dir`,
/// which the caller must have already created. Layers are streamed
/// straight to disk — memory usage stays O(chunk size) per layer, not
/// O(image size). Every registry round trip goes through `breaker` and is
/// retried with backoff on transient failure, per the C2 stack.
pub async fn pull(image: &ImageReference, staging_dir: &Path, breaker: &CircuitBreaker) -> Result<PulledImage> {
    let reference = to_oci_client_reference(image)?;
    let client = Client::new(ClientConfig::default());
    let auth = RegistryAuth::Anonymous;
    let retry_opts = RetryOptions::default();

    let (manifest, digest, _config_json) = breaker
        .call(|| {
            with_retry(&retry_opts, |_| true, || {
                with_timeout(
                    async {
                        client
                            .pull_manifest_and_config(&reference, &auth)
                            .await
                            .map_err(|e| Error::ImagePull { reference: image.normalized.clone(), cause: e.to_string() })
                    },
                    PULL_TIMEOUT_MS,
                    Some("oci pull_manifest_and_config"),
                )
            })
        })
        .await?;

    let mut layer_paths = Vec::with_capacity(manifest.layers.len());
    for (i, layer) in manifest.layers.iter().enumerate() {
        let layer_path = staging_dir.join(format!("layer-{i}.tar"));
        breaker
            .call(|| {
                with_retry(&retry_opts, |_| true, || {
                    with_timeout(
                        async {
                            let mut file = tokio::fs::File::create(&layer_path).await?;
                            client
                                .pull_blob(&reference, layer, &mut file)
                                .await
                                .map_err(|e| Error::ImagePull { reference: image.normalized.clone(), cause: e.to_string() })
                        },
                        PULL_TIMEOUT_MS,
                        Some("oci pull_blob"),
                    )
                })
            })
            .await?;
        layer_paths.push(layer_path);
    }

    Ok(PulledImage { digest, layer_paths })
}
