//! Shared fixtures for integration tests

pub mod registry;

use std::time::Duration;

use regmirror::image::Digest;
use regmirror::registry::{HostConfig, TlsMode};
use regmirror::RegClient;

use registry::RegistryState;

/// Host config for a mock registry: plain http, fast retries
pub fn plain_host(host: &str) -> HostConfig {
    let mut config = HostConfig::new(host);
    config.tls = TlsMode::Disabled;
    config
}

/// Client wired to mock registries with test-friendly retry timing
pub fn test_client(hosts: Vec<HostConfig>) -> RegClient {
    RegClient::builder()
        .hosts(hosts)
        .retry(3, Duration::from_millis(10), Duration::from_millis(100))
        .build()
}

/// Seed a two-layer image into a repository; returns the manifest digest
pub fn seed_image(state: &mut RegistryState, repo: &str, tag: &str) -> Digest {
    let config = br#"{"architecture": "amd64", "os": "linux"}"#.to_vec();
    let layer1 = b"layer-one-data".to_vec();
    let layer2 = b"layer-two-data".to_vec();

    let config_digest = state.put_blob(repo, &config);
    let layer1_digest = state.put_blob(repo, &layer1);
    let layer2_digest = state.put_blob(repo, &layer2);

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer1_digest,
                "size": layer1.len(),
            },
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer2_digest,
                "size": layer2.len(),
            },
        ],
    });
    let body = serde_json::to_vec(&manifest).unwrap();
    state.put_manifest(
        repo,
        Some(tag),
        "application/vnd.oci.image.manifest.v1+json",
        &body,
    );
    Digest::from_bytes(&body)
}
