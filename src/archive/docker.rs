//! Archives with a `manifest.json`, created by `docker save` or Kaniko.
//!
//! Ref: <https://github.com/moby/docker-image-spec/blob/main/spec.md>

use crate::{Digest, ExtractError};

use super::{entries::ArchiveIndex, ArchiveKind, ImageConfig, LayerRef, Layout, SkippedBlob};

pub(super) const MANIFEST: &str = "manifest.json";

#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,

    #[serde(default)]
    layers: Vec<String>,
}

/// Read the first image of `manifest.json`.
///
/// Layers listed in the manifest but missing in the archive are skipped.
pub(super) fn read(
    index: &ArchiveIndex,
    kind: ArchiveKind,
    verify: bool,
) -> Result<Layout, ExtractError> {
    let invalid = |reason: String| ExtractError::InvalidArchive { kind, reason };

    if !index.contains(MANIFEST) {
        return Err(invalid(format!("missing {MANIFEST}")));
    }

    let manifests: Vec<ManifestEntry> = index.read_json(MANIFEST, None)?;

    let Some(manifest) = manifests.into_iter().next() else {
        return Err(invalid(format!("no images in {MANIFEST}")));
    };

    if !index.contains(&manifest.config) {
        return Err(invalid(format!("missing image config {}", manifest.config)));
    }

    // Only blobs from an OCI layout are named by their digest.
    let content_digest = |name: &str| match verify {
        true => Digest::from_blob_path(name),
        false => None,
    };

    let config: ImageConfig =
        index.read_json(&manifest.config, content_digest(&manifest.config).as_ref())?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    let mut skipped = Vec::new();

    for name in &manifest.layers {
        match index.get(name) {
            Some(entry) => layers.push(LayerRef {
                id: name.clone(),
                entry,
                digest: content_digest(name),
            }),

            None => {
                tracing::warn!(layer = %name, "layer in manifest.json is missing from the archive");

                skipped.push(SkippedBlob {
                    id: name.clone(),
                    cause: "missing from the archive".into(),
                });
            }
        }
    }

    if layers.is_empty() {
        return Err(invalid("no layers found in the image".into()));
    }

    Ok(Layout {
        layers,
        image_id: Some(image_id(&manifest.config)),
        manifest_layers: manifest.layers,
        config: Some(config),
        skipped,
    })
}

/// Compute the image ID from the name of its configuration file.
///
/// The name can be `<hex>.json` (`docker save`), `blobs/sha256/<hex>`
/// (`docker save` since Docker 25), or `sha256:<hex>` (Kaniko).
fn image_id(config_name: &str) -> String {
    if let Some(digest) = Digest::from_blob_path(config_name) {
        return digest.to_string();
    }

    let name = config_name.rsplit('/').next().unwrap_or(config_name);
    let name = name.strip_suffix(".json").unwrap_or(name);

    if name.contains(':') {
        name.to_owned()
    } else {
        format!("sha256:{name}")
    }
}

#[test]
fn image_id_from_config_name() {
    const HEX: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    for name in [
        format!("{HEX}.json"),
        format!("blobs/sha256/{HEX}"),
        format!("sha256:{HEX}"),
    ] {
        assert_eq!(image_id(&name), format!("sha256:{HEX}"));
    }
}
