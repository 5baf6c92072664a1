//! OCI image layout.
//!
//! Refs:
//!
//! * <https://github.com/opencontainers/image-spec/blob/main/image-layout.md>
//! * <https://github.com/opencontainers/image-spec/blob/main/image-index.md>

use std::{collections::BTreeMap, str::FromStr};

use crate::{BlobKind, Digest, ExtractError, MediaType};

use super::{
    entries::ArchiveIndex, ArchiveKind, ImageConfig, LayerRef, Layout, Platform, SkippedBlob,
};

pub(super) const INDEX: &str = "index.json";

/// Maximum depth of indexes referencing other indexes.
const MAX_NESTED_INDEXES: usize = 8;

/// Annotation used by BuildKit to mark attestation manifests.
const REFERENCE_TYPE: &str = "vnd.docker.reference.type";

const ATTESTATION_MANIFEST: &str = "attestation-manifest";

#[derive(serde::Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: Option<String>,
    digest: Digest,
    platform: Option<DescriptorPlatform>,

    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(serde::Deserialize, Debug, Clone)]
struct DescriptorPlatform {
    architecture: String,
    os: String,
    variant: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct Index {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(serde::Deserialize, Debug)]
struct Manifest {
    config: Descriptor,

    #[serde(default)]
    layers: Vec<Descriptor>,
}

impl Descriptor {
    fn is_attestation(&self) -> bool {
        if self.annotations.get(REFERENCE_TYPE).map(String::as_str) == Some(ATTESTATION_MANIFEST) {
            return true;
        }

        matches!(
            &self.platform,
            Some(p) if p.os == "unknown" && p.architecture == "unknown"
        )
    }

    fn matches_platform(&self, platform: &Platform) -> bool {
        self.platform
            .as_ref()
            .is_some_and(|p| p.os == platform.os && p.architecture == platform.architecture)
    }

    fn variant(&self) -> Option<&str> {
        self.platform.as_ref().and_then(|p| p.variant.as_deref())
    }
}

fn invalid(reason: String) -> ExtractError {
    ExtractError::InvalidArchive {
        kind: ArchiveKind::OciArchive,
        reason,
    }
}

struct Reader<'a> {
    index: &'a ArchiveIndex,
    verify: bool,
    skipped: Vec<SkippedBlob>,
}

pub(super) fn read(
    index: &ArchiveIndex,
    platform: &Platform,
    verify: bool,
) -> Result<Layout, ExtractError> {
    if !index.contains(INDEX) {
        return Err(invalid(format!("missing {INDEX}")));
    }

    let mut reader = Reader {
        index,
        verify,
        skipped: Vec::new(),
    };

    let root: Index = index.read_json(INDEX, None)?;

    let mut candidates = Vec::new();
    reader.collect_manifests(root.manifests, 0, &mut candidates)?;

    let selected = select_manifest(candidates, platform)?;
    tracing::debug!(manifest = %selected.digest, %platform, "manifest selected");

    let manifest: Manifest = reader.read_blob(&selected.digest)?;
    let config: ImageConfig = reader.read_blob(&manifest.config.digest)?;

    let mut layers = Vec::with_capacity(manifest.layers.len());

    for descriptor in &manifest.layers {
        let digest = &descriptor.digest;

        // Check the media type before opening the blob, so big blobs
        // that are not layers are never read.
        let kind = MediaType::classify(descriptor.media_type.as_deref());
        if kind != BlobKind::Layer {
            reader.skip(
                digest,
                format!(
                    "not a filesystem layer ({})",
                    descriptor.media_type.as_deref().unwrap_or_default()
                ),
            );
            continue;
        }

        match index.get(&digest.blob_path()) {
            Some(entry) => layers.push(LayerRef {
                id: digest.to_string(),
                entry,
                digest: verify.then(|| digest.clone()),
            }),

            None => {
                tracing::warn!(layer = %digest, "layer is missing from the archive");
                reader.skip(digest, "missing from the archive".into());
            }
        }
    }

    if layers.is_empty() {
        return Err(invalid("no layers found in the image".into()));
    }

    Ok(Layout {
        layers,
        manifest_layers: manifest.layers.iter().map(|l| l.digest.to_string()).collect(),
        config: Some(config),
        image_id: Some(manifest.config.digest.to_string()),
        skipped: reader.skipped,
    })
}

impl Reader<'_> {
    fn read_blob<T>(&self, digest: &Digest) -> Result<T, ExtractError>
    where
        T: serde::de::DeserializeOwned,
    {
        let path = digest.blob_path();
        if !self.index.contains(&path) {
            return Err(invalid(format!("missing blob {digest}")));
        }

        self.index
            .read_json(&path, if self.verify { Some(digest) } else { None })
    }

    fn skip(&mut self, digest: &Digest, cause: String) {
        self.skipped.push(SkippedBlob {
            id: digest.to_string(),
            cause,
        });
    }

    /// Collect the image manifests from an index, following nested
    /// indexes. Attestations and unknown blobs are skipped.
    fn collect_manifests(
        &mut self,
        descriptors: Vec<Descriptor>,
        depth: usize,
        manifests: &mut Vec<Descriptor>,
    ) -> Result<(), ExtractError> {
        for descriptor in descriptors {
            if descriptor.is_attestation() {
                self.skip(&descriptor.digest, "attestation manifest".into());
                continue;
            }

            let kind = match descriptor.media_type.as_deref() {
                // Assume that entries without media type are manifests.
                None => BlobKind::Manifest,

                Some(mt) => match MediaType::from_str(mt) {
                    Ok(mt) => mt.kind(),
                    Err(_) => BlobKind::Other,
                },
            };

            match kind {
                BlobKind::Manifest => manifests.push(descriptor),

                BlobKind::Index => {
                    if depth >= MAX_NESTED_INDEXES {
                        return Err(invalid("too many nested indexes".into()));
                    }

                    let nested: Index = self.read_blob(&descriptor.digest)?;
                    self.collect_manifests(nested.manifests, depth + 1, manifests)?;
                }

                _ => {
                    let cause = format!(
                        "unexpected blob in index ({})",
                        descriptor.media_type.as_deref().unwrap_or_default()
                    );

                    self.skip(&descriptor.digest, cause);
                }
            }
        }

        Ok(())
    }
}

/// Select the manifest for `platform`.
///
/// A single manifest without platform (like images built by Docker with
/// no explicit platform) is always used. When several manifests match the
/// OS and the architecture, the variant must match too.
fn select_manifest(
    mut candidates: Vec<Descriptor>,
    platform: &Platform,
) -> Result<Descriptor, ExtractError> {
    if let [single] = &candidates[..] {
        if single.platform.is_none() {
            return Ok(candidates.remove(0));
        }
    }

    let mut matches: Vec<_> = candidates
        .into_iter()
        .filter(|d| d.matches_platform(platform))
        .collect();

    let selected = if matches.len() > 1 {
        matches
            .into_iter()
            .find(|d| d.variant() == platform.variant.as_deref())
    } else {
        matches.pop()
    };

    selected.ok_or_else(|| ExtractError::PlatformNotFound(platform.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(platform: Option<&str>) -> Descriptor {
        let platform = platform.map(|p| {
            let p: Platform = p.parse().unwrap();
            DescriptorPlatform {
                os: p.os,
                architecture: p.architecture,
                variant: p.variant,
            }
        });

        Descriptor {
            media_type: Some(MediaType::OciManifestV1.to_string()),
            digest: Digest::try_from(format!("sha256:{}", "0".repeat(64))).unwrap(),
            platform,
            annotations: BTreeMap::new(),
        }
    }

    fn select(candidates: &[Option<&str>], platform: &str) -> Result<Option<String>, ExtractError> {
        let candidates = candidates.iter().map(|p| descriptor(*p)).collect();
        let selected = select_manifest(candidates, &platform.parse().unwrap())?;

        Ok(selected.platform.map(|p| match p.variant {
            Some(v) => format!("{}/{}/{v}", p.os, p.architecture),
            None => format!("{}/{}", p.os, p.architecture),
        }))
    }

    #[test]
    fn single_manifest_without_platform() {
        assert_eq!(select(&[None], "linux/s390x").unwrap(), None);
    }

    #[test]
    fn select_by_os_and_architecture() {
        let candidates = [Some("linux/amd64"), Some("linux/arm64/v8"), Some("windows/amd64")];

        assert_eq!(
            select(&candidates, "linux/arm64").unwrap().as_deref(),
            Some("linux/arm64/v8")
        );

        assert_eq!(
            select(&candidates, "windows/amd64").unwrap().as_deref(),
            Some("windows/amd64")
        );

        assert!(matches!(
            select(&candidates, "linux/ppc64le"),
            Err(ExtractError::PlatformNotFound(p)) if p == "linux/ppc64le"
        ));
    }

    #[test]
    fn select_by_variant() {
        let candidates = [Some("linux/arm/v6"), Some("linux/arm/v7")];

        assert_eq!(
            select(&candidates, "linux/arm/v7").unwrap().as_deref(),
            Some("linux/arm/v7")
        );

        assert!(select(&candidates, "linux/arm").is_err());
    }

    #[test]
    fn detect_attestations() {
        let mut d = descriptor(Some("unknown/unknown"));
        assert!(d.is_attestation());

        d = descriptor(Some("linux/amd64"));
        assert!(!d.is_attestation());

        d.annotations
            .insert(REFERENCE_TYPE.into(), ATTESTATION_MANIFEST.into());
        assert!(d.is_attestation());
    }
}
