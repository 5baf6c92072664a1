//! Normalize the supported archive formats to a list of layers and an
//! image configuration.

mod config;
mod docker;
pub(crate) mod entries;
mod oci;

use std::{
    fmt,
    io::{self, Read},
    path::Path,
    str::FromStr,
};

use crate::{Digest, ExtractError, LayerSource};

use entries::{ArchiveIndex, EntryRef};

pub use config::{ContainerConfig, HistoryEntry, ImageConfig, RootFs};

/// Format of an image archive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    /// Output of `docker save`: a `manifest.json` and a tarball per layer.
    DockerArchive,

    /// OCI image layout: an `index.json` and content-addressed blobs.
    OciArchive,

    /// Tarball built by Kaniko. With a `manifest.json`, it is read like a
    /// Docker archive. Otherwise, the whole archive is a single layer.
    KanikoArchive,

    /// Detect the format from the archive contents.
    Unknown,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::DockerArchive => "docker-archive",
            ArchiveKind::OciArchive => "oci-archive",
            ArchiveKind::KanikoArchive => "kaniko-archive",
            ArchiveKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveKind {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker-archive" => Ok(ArchiveKind::DockerArchive),
            "oci-archive" => Ok(ArchiveKind::OciArchive),
            "kaniko-archive" => Ok(ArchiveKind::KanikoArchive),
            "unknown" => Ok(ArchiveKind::Unknown),
            _ => Err(ExtractError::UnsupportedArchive(s.to_owned())),
        }
    }
}

mod arch {
    #[cfg(target_arch = "aarch64")]
    pub(super) const DEFAULT: &str = "arm64";

    #[cfg(target_arch = "x86_64")]
    pub(super) const DEFAULT: &str = "amd64";

    #[cfg(target_arch = "riscv64")]
    pub(super) const DEFAULT: &str = "riscv64";

    #[cfg(not(any(
        target_arch = "aarch64",
        target_arch = "x86_64",
        target_arch = "riscv64"
    )))]
    pub(super) const DEFAULT: &str = "amd64";
}

const DEFAULT_OS: &str = "linux";

/// Platform to select in a multi-platform image, like `linux/arm64/v8`.
///
/// Architectures use the names from Go (`amd64`, `arm64`...).
///
/// # Examples
///
/// ```
/// # use oci_extract::Platform;
/// let platform: Platform = "linux/arm/v7".parse().unwrap();
///
/// assert_eq!(platform.os, "linux");
/// assert_eq!(platform.architecture, "arm");
/// assert_eq!(platform.variant.as_deref(), Some("v7"));
/// assert_eq!(platform.to_string(), "linux/arm/v7");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Platform {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }
}

impl Default for Platform {
    /// `linux` and the architecture of the current process.
    fn default() -> Self {
        Platform::new(DEFAULT_OS, arch::DEFAULT)
    }
}

impl FromStr for Platform {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();

        if parts.iter().any(|p| p.is_empty()) {
            return Err(ExtractError::InvalidPlatform(s.to_owned()));
        }

        match parts[..] {
            [os, architecture] => Ok(Platform::new(os, architecture)),

            [os, architecture, variant] => Ok(Platform {
                variant: Some(variant.to_owned()),
                ..Platform::new(os, architecture)
            }),

            _ => Err(ExtractError::InvalidPlatform(s.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;

        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }

        Ok(())
    }
}

/// Options to open an [`ImageArchive`].
#[derive(Clone, Debug)]
pub struct ArchiveOptions {
    pub kind: ArchiveKind,
    pub platform: Platform,
    pub verify_digests: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            kind: ArchiveKind::Unknown,
            platform: Platform::default(),
            verify_digests: true,
        }
    }
}

/// A layer blob inside the archive.
#[derive(Clone, Debug)]
pub(crate) struct LayerRef {
    id: String,
    entry: EntryRef,
    digest: Option<Digest>,
}

/// A blob referenced by the image that is not read as a layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedBlob {
    pub id: String,
    pub cause: String,
}

/// Layers and configuration found by a format reader.
#[derive(Default)]
struct Layout {
    layers: Vec<LayerRef>,
    manifest_layers: Vec<String>,
    config: Option<ImageConfig>,
    image_id: Option<String>,
    skipped: Vec<SkippedBlob>,
}

/// An image archive, with its layers in order (oldest first).
///
/// Opening an archive reads its metadata. Layers are read only when they
/// are passed to a [`LayerResolver`](crate::LayerResolver).
pub struct ImageArchive {
    index: ArchiveIndex,
    kind: ArchiveKind,
    layout: Layout,
}

impl ImageArchive {
    pub fn open(path: &Path, options: &ArchiveOptions) -> Result<Self, ExtractError> {
        Self::with_index(ArchiveIndex::open(path)?, options)
    }

    /// Read the archive from a stream. It is copied to a temporary file
    /// which is removed when the instance is dropped.
    pub fn from_reader(reader: impl Read, options: &ArchiveOptions) -> Result<Self, ExtractError> {
        Self::with_index(ArchiveIndex::from_reader(reader)?, options)
    }

    fn with_index(index: ArchiveIndex, options: &ArchiveOptions) -> Result<Self, ExtractError> {
        if index.is_empty() {
            return Err(ExtractError::InvalidArchive {
                kind: options.kind,
                reason: "the archive is empty".into(),
            });
        }

        let kind = match options.kind {
            ArchiveKind::Unknown => detect(&index),
            kind => kind,
        };

        tracing::debug!(%kind, entries = index.len(), "archive format");

        let verify = options.verify_digests;

        let layout = match kind {
            ArchiveKind::OciArchive => oci::read(&index, &options.platform, verify)?,

            ArchiveKind::DockerArchive => docker::read(&index, kind, verify)?,

            ArchiveKind::KanikoArchive | ArchiveKind::Unknown => {
                if index.contains(docker::MANIFEST) {
                    docker::read(&index, kind, verify)?
                } else {
                    flat(&index)
                }
            }
        };

        for skipped in &layout.skipped {
            tracing::debug!(blob = %skipped.id, cause = %skipped.cause, "blob skipped");
        }

        Ok(ImageArchive {
            index,
            kind,
            layout,
        })
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    pub fn layer_count(&self) -> usize {
        self.layout.layers.len()
    }

    /// Layers to read, from the oldest to the newest.
    pub fn layers(&self) -> impl Iterator<Item = ArchiveLayer<'_>> {
        self.layout.layers.iter().map(|layer| ArchiveLayer {
            index: &self.index,
            layer,
        })
    }

    /// Layer identifiers as listed by the manifest.
    pub fn manifest_layers(&self) -> &[String] {
        &self.layout.manifest_layers
    }

    pub fn config(&self) -> Option<&ImageConfig> {
        self.layout.config.as_ref()
    }

    /// Digest of the image configuration, like `sha256:<hex>`.
    pub fn image_id(&self) -> Option<&str> {
        self.layout.image_id.as_deref()
    }

    /// Blobs referenced by the image that are not read, like attestations
    /// or layers missing from the archive.
    pub fn skipped(&self) -> &[SkippedBlob] {
        &self.layout.skipped
    }
}

/// A layer in an [`ImageArchive`].
pub struct ArchiveLayer<'a> {
    index: &'a ArchiveIndex,
    layer: &'a LayerRef,
}

impl LayerSource for ArchiveLayer<'_> {
    fn id(&self) -> &str {
        &self.layer.id
    }

    fn length(&self) -> Option<u64> {
        Some(self.layer.entry.size)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        let reader = self.index.open_entry(self.layer.entry)?;

        Ok(match &self.layer.digest {
            Some(digest) => Box::new(digest.wrap_reader(reader)),
            None => Box::new(reader),
        })
    }
}

/// Detect the format from the files in the archive.
fn detect(index: &ArchiveIndex) -> ArchiveKind {
    if index.contains(oci::INDEX) {
        ArchiveKind::OciArchive
    } else if index.contains(docker::MANIFEST) {
        ArchiveKind::DockerArchive
    } else {
        ArchiveKind::KanikoArchive
    }
}

/// Identifier of the synthetic layer of a flat archive.
const FLAT_LAYER_ID: &str = "rootfs";

/// A tarball with the final filesystem, without layers.
fn flat(index: &ArchiveIndex) -> Layout {
    Layout {
        layers: vec![LayerRef {
            id: FLAT_LAYER_ID.to_owned(),
            entry: index.whole(),
            digest: None,
        }],
        ..Layout::default()
    }
}

#[test]
fn parse_platforms() {
    assert_eq!(
        "linux/amd64".parse::<Platform>().unwrap(),
        Platform::new("linux", "amd64")
    );

    for invalid in ["linux", "linux/", "/amd64", "a/b/c/d", ""] {
        assert!(
            matches!(
                invalid.parse::<Platform>(),
                Err(ExtractError::InvalidPlatform(_))
            ),
            "{invalid}"
        );
    }

    assert_eq!(Platform::default().os, "linux");
}

#[test]
fn archive_kind_names() {
    for kind in [
        ArchiveKind::DockerArchive,
        ArchiveKind::OciArchive,
        ArchiveKind::KanikoArchive,
    ] {
        assert_eq!(kind.as_str().parse::<ArchiveKind>().unwrap(), kind);
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            serde_json::Value::from(kind.as_str())
        );
    }

    assert!(matches!(
        "zip".parse::<ArchiveKind>(),
        Err(ExtractError::UnsupportedArchive(_))
    ));
}
