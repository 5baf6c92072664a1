use std::{fmt, str::FromStr};

/// Generate the `MediaType` enum, its `FromStr` and `Display`
/// implementations, and the associated constant `ALL` with all
/// the valid values.
macro_rules! media_types {
    ($($variant:ident = $mediatype:expr,)*) => {
        /// Known media types.
        #[non_exhaustive]
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum MediaType {
            $(
                #[doc = concat!("Variant for `", $mediatype, "`.")]
                $variant,
            )*
        }

        impl MediaType {
            /// List with all known media types.
            pub const ALL: &[&str] = &[ $($mediatype),* ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MediaType::$variant => $mediatype,)*
                }
            }
        }

        impl FromStr for MediaType {
            type Err = InvalidMediaType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($mediatype => Ok(MediaType::$variant),)*
                    _ => Err(InvalidMediaType),
                }
            }
        }

        impl fmt::Display for MediaType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    }
}

media_types!(
    DockerFsTar = "application/vnd.docker.image.rootfs.diff.tar",
    DockerFsTarGzip = "application/vnd.docker.image.rootfs.diff.tar.gzip",
    DockerForeignFsTarGzip = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
    DockerImageV1 = "application/vnd.docker.container.image.v1+json",
    DockerManifestList = "application/vnd.docker.distribution.manifest.list.v2+json",
    DockerManifestV2 = "application/vnd.docker.distribution.manifest.v2+json",
    InTotoJson = "application/vnd.in-toto+json",
    OciConfig = "application/vnd.oci.image.config.v1+json",
    OciEmpty = "application/vnd.oci.empty.v1+json",
    OciFsTar = "application/vnd.oci.image.layer.v1.tar",
    OciFsTarGzip = "application/vnd.oci.image.layer.v1.tar+gzip",
    OciFsTarZstd = "application/vnd.oci.image.layer.v1.tar+zstd",
    OciNondistributableFsTarGzip = "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    OciImageIndex = "application/vnd.oci.image.index.v1+json",
    OciManifestV1 = "application/vnd.oci.image.manifest.v1+json",
);

/// Broad classification of a blob, used to decide how to read it
/// before opening it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlobKind {
    /// Filesystem changeset.
    Layer,

    /// Single-platform image manifest.
    Manifest,

    /// Manifest list / image index.
    Index,

    /// Image configuration.
    Config,

    /// Anything else: attestations, empty descriptors, signatures...
    Other,
}

impl MediaType {
    pub fn kind(&self) -> BlobKind {
        match self {
            MediaType::DockerFsTar
            | MediaType::DockerFsTarGzip
            | MediaType::DockerForeignFsTarGzip
            | MediaType::OciFsTar
            | MediaType::OciFsTarGzip
            | MediaType::OciFsTarZstd
            | MediaType::OciNondistributableFsTarGzip => BlobKind::Layer,

            MediaType::DockerManifestV2 | MediaType::OciManifestV1 => BlobKind::Manifest,

            MediaType::DockerManifestList | MediaType::OciImageIndex => BlobKind::Index,

            MediaType::DockerImageV1 | MediaType::OciConfig => BlobKind::Config,

            MediaType::InTotoJson | MediaType::OciEmpty => BlobKind::Other,
        }
    }

    /// Classify a media type string found in a descriptor.
    ///
    /// Missing media types are assumed to describe a layer, since old
    /// Docker archives do not annotate them. Unknown media types are
    /// [`BlobKind::Other`].
    pub fn classify(media_type: Option<&str>) -> BlobKind {
        match media_type {
            None => BlobKind::Layer,
            Some(s) => MediaType::from_str(s)
                .map(|mt| mt.kind())
                .unwrap_or(BlobKind::Other),
        }
    }
}

#[derive(Debug)]
pub struct InvalidMediaType;

struct MediaTypeVisitor;

impl serde::de::Visitor<'_> for MediaTypeVisitor {
    type Value = MediaType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("Media type for OCI/Docker objects.")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        MediaType::from_str(v).map_err(|_| E::custom(format!("Unknown type: {v}")))
    }
}

impl<'de> serde::Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(MediaTypeVisitor)
    }
}

#[test]
fn media_type_in_json() {
    #[derive(serde::Deserialize, Debug)]
    struct Example {
        mt: MediaType,
    }

    assert!(matches!(
        serde_json::from_str(r#"{"mt": "application/vnd.oci.image.index.v1+json"}"#),
        Ok(Example {
            mt: MediaType::OciImageIndex
        })
    ));
}

#[test]
fn classify_descriptors() {
    assert_eq!(MediaType::classify(None), BlobKind::Layer);
    assert_eq!(
        MediaType::classify(Some("application/vnd.oci.image.layer.v1.tar+zstd")),
        BlobKind::Layer
    );
    assert_eq!(
        MediaType::classify(Some("application/vnd.in-toto+json")),
        BlobKind::Other
    );
    assert_eq!(
        MediaType::classify(Some("application/vnd.dev.cosign.simplesigning.v1+json")),
        BlobKind::Other
    );
    assert_eq!(
        MediaType::classify(Some("application/vnd.docker.distribution.manifest.list.v2+json")),
        BlobKind::Index
    );
}
