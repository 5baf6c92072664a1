//! Write image archives in the formats produced by `docker save`,
//! `buildx --output type=oci`, and Kaniko.

use std::{fs::File, path::Path};

use oci_extract::MediaType;
use serde_json::json;

use super::blobs::Blob;

pub const OS: &str = "linux";

pub const ARCH: &str = "amd64";

pub const LABEL: (&str, &str) = ("org.example.test", "yes");

pub const CREATED: &str = "2024-10-01T12:00:00Z";

/// Tar archive written to a file.
pub struct ArchiveWriter(tar::Builder<File>);

impl ArchiveWriter {
    pub fn create(path: &Path) -> Self {
        ArchiveWriter(tar::Builder::new(File::create(path).unwrap()))
    }

    pub fn file(&mut self, name: &str, data: &[u8]) -> &mut Self {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::file());
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.0.append(&header, data).unwrap();
        self
    }

    pub fn symlink(&mut self, name: &str, target: &str) -> &mut Self {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o777);
        header.set_entry_type(tar::EntryType::symlink());
        header.set_size(0);
        self.0.append_link(&mut header, name, target).unwrap();
        self
    }

    pub fn finish(&mut self) {
        self.0.finish().unwrap();
    }
}

/// Image configuration for `platform` (`os/arch[/variant]`).
pub fn config(platform: &str, layers: &[Blob]) -> Blob {
    let mut parts = platform.split('/');
    let os = parts.next().unwrap();
    let architecture = parts.next().unwrap();

    let mut config = json!({
        "architecture": architecture,
        "os": os,
        "created": CREATED,
        "config": {
            "Env": ["PATH=/usr/bin:/bin"],
            "Cmd": ["/bin/sh"],
            "Labels": {},
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": layers.iter().map(|l| l.digest()).collect::<Vec<_>>(),
        },
        "history": [{ "created_by": "test" }],
    });

    config["config"]["Labels"][LABEL.0] = json!(LABEL.1);

    if let Some(variant) = parts.next() {
        config["variant"] = json!(variant);
    }

    Blob::json(MediaType::OciConfig, &config)
}

/// Write a `docker save` archive, with layers in `<id>/layer.tar`.
///
/// Layers in `missing` are listed in the manifest but not written.
pub fn docker_archive(path: &Path, layers: &[Blob], missing: &[Blob]) -> Blob {
    let config = config(&format!("{OS}/{ARCH}"), layers);

    let layer_name = |blob: &Blob| format!("{}/layer.tar", blob.digest);

    let manifest = json!([{
        "Config": format!("{}.json", config.digest),
        "RepoTags": ["test:latest"],
        "Layers": layers.iter().chain(missing).map(layer_name).collect::<Vec<_>>(),
    }]);

    let mut writer = ArchiveWriter::create(path);

    writer
        .file("manifest.json", &serde_json::to_vec(&manifest).unwrap())
        .file(&format!("{}.json", config.digest), &config.data);

    for layer in layers {
        writer.file(&layer_name(layer), &layer.data);
    }

    writer.finish();
    config
}

/// An image in an OCI layout.
pub struct OciImage {
    pub platform: Option<String>,
    pub config: Blob,
    pub layers: Vec<Blob>,
}

impl OciImage {
    pub fn new(platform: &str, layers: Vec<Blob>) -> Self {
        OciImage {
            platform: Some(platform.to_owned()),
            config: config(platform, &layers),
            layers,
        }
    }

    /// Image without platform in the index, like the ones exported by
    /// `docker save` since Docker 25.
    pub fn without_platform(layers: Vec<Blob>) -> Self {
        OciImage {
            platform: None,
            config: config(&format!("{OS}/{ARCH}"), &layers),
            layers,
        }
    }

    fn manifest(&self) -> Blob {
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MediaType::OciManifestV1.as_str(),
            "config": &self.config,
            "layers": &self.layers,
        });

        Blob::json(MediaType::OciManifestV1, &manifest)
    }

    fn descriptor(&self, manifest: &Blob) -> serde_json::Value {
        let mut descriptor = serde_json::to_value(manifest).unwrap();

        if let Some(platform) = &self.platform {
            let mut parts = platform.split('/');
            descriptor["platform"] = json!({
                "os": parts.next(),
                "architecture": parts.next(),
            });

            if let Some(variant) = parts.next() {
                descriptor["platform"]["variant"] = json!(variant);
            }
        }

        descriptor
    }
}

/// Builder for an OCI layout archive.
#[derive(Default)]
pub struct OciArchive {
    blobs: Vec<Blob>,
    manifests: Vec<serde_json::Value>,
    nested: bool,
}

impl OciArchive {
    pub fn new() -> Self {
        OciArchive::default()
    }

    pub fn image(mut self, image: OciImage) -> Self {
        let manifest = image.manifest();

        self.manifests.push(image.descriptor(&manifest));
        self.blobs.push(manifest);
        self.blobs.push(image.config);
        self.blobs.extend(image.layers);
        self
    }

    /// Add an attestation manifest, like the ones created by BuildKit.
    ///
    /// Its layer is a big in-toto document, which must not be read.
    pub fn attestation(mut self) -> Self {
        let statement = Blob::new(MediaType::InTotoJson, vec![b'{'; 1 << 20])
            .annotate("in-toto.io/predicate-type", "https://spdx.dev/Document");

        let image = OciImage {
            platform: Some("unknown/unknown".into()),
            config: Blob::json(
                MediaType::OciConfig,
                &json!({"architecture": "unknown", "os": "unknown"}),
            ),
            layers: vec![statement],
        };

        let manifest = image.manifest();
        let mut descriptor = image.descriptor(&manifest);
        descriptor["annotations"] = json!({ "vnd.docker.reference.type": "attestation-manifest" });

        self.manifests.push(descriptor);
        self.blobs.push(manifest);
        self.blobs.push(image.config);
        self.blobs.extend(image.layers);
        self
    }

    /// Put the manifests in a nested index, like `docker save` does.
    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn write(self, path: &Path) {
        let mut index = json!({
            "schemaVersion": 2,
            "mediaType": MediaType::OciImageIndex.as_str(),
            "manifests": self.manifests,
        });

        let mut blobs = self.blobs;

        if self.nested {
            let nested = Blob::json(MediaType::OciImageIndex, &index);
            index["manifests"] = json!([&nested]);
            blobs.push(nested);
        }

        let mut writer = ArchiveWriter::create(path);

        writer
            .file("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)
            .file("index.json", &serde_json::to_vec(&index).unwrap());

        for blob in &blobs {
            writer.file(&blob.blob_path(), &blob.data);
        }

        writer.finish();
    }
}

/// Write a Kaniko tarball without `manifest.json`: the archive is the
/// root filesystem.
pub fn flat_archive(path: &Path, layer: &Blob) {
    std::fs::write(path, &layer.data).unwrap();
}
