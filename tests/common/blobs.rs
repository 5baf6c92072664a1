use std::{
    cell::RefCell,
    fmt,
    io::{self, Read, Write},
    path::Path,
    rc::Rc,
};

use flate2::write::GzEncoder;
use oci_extract::MediaType;
use serde::ser::SerializeStruct;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: String,
    pub data: Rc<[u8]>,
    pub annotations: Vec<(&'static str, &'static str)>,
}

impl serde::Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("Blob", 4)?;
        s.serialize_field("mediaType", self.media_type.as_str())?;
        s.serialize_field("digest", &self.digest())?;
        s.serialize_field("size", &self.data.len())?;

        if !self.annotations.is_empty() {
            let annotations: serde_json::Map<_, _> = self
                .annotations
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
                .collect();

            s.serialize_field("annotations", &annotations)?;
        }

        s.end()
    }
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Rc<[u8]>>) -> Blob {
        let data = data.into();
        let digest = sha256_hex(&data);

        Blob {
            media_type,
            digest,
            data,
            annotations: Vec::new(),
        }
    }

    pub fn json(media_type: MediaType, value: &serde_json::Value) -> Blob {
        Blob::new(media_type, serde_json::to_vec(value).unwrap())
    }

    /// Digest as `sha256:<hex>`.
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Path of the blob in an OCI layout.
    pub fn blob_path(&self) -> String {
        format!("blobs/sha256/{}", self.digest)
    }

    pub fn annotate(mut self, key: &'static str, value: &'static str) -> Self {
        self.annotations.push((key, value));
        self
    }

    /// Return a builder to create a layer. The media type determines the
    /// compression.
    pub fn archive(media_type: MediaType) -> BlobArchive {
        let buffer = SharedBuffer(Rc::new(Vec::with_capacity(4096).into()));

        let stream: Box<dyn Write> = match media_type {
            MediaType::OciFsTarGzip | MediaType::DockerFsTarGzip => {
                Box::new(GzEncoder::new(buffer.clone(), Default::default()))
            }

            #[cfg(feature = "zstd")]
            MediaType::OciFsTarZstd => Box::new(
                zstd::stream::write::Encoder::new(buffer.clone(), 0)
                    .unwrap()
                    .auto_finish(),
            ),

            _ => Box::new(buffer.clone()),
        };

        BlobArchive {
            media_type,
            buffer,
            archive: tar::Builder::new(stream),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    HexString(hasher.finalize()).to_string()
}

pub struct BlobArchive {
    media_type: MediaType,
    buffer: SharedBuffer,
    archive: tar::Builder<Box<dyn Write>>,
}

#[derive(Clone)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobArchive {
    pub fn build(mut self) -> Blob {
        self.archive.finish().unwrap();
        drop(self.archive.into_inner().unwrap());

        Blob::new(self.media_type, self.buffer.0.take())
    }

    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::dir());
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    pub fn regular(self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        self.stream(path, data.len() as u64, data)
    }

    /// Add a file of `size` bytes, all set to `byte`, without keeping it
    /// in memory.
    pub fn filled(self, path: impl AsRef<Path>, size: u64, byte: u8) -> Self {
        self.stream(path, size, io::repeat(byte).take(size))
    }

    fn stream(mut self, path: impl AsRef<Path>, size: u64, data: impl Read) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::file());
        header.set_size(size);
        header.set_cksum();
        self.archive.append(&header, data).unwrap();
        self
    }

    pub fn symlink(mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::symlink());
        header.set_size(0);
        self.archive.append_link(&mut header, path, target).unwrap();
        self
    }
}

/// Encode a byte buffer as hex string.
struct HexString<T>(T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}
