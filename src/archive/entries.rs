//! Index of the entries in the outer tarball of an image archive.
//!
//! The archive is read once to locate every file. Later, each entry is
//! read directly from its offset, so layers are never copied.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufReader, Read, Seek, SeekFrom, Take},
    path::Path,
};

use tempfile::NamedTempFile;

use crate::{
    compression::{self, Compression},
    extractor::pattern::normalize_path,
    try_io, Digest, ExtractError,
};

/// Location of the data of an entry in the archive file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryRef {
    pub offset: u64,
    pub size: u64,
}

enum Backing {
    File(File),

    /// Temporary copy of a stream, or of a compressed archive. It is
    /// removed on drop.
    Temp(NamedTempFile),
}

impl Backing {
    fn file(&self) -> &File {
        match self {
            Backing::File(f) => f,
            Backing::Temp(t) => t.as_file(),
        }
    }
}

pub(crate) struct ArchiveIndex {
    backing: Backing,
    len: u64,
    entries: BTreeMap<String, EntryRef>,
}

impl ArchiveIndex {
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ExtractError::ArchiveNotFound(path.to_owned()))
            }
            Err(e) => return Err(ExtractError::Io(e, path.to_owned())),
        };

        if !metadata.is_file() {
            return Err(ExtractError::NotAFile(path.to_owned()));
        }

        let mut file = try_io!(path, File::open(path));

        let compression = try_io!(path, sniff(&mut file));

        if compression == Compression::None {
            Self::index(Backing::File(file), path)
        } else {
            tracing::debug!(?compression, path = %path.display(), "decompressing archive");
            Self::spool(BufReader::new(file), path)
        }
    }

    /// Copy `reader` to a temporary file, and index it.
    pub fn from_reader(reader: impl Read) -> Result<Self, ExtractError> {
        Self::spool(reader, Path::new("<stream>"))
    }

    fn spool(reader: impl Read, name: &Path) -> Result<Self, ExtractError> {
        let (_, mut reader) = compression::decompress_maybe(reader).map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported {
                ExtractError::UnsupportedCompression(name.display().to_string())
            } else {
                ExtractError::Io(e, name.to_owned())
            }
        })?;

        let mut temp = try_io!(name, NamedTempFile::new());
        try_io!(name, io::copy(&mut reader, &mut temp));

        Self::index(Backing::Temp(temp), name)
    }

    fn index(backing: Backing, name: &Path) -> Result<Self, ExtractError> {
        let invalid = |e: io::Error| ExtractError::InvalidArchive {
            kind: super::ArchiveKind::Unknown,
            reason: e.to_string(),
        };

        let mut file = backing.file();
        let len = try_io!(name, file.seek(SeekFrom::End(0)));
        try_io!(name, file.rewind());

        let mut entries = BTreeMap::new();
        let mut links = Vec::new();

        let mut archive = tar::Archive::new(file);
        for entry in archive.entries_with_seek().map_err(invalid)? {
            let entry = entry.map_err(invalid)?;

            let Some(key) = entry_key(&entry.path_bytes()) else {
                continue;
            };

            let entry_type = entry.header().entry_type();

            if entry_type.is_file() {
                let location = EntryRef {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                };

                entries.insert(key, location);
            } else if entry_type.is_symlink() || entry_type.is_hard_link() {
                // Newer versions of `docker save` link the legacy layer
                // paths to the blobs of the OCI layout.
                if let Some(target) = entry.link_name_bytes() {
                    let target = String::from_utf8_lossy(&target);
                    let base = match entry_type.is_symlink() {
                        true => key.rsplit_once('/').map(|(p, _)| p).unwrap_or(""),
                        false => "",
                    };

                    if let Some(target) = resolve_link(base, &target) {
                        links.push((key, target));
                    }
                }
            }
        }

        for (key, target) in links {
            if let Some(location) = entries.get(&target).copied() {
                entries.entry(key).or_insert(location);
            }
        }

        tracing::debug!(entries = entries.len(), len, "archive indexed");

        Ok(ArchiveIndex {
            backing,
            len,
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Find an entry by its name. `./` prefixes are ignored.
    pub fn get(&self, name: &str) -> Option<EntryRef> {
        let key = entry_key(name.as_bytes())?;
        self.entries.get(&key).copied()
    }

    /// The whole archive file, as a single entry.
    pub fn whole(&self) -> EntryRef {
        EntryRef {
            offset: 0,
            size: self.len,
        }
    }

    pub fn open_entry(&self, entry: EntryRef) -> io::Result<Take<&File>> {
        let mut file = self.backing.file();
        file.seek(SeekFrom::Start(entry.offset))?;
        Ok(file.take(entry.size))
    }

    /// Parse a JSON document from the entry `name`.
    ///
    /// If `digest` is present, the data is verified against it.
    pub fn read_json<T>(&self, name: &str, digest: Option<&Digest>) -> Result<T, ExtractError>
    where
        T: serde::de::DeserializeOwned,
    {
        let entry = self.get(name).ok_or_else(|| {
            let error = io::Error::new(io::ErrorKind::NotFound, "Missing entry in the archive.");
            ExtractError::Io(error, name.into())
        })?;

        let reader = try_io!(name, self.open_entry(entry));

        let result = match digest {
            Some(d) => serde_json::from_reader(BufReader::new(d.wrap_reader(reader))),
            None => serde_json::from_reader(BufReader::new(reader)),
        };

        result.map_err(|source| ExtractError::Json {
            path: name.to_owned(),
            source,
        })
    }
}

/// Detect the compression of a file, and rewind it.
fn sniff(file: &mut File) -> io::Result<Compression> {
    let mut magic = [0; 4];
    let n = compression::read_prefix(file, &mut magic)?;
    file.rewind()?;
    Ok(Compression::detect(&magic[..n]))
}

/// Name of an entry, without the leading `/`.
fn entry_key(path: &[u8]) -> Option<String> {
    let path = std::str::from_utf8(path).ok()?;
    let normalized = normalize_path(path).ok()?;

    match normalized.strip_prefix('/') {
        Some("") | None => None,
        Some(key) => Some(key.to_owned()),
    }
}

/// Resolve the target of a link in the archive. Symbolic links are
/// relative to `base`; hard links are relative to the root.
fn resolve_link(base: &str, target: &str) -> Option<String> {
    let mut components: Vec<&str> = Vec::new();

    if !target.starts_with('/') {
        components.extend(base.split('/').filter(|c| !c.is_empty()));
    }

    for component in target.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                components.pop()?;
            }
            c => components.push(c),
        }
    }

    (!components.is_empty()).then(|| components.join("/"))
}

#[test]
fn entry_keys() {
    assert_eq!(entry_key(b"./manifest.json").as_deref(), Some("manifest.json"));
    assert_eq!(entry_key(b"abc/layer.tar").as_deref(), Some("abc/layer.tar"));
    assert_eq!(entry_key(b"./"), None);
    assert_eq!(entry_key(b"../x"), None);
}

#[test]
fn link_targets() {
    assert_eq!(
        resolve_link("abc", "../blobs/sha256/00").as_deref(),
        Some("blobs/sha256/00")
    );
    assert_eq!(resolve_link("", "blobs/sha256/00").as_deref(), Some("blobs/sha256/00"));
    assert_eq!(resolve_link("a", "/b/c").as_deref(), Some("b/c"));
    assert_eq!(resolve_link("", "../x"), None);
}

#[cfg(test)]
fn build_archive(entries: &[(&str, &[u8])]) -> NamedTempFile {
    let mut builder = tar::Builder::new(NamedTempFile::new().unwrap());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    builder
        .append_link(&mut header, "legacy/layer.tar", "../blobs/sha256/00")
        .unwrap();

    builder.into_inner().unwrap()
}

#[test]
fn read_entries_by_offset() {
    let file = build_archive(&[
        ("./index.json", b"{\"a\": 1}"),
        ("blobs/sha256/00", b"layer data"),
    ]);

    let index = ArchiveIndex::open(file.path()).unwrap();
    assert_eq!(index.len(), 3);
    assert!(index.contains("index.json"));

    let mut data = String::new();
    let entry = index.get("legacy/layer.tar").unwrap();
    index.open_entry(entry).unwrap().read_to_string(&mut data).unwrap();
    assert_eq!(data, "layer data");

    let json: serde_json::Value = index.read_json("index.json", None).unwrap();
    assert_eq!(json["a"], 1);
}

#[test]
fn decompress_archive() {
    use std::io::Write;

    let tarball = build_archive(&[("a", b"1")]);
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Default::default());
    encoder.write_all(&fs::read(tarball.path()).unwrap()).unwrap();
    let compressed = encoder.finish().unwrap();

    let index = ArchiveIndex::from_reader(&compressed[..]).unwrap();
    assert!(index.contains("a"));
}

#[test]
fn missing_archive() {
    let err = ArchiveIndex::open(Path::new("/nonexistent/image.tar")).err();
    assert!(matches!(err, Some(ExtractError::ArchiveNotFound(_))));

    let err = ArchiveIndex::open(&std::env::temp_dir()).err();
    assert!(matches!(err, Some(ExtractError::NotAFile(_))));
}
