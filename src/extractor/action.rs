use std::{
    fmt,
    io::{self, Read},
    sync::Arc,
};

use super::pattern::PathMatcher;

/// Value produced by the callback of an [`ExtractAction`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum FileContent {
    /// File decoded as UTF-8. Invalid sequences are replaced.
    Text(String),

    /// Raw bytes of the file.
    Binary(Vec<u8>),

    /// Digest of the file, like `sha256:<hex>`.
    Hash(String),
}

impl FileContent {
    /// Content as a string, if it was decoded as text or hashed.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContent::Text(s) | FileContent::Hash(s) => Some(s),
            FileContent::Binary(_) => None,
        }
    }

    /// Raw bytes. Text is returned as its UTF-8 encoding.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(s) | FileContent::Hash(s) => s.as_bytes(),
            FileContent::Binary(b) => b,
        }
    }

    /// Content as a string. Binary data is decoded as UTF-8, replacing
    /// invalid sequences.
    pub fn to_text(&self) -> String {
        match self {
            FileContent::Text(s) | FileContent::Hash(s) => s.clone(),
            FileContent::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Function to convert the content of an entry.
pub type ActionCallback = Arc<dyn Fn(&mut dyn Read) -> io::Result<FileContent> + Send + Sync>;

/// A request to get the content of files that match a path predicate.
///
/// The `name` is the key of the callback result in
/// [`ExtractedLayers`](crate::ExtractedLayers). Several actions may match
/// the same entry; each callback reads its own copy of the content.
///
/// # Examples
///
/// ```
/// # use oci_extract::{ExtractAction, FileContent, PathMatcher};
/// let action = ExtractAction::new("size", PathMatcher::exact("/etc/hostname"), |reader| {
///     let size = std::io::copy(reader, &mut std::io::sink())?;
///     Ok(FileContent::Text(size.to_string()))
/// });
///
/// assert!(action.matches("/etc/hostname"));
/// assert!(!action.matches("/etc/hosts"));
/// ```
#[derive(Clone)]
pub struct ExtractAction {
    name: String,
    matcher: PathMatcher,
    callback: ActionCallback,
}

impl ExtractAction {
    pub fn new<F>(name: impl Into<String>, matcher: PathMatcher, callback: F) -> Self
    where
        F: Fn(&mut dyn Read) -> io::Result<FileContent> + Send + Sync + 'static,
    {
        ExtractAction {
            name: name.into(),
            matcher,
            callback: Arc::new(callback),
        }
    }

    /// Action to read the matched files as text.
    pub fn text(name: impl Into<String>, matcher: PathMatcher) -> Self {
        ExtractAction::new(name, matcher, read_text)
    }

    /// Action to read the matched files as raw bytes.
    pub fn bytes(name: impl Into<String>, matcher: PathMatcher) -> Self {
        ExtractAction::new(name, matcher, read_bytes)
    }

    /// Action to compute the SHA-256 digest of the matched files.
    pub fn sha256(name: impl Into<String>, matcher: PathMatcher) -> Self {
        ExtractAction::new(name, matcher, |reader| {
            crate::digest::sha256_digest(reader).map(FileContent::Hash)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matcher(&self) -> &PathMatcher {
        &self.matcher
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }

    /// Invoke the callback with the content of an entry.
    pub fn run(&self, reader: &mut dyn Read) -> io::Result<FileContent> {
        (self.callback)(reader)
    }
}

impl fmt::Debug for ExtractAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractAction")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Read all data as UTF-8 text.
pub fn read_text(reader: &mut dyn Read) -> io::Result<FileContent> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let text = match String::from_utf8(data) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };

    Ok(FileContent::Text(text))
}

/// Read all data as a byte buffer.
pub fn read_bytes(reader: &mut dyn Read) -> io::Result<FileContent> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(FileContent::Binary(data))
}

#[test]
fn stock_callbacks() {
    use std::io::Cursor;

    let text = read_text(&mut Cursor::new(b"caf\xc3\xa9 \xff")).unwrap();
    assert_eq!(text, FileContent::Text("café \u{fffd}".into()));

    let bytes = read_bytes(&mut Cursor::new(b"\x00\x01")).unwrap();
    assert_eq!(bytes.as_bytes(), b"\x00\x01");
    assert_eq!(bytes.as_text(), None);

    let action = ExtractAction::sha256("hash", PathMatcher::exact("/a"));
    let hash = action.run(&mut Cursor::new("abc")).unwrap();
    assert_eq!(
        hash.as_text(),
        Some("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
}
