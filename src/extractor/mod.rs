pub(crate) mod action;
mod fanout;
mod layer;
pub(crate) mod pattern;
pub(crate) mod resolver;

use std::{
    collections::BTreeMap,
    io::{self, Read},
    path::PathBuf,
};

use crate::{
    archive::{ArchiveKind, ArchiveOptions, ImageArchive, ImageConfig, Platform},
    digest::DigestError,
    EventHandler, NoEventHandler,
};

use action::{ExtractAction, FileContent};
use resolver::LayerResolver;

/// Entries up to this size read by several actions are buffered once in
/// memory. Bigger entries are forked to a thread per action.
pub(crate) const DEFAULT_FANOUT_BUFFER_LIMIT: u64 = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Archive not found: {0}")]
    ArchiveNotFound(PathBuf),

    #[error("Archive is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("Unsupported archive type: {0}")]
    UnsupportedArchive(String),

    #[error("Invalid {kind} archive: {reason}")]
    InvalidArchive { kind: ArchiveKind, reason: String },

    #[error("No image for the platform {0}.")]
    PlatformNotFound(String),

    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("Failed to read layer {layer}: {source}")]
    CorruptLayer { layer: String, source: io::Error },

    #[error("Invalid whiteout in layer {layer}: {path}")]
    InvalidWhiteout { layer: String, path: String },

    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("Compression format of {0} is not supported.")]
    UnsupportedCompression(String),
}

/// A callback of an extract action failed for a file.
///
/// The file is still processed by other actions.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ExtractionWarning {
    pub layer: String,
    pub path: String,
    pub action: String,
    pub message: String,
}

/// Final content of the files matched by the extract actions.
///
/// Maps an absolute path to the result of each action (by name).
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct ExtractedLayers(pub(crate) BTreeMap<String, BTreeMap<String, FileContent>>);

impl ExtractedLayers {
    pub fn get(&self, path: &str) -> Option<&BTreeMap<String, FileContent>> {
        self.0.get(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, FileContent>)> {
        self.0.iter().map(|(p, r)| (p.as_str(), r))
    }

    /// All files with a result from `action`, sorted by path.
    pub fn contents<'a>(
        &'a self,
        action: &ExtractAction,
    ) -> impl Iterator<Item = (&'a str, &'a FileContent)> + 'a {
        let action = action.clone();
        self.0.iter().filter_map(move |(path, results)| {
            if !action.matches(path) {
                return None;
            }

            results.get(action.name()).map(|c| (path.as_str(), c))
        })
    }

    /// First file, sorted by path, with a result from `action`.
    pub fn content(&self, action: &ExtractAction) -> Option<&FileContent> {
        self.contents(action).next().map(|(_, c)| c)
    }

    /// Like [`content`](Self::content), decoded as text.
    pub fn content_as_string(&self, action: &ExtractAction) -> Option<String> {
        self.content(action).map(FileContent::to_text)
    }

    pub fn content_as_bytes(&self, action: &ExtractAction) -> Option<&[u8]> {
        self.content(action).map(FileContent::as_bytes)
    }
}

/// Files extracted from an image, and its metadata.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub kind: ArchiveKind,

    /// Digest of the image configuration. Flat archives have no ID.
    pub image_id: Option<String>,

    /// Layers listed by the manifest, from the oldest to the newest.
    pub manifest_layers: Vec<String>,

    /// `rootfs.diff_ids` from the image configuration.
    pub root_fs_layers: Vec<String>,

    /// `os/architecture` from the image configuration.
    pub platform: Option<String>,

    pub image_labels: BTreeMap<String, String>,

    pub image_creation_time: Option<String>,

    pub config: Option<ImageConfig>,

    pub extracted_layers: ExtractedLayers,

    pub warnings: Vec<ExtractionWarning>,
}

enum Input {
    Path(PathBuf),
    Reader(Box<dyn Read>),
}

/// Read files from an image archive.
///
/// # Examples
///
/// ```no_run
/// use oci_extract::{ArchiveKind, ExtractAction, Extractor, PathMatcher};
///
/// let hostname = ExtractAction::text("hostname", PathMatcher::exact("/etc/hostname"));
///
/// let result = Extractor::new("image.tar")
///     .kind(ArchiveKind::OciArchive)
///     .platform("linux/arm64".parse()?)
///     .action(hostname.clone())
///     .extract()?;
///
/// println!("{:?}", result.extracted_layers.content_as_string(&hostname));
/// # Ok::<(), oci_extract::ExtractError>(())
/// ```
pub struct Extractor<E = NoEventHandler> {
    input: Input,
    options: ArchiveOptions,
    actions: Vec<ExtractAction>,
    fanout_buffer_limit: u64,
    event_handler: E,
}

impl Extractor {
    /// Read the archive in `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_input(Input::Path(path.into()))
    }

    /// Read the archive from a stream, like the output of `docker save`.
    ///
    /// The stream is copied to a temporary file, which is deleted when
    /// the extraction is finished.
    pub fn from_reader(reader: impl Read + 'static) -> Self {
        Self::with_input(Input::Reader(Box::new(reader)))
    }

    fn with_input(input: Input) -> Self {
        Extractor {
            input,
            options: ArchiveOptions::default(),
            actions: Vec::new(),
            fanout_buffer_limit: DEFAULT_FANOUT_BUFFER_LIMIT,
            event_handler: NoEventHandler,
        }
    }
}

impl<E: EventHandler> Extractor<E> {
    /// Format of the archive. By default, it is detected from its contents.
    pub fn kind(mut self, kind: ArchiveKind) -> Self {
        self.options.kind = kind;
        self
    }

    /// Platform to select in multi-platform images.
    ///
    /// The default is `linux` and the architecture of the current process.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.options.platform = platform;
        self
    }

    pub fn action(mut self, action: ExtractAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = ExtractAction>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Entries up to this size that are read by several actions are
    /// buffered in memory. Bigger entries are forked to one thread per
    /// action.
    pub fn fanout_buffer_limit(mut self, limit: u64) -> Self {
        self.fanout_buffer_limit = limit;
        self
    }

    /// Verify that blobs addressed by a digest hash to it.
    ///
    /// Enabled by default.
    pub fn verify_digests(mut self, verify: bool) -> Self {
        self.options.verify_digests = verify;
        self
    }

    pub fn event_handler<E1: EventHandler>(self, event_handler: E1) -> Extractor<E1> {
        Extractor {
            input: self.input,
            options: self.options,
            actions: self.actions,
            fanout_buffer_limit: self.fanout_buffer_limit,
            event_handler,
        }
    }

    /// Read every layer of the image and collect the files matched by the
    /// actions.
    pub fn extract(self) -> Result<ExtractionResult, ExtractError> {
        let Extractor {
            input,
            options,
            actions,
            fanout_buffer_limit,
            event_handler,
        } = self;

        let archive = match input {
            Input::Path(path) => ImageArchive::open(&path, &options)?,
            Input::Reader(reader) => ImageArchive::from_reader(reader, &options)?,
        };

        for skipped in archive.skipped() {
            event_handler.layer_skipped(&skipped.id, &skipped.cause);
        }

        event_handler.archive_opened(archive.kind(), archive.layer_count());

        let mut resolver = LayerResolver::new(&actions)
            .fanout_buffer_limit(fanout_buffer_limit)
            .event_handler(&event_handler);

        for layer in archive.layers() {
            resolver.add_layer(&layer)?;
        }

        let (extracted_layers, warnings) = resolver.finish();

        event_handler.finished();

        tracing::info!(
            kind = %archive.kind(),
            layers = archive.layer_count(),
            files = extracted_layers.len(),
            warnings = warnings.len(),
            "image extracted"
        );

        let config = archive.config().cloned();

        Ok(ExtractionResult {
            kind: archive.kind(),
            image_id: archive.image_id().map(str::to_owned),
            manifest_layers: archive.manifest_layers().to_vec(),
            root_fs_layers: config
                .as_ref()
                .map(|c| c.rootfs.diff_ids.clone())
                .unwrap_or_default(),
            platform: config.as_ref().and_then(ImageConfig::platform),
            image_labels: config
                .as_ref()
                .map(|c| c.config.labels.clone())
                .unwrap_or_default(),
            image_creation_time: config.as_ref().and_then(|c| c.created.clone()),
            config,
            extracted_layers,
            warnings,
        })
    }
}
