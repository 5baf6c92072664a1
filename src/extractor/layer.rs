use std::{
    cell::Cell,
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::{self, Read},
};

use crate::{compression, EventHandler};

use super::{
    action::{ExtractAction, FileContent},
    fanout,
    pattern::{join_path, normalize_path, split_path},
    ExtractError, ExtractionWarning,
};

const WHITEOUT_PREFIX: &str = ".wh.";

const WHITEOUT_OPAQUE: &str = ".wh..opq";

/// Files and whiteouts found in a single layer.
#[derive(Debug, Default)]
pub(crate) struct LayerContents {
    /// Result of every action for each matched file.
    ///
    /// A file is present even if all of its callbacks failed, so it
    /// still hides the versions from older layers.
    pub files: BTreeMap<String, BTreeMap<String, FileContent>>,

    /// Paths removed by `.wh.<name>` entries.
    pub whiteouts: BTreeSet<String>,

    /// Directories with a `.wh..wh..opq` entry.
    pub opaque_dirs: BTreeSet<String>,

    /// Paths of entries that are not regular files (links, directories,
    /// devices). They hide the files from older layers at the same path.
    pub replaced: BTreeSet<String>,

    pub warnings: Vec<ExtractionWarning>,
}

/// Read a layer blob and run the actions that match its entries.
///
/// The blob can be a plain tarball, or compressed with gzip or zstd.
pub(crate) fn extract_layer<E: EventHandler>(
    layer_id: &str,
    blob: impl Read,
    blob_len: u64,
    actions: &[ExtractAction],
    fanout_buffer_limit: u64,
    event_handler: &E,
) -> Result<LayerContents, ExtractError> {
    let corrupt = |source: io::Error| ExtractError::CorruptLayer {
        layer: layer_id.to_owned(),
        source,
    };

    // Track position (in bytes) to send progress notifications.
    let blob_position = Cell::new(0);
    let mut blob = PositionTracker {
        count: &blob_position,
        reader: blob,
    };

    let (compression, reader) = compression::decompress_maybe(&mut blob).map_err(|e| {
        if e.kind() == io::ErrorKind::Unsupported {
            ExtractError::UnsupportedCompression(layer_id.to_owned())
        } else {
            corrupt(e)
        }
    })?;

    tracing::debug!(layer = layer_id, ?compression, "reading layer");
    event_handler.layer_start(layer_id, blob_len);

    let mut ctx = Context {
        event_handler,
        layer_id,
        actions,
        fanout_buffer_limit,
        contents: LayerContents::default(),
    };

    // Unread data of an entry is skipped by `tar` before reading the next
    // header, so entries without a matching action are drained here.
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(corrupt)? {
        event_handler.layer_progress(blob_position.get());
        ctx.process(entry.map_err(corrupt)?)?;
    }

    // The tar parser stops at the end-of-archive marker. Read the rest of
    // the blob, so a digest reader can verify it.
    drop(archive);
    io::copy(&mut blob, &mut io::sink()).map_err(corrupt)?;

    event_handler.layer_progress(blob_position.get());

    tracing::debug!(
        layer = layer_id,
        files = ctx.contents.files.len(),
        whiteouts = ctx.contents.whiteouts.len(),
        replaced = ctx.contents.replaced.len(),
        opaque_dirs = ctx.contents.opaque_dirs.len(),
        "layer finished"
    );

    Ok(ctx.contents)
}

struct InvalidPath;

impl fmt::Display for InvalidPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Path is not valid UTF-8, or contains '..'.")
    }
}

/// Count how many bytes have been read from `reader`.
struct PositionTracker<'a, R> {
    count: &'a Cell<u64>,
    reader: R,
}

impl<T: Read> Read for PositionTracker<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

struct Context<'a, E> {
    event_handler: &'a E,
    layer_id: &'a str,
    actions: &'a [ExtractAction],
    fanout_buffer_limit: u64,
    contents: LayerContents,
}

impl<E: EventHandler> Context<'_, E> {
    fn process(&mut self, mut entry: tar::Entry<impl Read>) -> Result<(), ExtractError> {
        let entry_path = entry.path_bytes();
        let raw_path = String::from_utf8_lossy(&entry_path).into_owned();

        let is_whiteout = raw_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with(WHITEOUT_PREFIX));

        let path = match std::str::from_utf8(&entry_path)
            .ok()
            .and_then(|p| normalize_path(p).ok())
        {
            Some(path) => path,

            None if is_whiteout => return Err(self.invalid_whiteout(raw_path)),

            None => {
                tracing::debug!(layer = self.layer_id, path = %raw_path, "entry skipped");
                self.event_handler
                    .layer_entry_skipped(&raw_path, &InvalidPath);
                return Ok(());
            }
        };

        if is_whiteout {
            return self.process_whiteout(path);
        }

        // Only the content of regular files is visible to the actions.
        if !entry.header().entry_type().is_file() {
            self.contents.files.remove(&path);
            self.contents.replaced.insert(path);
            return Ok(());
        }

        let matched: Vec<&ExtractAction> =
            self.actions.iter().filter(|a| a.matches(&path)).collect();

        if matched.is_empty() {
            return Ok(());
        }

        let size = entry.size();
        let results = fanout::dispatch(&mut entry, size, &matched, self.fanout_buffer_limit)
            .map_err(|source| ExtractError::CorruptLayer {
                layer: self.layer_id.to_owned(),
                source,
            })?;

        // A later entry for the same path replaces the previous one.
        let file = self.contents.files.entry(path.clone()).or_default();
        file.clear();

        for (action, result) in matched.into_iter().zip(results) {
            match result {
                Ok(content) => {
                    file.insert(action.name().to_owned(), content);
                }

                Err(error) => {
                    tracing::warn!(
                        layer = self.layer_id,
                        path = %path,
                        action = action.name(),
                        %error,
                        "extract action failed"
                    );

                    self.event_handler
                        .action_failed(&path, action.name(), &error);

                    self.contents.warnings.push(ExtractionWarning {
                        layer: self.layer_id.to_owned(),
                        path: path.clone(),
                        action: action.name().to_owned(),
                        message: error.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Register a whiteout entry.
    ///
    /// Whiteouts only affect older layers, so they are applied by the
    /// resolver after the whole layer is read.
    fn process_whiteout(&mut self, path: String) -> Result<(), ExtractError> {
        let (parent, file_name) = split_path(&path);

        let target = match file_name.strip_prefix(WHITEOUT_PREFIX) {
            Some(target) => target,
            None => return Err(self.invalid_whiteout(path)),
        };

        match target {
            WHITEOUT_OPAQUE => {
                self.contents.opaque_dirs.insert(parent.to_owned());
            }

            "" | "." | ".." => return Err(self.invalid_whiteout(path)),

            _ => {
                self.contents.whiteouts.insert(join_path(parent, target));
            }
        }

        Ok(())
    }

    fn invalid_whiteout(&self, path: String) -> ExtractError {
        ExtractError::InvalidWhiteout {
            layer: self.layer_id.to_owned(),
            path,
        }
    }
}
