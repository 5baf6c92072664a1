use std::{fmt::Display, io};

use crate::archive::ArchiveKind;

/// Handler to receive notifications for events during the extraction.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler: Sync + 'static {
    /// The archive was indexed and its format resolved.
    ///
    /// `layers` is the number of layers that will be read.
    fn archive_opened(&self, kind: ArchiveKind, layers: usize) {}

    /// Start to read a layer.
    ///
    /// `archive_length` is the length, in bytes, of the (possibly
    /// compressed) layer blob.
    fn layer_start(&self, layer: &str, archive_length: u64) {}

    /// Some data was consumed from the current layer.
    ///
    /// `archive_position` is relative to `archive_length` in
    /// [`layer_start`][Self::layer_start].
    fn layer_progress(&self, archive_position: u64) {}

    /// A blob referenced by the image was not read as a layer.
    ///
    /// For example, an attestation manifest, or a layer listed in the
    /// manifest but missing from the archive.
    fn layer_skipped(&self, layer: &str, cause: &dyn Display) {}

    /// An entry in a layer is skipped.
    ///
    /// For example, a path that can't be represented.
    fn layer_entry_skipped(&self, path: &str, cause: &dyn Display) {}

    /// The callback of an extract action failed for an entry.
    ///
    /// The entry is still drained, and other actions are not affected.
    fn action_failed(&self, path: &str, action: &str, error: &io::Error) {}

    /// All layers have been read.
    fn finished(&self) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
