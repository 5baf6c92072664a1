//! Read software composition metadata from container image archives,
//! without unpacking them to disk or running them.
//!
//! The [`Extractor`] opens a Docker-save, OCI-layout, or Kaniko archive,
//! streams every layer in order, and collects the content of the files
//! requested by a set of [`ExtractAction`]s. The result is the final view
//! of those files after applying the whiteouts of every layer.
//!
//! # Examples
//!
//! ```no_run
//! use oci_extract::{inputs, Extractor};
//!
//! let result = Extractor::new("image.tar")
//!     .actions(inputs::os_package_actions())
//!     .extract()?;
//!
//! let analysis = oci_extract::analyzer::analyze(&result, "alpine:3.20")?;
//!
//! for tree in &analysis.dependency_trees {
//!     println!("{}: {} packages", tree.package_format_version, tree.size());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analyzer;
pub mod archive;
pub mod compression;
pub mod dependency_tree;
pub mod digest;
mod event_handler;
mod extractor;
pub mod inputs;
mod mediatype;
pub mod os_release;
pub mod packages;

pub use archive::{ArchiveKind, ImageArchive, ImageConfig, Platform};
pub use digest::{Digest, DigestAlgorithm};
pub use event_handler::{EventHandler, NoEventHandler};
pub use extractor::{
    action::{ActionCallback, ExtractAction, FileContent},
    pattern::PathMatcher,
    resolver::{resolve_layers, InMemoryLayer, LayerResolver, LayerSource},
    ExtractError, ExtractedLayers, ExtractionResult, ExtractionWarning, Extractor,
};
pub use mediatype::{BlobKind, MediaType};

/// Attach a path to an I/O error, and return it as
/// [`ExtractError::Io`].
macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| $crate::ExtractError::Io(std::io::Error::from(e), $path.into()))?
    };
}

// Make visible to mods.
use try_io;
