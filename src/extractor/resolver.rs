use std::io::{self, Cursor, Read};

use crate::{EventHandler, NoEventHandler};

use super::{
    action::ExtractAction,
    layer::{extract_layer, LayerContents},
    pattern::is_within,
    ExtractError, ExtractedLayers, ExtractionWarning, DEFAULT_FANOUT_BUFFER_LIMIT,
};

/// A layer blob that can be read by a [`LayerResolver`].
///
/// The blob is a tarball, optionally compressed with gzip or zstd.
pub trait LayerSource {
    /// Identifier of the layer, used in errors and warnings.
    fn id(&self) -> &str;

    /// Length of the blob, if known. Only used for progress events.
    fn length(&self) -> Option<u64> {
        None
    }

    /// Open a new stream to read the blob.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// Layer blob stored in memory.
#[derive(Clone, Debug)]
pub struct InMemoryLayer {
    id: String,
    data: Vec<u8>,
}

impl InMemoryLayer {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        InMemoryLayer {
            id: id.into(),
            data: data.into(),
        }
    }
}

impl LayerSource for InMemoryLayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(Cursor::new(&self.data[..])))
    }
}

/// Merge the files found in a stack of layers.
///
/// Layers must be added from the oldest to the newest. For every layer:
///
/// 1. Paths removed by its whiteouts, and paths under its opaque
///    directories, are dropped from the files found in older layers.
/// 2. Its own files replace the versions from older layers. Links and
///    other entries that are not regular files hide an older file at the
///    same path, but not the content of a directory.
///
/// A path removed by a whiteout is restored if a newer layer adds it
/// again.
pub struct LayerResolver<'a, E = NoEventHandler> {
    actions: &'a [ExtractAction],
    fanout_buffer_limit: u64,
    event_handler: &'a E,
    files: ExtractedLayers,
    warnings: Vec<ExtractionWarning>,
}

impl<'a> LayerResolver<'a> {
    pub fn new(actions: &'a [ExtractAction]) -> Self {
        LayerResolver {
            actions,
            fanout_buffer_limit: DEFAULT_FANOUT_BUFFER_LIMIT,
            event_handler: &NoEventHandler,
            files: ExtractedLayers::default(),
            warnings: Vec::new(),
        }
    }
}

impl<'a, E: EventHandler> LayerResolver<'a, E> {
    /// Entries up to this size that are read by several actions are
    /// buffered in memory.
    pub fn fanout_buffer_limit(mut self, limit: u64) -> Self {
        self.fanout_buffer_limit = limit;
        self
    }

    pub fn event_handler<E1: EventHandler>(self, event_handler: &'a E1) -> LayerResolver<'a, E1> {
        LayerResolver {
            actions: self.actions,
            fanout_buffer_limit: self.fanout_buffer_limit,
            event_handler,
            files: self.files,
            warnings: self.warnings,
        }
    }

    /// Read the next (newer) layer.
    pub fn add_layer(&mut self, layer: &dyn LayerSource) -> Result<(), ExtractError> {
        let id = layer.id();
        let blob = crate::try_io!(id, layer.open());

        let contents = extract_layer(
            id,
            blob,
            layer.length().unwrap_or_default(),
            self.actions,
            self.fanout_buffer_limit,
            self.event_handler,
        )?;

        self.merge(contents);
        Ok(())
    }

    fn merge(&mut self, layer: LayerContents) {
        let LayerContents {
            files,
            whiteouts,
            opaque_dirs,
            replaced,
            warnings,
        } = layer;

        for path in &replaced {
            self.files.0.remove(path);
        }

        if !whiteouts.is_empty() || !opaque_dirs.is_empty() {
            self.files.0.retain(|path, _| {
                let removed = whiteouts.iter().any(|w| is_within(path, w))
                    || opaque_dirs
                        .iter()
                        .any(|dir| path != dir && is_within(path, dir));

                !removed
            });
        }

        self.files.0.extend(files);
        self.warnings.extend(warnings);
    }

    /// Return the merged view of all layers.
    ///
    /// Files where every callback failed are removed.
    pub fn finish(mut self) -> (ExtractedLayers, Vec<ExtractionWarning>) {
        self.files.0.retain(|_, results| !results.is_empty());
        (self.files, self.warnings)
    }
}

/// Read `layers`, from the oldest to the newest, and return the final
/// content of the files matched by `actions`.
pub fn resolve_layers<L: LayerSource>(
    layers: &[L],
    actions: &[ExtractAction],
) -> Result<(ExtractedLayers, Vec<ExtractionWarning>), ExtractError> {
    let mut resolver = LayerResolver::new(actions);
    for layer in layers {
        resolver.add_layer(layer)?;
    }

    Ok(resolver.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileContent, PathMatcher};

    fn layer(id: &str, entries: &[(&str, &str)]) -> InMemoryLayer {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append(&header, data.as_bytes()).unwrap();
        }

        InMemoryLayer::new(id, builder.into_inner().unwrap())
    }

    fn with_links(id: &str, links: &[(&str, &str)], dirs: &[&str]) -> InMemoryLayer {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, target) in links {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, path, target).unwrap();
        }

        for dir in dirs {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_path(dir).unwrap();
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            builder.append(&header, io::empty()).unwrap();
        }

        InMemoryLayer::new(id, builder.into_inner().unwrap())
    }

    fn text(files: &ExtractedLayers, path: &str) -> Option<String> {
        files
            .get(path)
            .and_then(|f| f.get("text"))
            .map(FileContent::to_text)
    }

    fn actions() -> Vec<ExtractAction> {
        vec![ExtractAction::text("text", PathMatcher::prefix("/"))]
    }

    #[test]
    fn newer_layers_win() {
        let layers = [
            layer("0", &[("a", "0"), ("b", "0")]),
            layer("1", &[("a", "1")]),
        ];

        let (files, warnings) = resolve_layers(&layers, &actions()).unwrap();

        assert!(warnings.is_empty());
        assert_eq!(text(&files, "/a").as_deref(), Some("1"));
        assert_eq!(text(&files, "/b").as_deref(), Some("0"));
    }

    #[test]
    fn whiteout_precedence() {
        let layers = [
            layer("0", &[("p", "0"), ("d/x", "0")]),
            layer("1", &[("p", "1")]),
            layer("2", &[(".wh.p", ""), ("d/.wh.x", "")]),
            layer("3", &[("q", "3")]),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();
        assert_eq!(text(&files, "/p"), None);
        assert_eq!(text(&files, "/d/x"), None);
        assert_eq!(text(&files, "/q").as_deref(), Some("3"));

        // A newer layer restores the path.
        let layers = [
            layer("0", &[("p", "0")]),
            layer("1", &[(".wh.p", "")]),
            layer("2", &[("p", "2")]),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();
        assert_eq!(text(&files, "/p").as_deref(), Some("2"));
    }

    #[test]
    fn whiteout_removes_subtree() {
        let layers = [
            layer("0", &[("etc/apk/world", "0"), ("etc/apk.conf", "0")]),
            layer("1", &[("etc/.wh.apk", "")]),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();
        assert_eq!(text(&files, "/etc/apk/world"), None);
        assert_eq!(text(&files, "/etc/apk.conf").as_deref(), Some("0"));
    }

    #[test]
    fn opaque_directory_scope() {
        let layers = [
            layer("0", &[("d/old", "0"), ("d/sub/old", "0"), ("d2/keep", "0")]),
            layer("1", &[("d/.wh..wh..opq", ""), ("d/same", "1")]),
            layer("2", &[("d/new", "2")]),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();

        assert_eq!(text(&files, "/d/old"), None);
        assert_eq!(text(&files, "/d/sub/old"), None);
        assert_eq!(text(&files, "/d/same").as_deref(), Some("1"));
        assert_eq!(text(&files, "/d/new").as_deref(), Some("2"));
        assert_eq!(text(&files, "/d2/keep").as_deref(), Some("0"));
    }

    #[test]
    fn links_hide_older_files() {
        let layers = [
            layer(
                "0",
                &[
                    ("etc/os-release", "old"),
                    ("usr/lib/os-release", "ID=alpine"),
                    ("opt", "file"),
                    ("var/lib/x", "0"),
                ],
            ),
            with_links(
                "1",
                &[("etc/os-release", "../usr/lib/os-release")],
                &["opt/", "var/lib/"],
            ),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();

        assert_eq!(text(&files, "/etc/os-release"), None);
        assert_eq!(
            text(&files, "/usr/lib/os-release").as_deref(),
            Some("ID=alpine")
        );

        // A directory replaces a file, but keeps its own content.
        assert_eq!(text(&files, "/opt"), None);
        assert_eq!(text(&files, "/var/lib/x").as_deref(), Some("0"));

        // A regular file added again in a newer layer is visible.
        let layers = [
            layers[0].clone(),
            layers[1].clone(),
            layer("2", &[("etc/os-release", "new")]),
        ];

        let (files, _) = resolve_layers(&layers, &actions()).unwrap();
        assert_eq!(text(&files, "/etc/os-release").as_deref(), Some("new"));
    }

    #[test]
    fn failed_callbacks_hide_older_versions() {
        let layers = [layer("0", &[("a", "0")]), layer("1", &[("a", "1")])];

        let actions = [ExtractAction::new("text", PathMatcher::exact("/a"), |r| {
            let mut s = String::new();
            r.read_to_string(&mut s)?;
            if s == "1" {
                return Err(io::Error::other("rejected"));
            }

            Ok(FileContent::Text(s))
        })];

        let (files, warnings) = resolve_layers(&layers, &actions).unwrap();
        assert!(files.is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].layer, "1");
    }

    #[test]
    fn panicking_callback_is_a_warning() {
        let layers = [layer("0", &[("a", "0"), ("b", "0")])];

        let actions = [
            ExtractAction::new("panic", PathMatcher::exact("/a"), |_| panic!("broken")),
            ExtractAction::text("text", PathMatcher::exact("/b")),
        ];

        let (files, warnings) = resolve_layers(&layers, &actions).unwrap();

        assert_eq!(files.get("/a"), None);
        assert_eq!(text(&files, "/b").as_deref(), Some("0"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].path, "/a");
        assert_eq!(warnings[0].action, "panic");
    }

    #[test]
    fn idempotent_resolution() {
        let layers = [
            layer("0", &[("a", "0"), ("b/c", "0")]),
            layer("1", &[("b/.wh..wh..opq", ""), ("a", "1")]),
        ];

        let first = resolve_layers(&layers, &actions()).unwrap();
        let second = resolve_layers(&layers, &actions()).unwrap();
        assert_eq!(first.0, second.0);
    }
}
