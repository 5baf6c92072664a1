use std::{fmt, io, sync::Arc};

use glob::{MatchOptions, Pattern, PatternError};

/// Options for glob patterns:
///
/// * `*` never crosses a `/`; only a `**` component does.
/// * Dotfiles are matched only by a literal `.` in the pattern.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Convert a path from an archive entry to the absolute path inside
/// the image filesystem.
///
/// Leading `/` and `./` are removed and the path is prefixed with a single
/// `/`. Entries with `..` are rejected.
pub fn normalize_path(path: &str) -> io::Result<String> {
    let mut normalized = String::with_capacity(path.len() + 1);

    for component in path.split('/') {
        match component {
            "" | "." => continue,

            // Don't trust entries with `..` in the path.
            ".." => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Found '..' in the path.",
                ));
            }

            part => {
                normalized.push('/');
                normalized.push_str(part);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }

    Ok(normalized)
}

/// Split a normalized path in a `(parent, file_name)` pair.
///
/// The parent of a top-level entry is `/`.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", path),
    }
}

/// Join a normalized parent directory and a file name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Return `true` if `path` is `dir` or is below `dir`.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }

    match path.strip_prefix(dir) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Predicate on the absolute path of an entry.
#[derive(Clone)]
pub enum PathMatcher {
    /// The path is exactly this one.
    Exact(String),

    /// The path is any of these.
    AnyOf(Vec<String>),

    /// The path is below this directory.
    Prefix(String),

    /// The path matches any `include` pattern and no `exclude` pattern.
    Glob {
        include: Vec<Pattern>,
        exclude: Vec<Pattern>,
    },

    /// Arbitrary predicate.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl PathMatcher {
    pub fn exact(path: impl Into<String>) -> Self {
        PathMatcher::Exact(path.into())
    }

    pub fn any_of<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PathMatcher::AnyOf(paths.into_iter().map(Into::into).collect())
    }

    /// Match entries below `dir`. A trailing `/` is optional.
    pub fn prefix(dir: impl Into<String>) -> Self {
        let mut dir = dir.into();
        if dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }

        PathMatcher::Prefix(dir)
    }

    /// Compile glob patterns.
    ///
    /// # Examples
    ///
    /// ```
    /// # use oci_extract::PathMatcher;
    /// let matcher = PathMatcher::glob(&["/app/**/*.json"], &["/app/**/node_modules/**"]).unwrap();
    ///
    /// assert!(matcher.matches("/app/package.json"));
    /// assert!(matcher.matches("/app/lib/x/package.json"));
    /// assert!(!matcher.matches("/app/node_modules/a/package.json"));
    /// assert!(!matcher.matches("/app/.config.json"));
    /// ```
    pub fn glob(include: &[&str], exclude: &[&str]) -> Result<Self, PatternError> {
        let compile = |patterns: &[&str]| -> Result<Vec<Pattern>, PatternError> {
            patterns.iter().map(|p| Pattern::new(p)).collect()
        };

        Ok(PathMatcher::Glob {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        PathMatcher::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(p) => p == path,

            PathMatcher::AnyOf(paths) => paths.iter().any(|p| p == path),

            PathMatcher::Prefix(dir) => path != dir && is_within(path, dir),

            PathMatcher::Glob { include, exclude } => {
                !exclude.iter().any(|p| p.matches_with(path, GLOB_OPTIONS))
                    && include.iter().any(|p| p.matches_with(path, GLOB_OPTIONS))
            }

            PathMatcher::Custom(predicate) => predicate(path),
        }
    }
}

impl fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMatcher::Exact(p) => f.debug_tuple("Exact").field(p).finish(),
            PathMatcher::AnyOf(p) => f.debug_tuple("AnyOf").field(p).finish(),
            PathMatcher::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            PathMatcher::Glob { include, exclude } => f
                .debug_struct("Glob")
                .field("include", &include.iter().map(Pattern::as_str).collect::<Vec<_>>())
                .field("exclude", &exclude.iter().map(Pattern::as_str).collect::<Vec<_>>())
                .finish(),
            PathMatcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[test]
fn normalize_entry_paths() {
    assert_eq!(normalize_path("etc/os-release").unwrap(), "/etc/os-release");
    assert_eq!(normalize_path("./etc/os-release").unwrap(), "/etc/os-release");
    assert_eq!(normalize_path("/etc//apk/").unwrap(), "/etc/apk");
    assert_eq!(normalize_path("./").unwrap(), "/");
    assert!(normalize_path("a/../../etc/passwd").is_err());
}

#[test]
fn split_and_join() {
    assert_eq!(split_path("/a/b/c"), ("/a/b", "c"));
    assert_eq!(split_path("/c"), ("/", "c"));
    assert_eq!(join_path("/", "c"), "/c");
    assert_eq!(join_path("/a/b", "c"), "/a/b/c");
}

#[test]
fn directory_scope() {
    assert!(is_within("/var/lib/dpkg", "/var/lib"));
    assert!(is_within("/var/lib", "/var/lib"));
    assert!(!is_within("/var/library", "/var/lib"));
    assert!(is_within("/anything", "/"));
}

#[test]
fn glob_semantics() {
    let m = PathMatcher::glob(&["/etc/*"], &[]).unwrap();
    assert!(m.matches("/etc/passwd"));
    assert!(!m.matches("/etc/apk/world"));
    assert!(!m.matches("/etc/.pwd.lock"));

    let m = PathMatcher::glob(&["/etc/.*"], &[]).unwrap();
    assert!(m.matches("/etc/.pwd.lock"));

    let m = PathMatcher::glob(&["/usr/**/*.jar"], &[]).unwrap();
    assert!(m.matches("/usr/share/java/a.jar"));
    assert!(m.matches("/usr/lib/x/y/z/b.jar"));
    assert!(!m.matches("/opt/b.jar"));
}

#[test]
fn prefix_matcher() {
    let m = PathMatcher::prefix("/var/lib/dpkg/status.d/");
    assert!(m.matches("/var/lib/dpkg/status.d/base"));
    assert!(!m.matches("/var/lib/dpkg/status.d"));
    assert!(!m.matches("/var/lib/dpkg/status"));
}
