//! Detect the distribution of an image from its release files.

use std::fmt;

use crate::{inputs, ExtractedLayers};

/// Distribution of the image.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsRelease {
    pub name: String,
    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,
}

impl OsRelease {
    fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        OsRelease {
            name: name.into(),
            version: version.into(),
            pretty_name: None,
        }
    }

    /// Release of an image without any release file, like `scratch`.
    pub fn unknown() -> Self {
        OsRelease::new("unknown", "0.0")
    }
}

impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("failed to detect the OS release from {path}: {reason}")]
pub struct OsReleaseError {
    pub path: String,
    pub reason: String,
}

type Parser = fn(&str) -> Result<OsRelease, String>;

/// Release files, in the order they are tried.
pub const RELEASE_FILES: &[&str] = &[
    "/etc/os-release",
    "/usr/lib/os-release",
    "/etc/lsb-release",
    "/etc/debian_version",
    "/etc/alpine-release",
    "/etc/oracle-release",
    "/etc/redhat-release",
    "/etc/centos-release",
];

fn parser(path: &str) -> Parser {
    match path {
        "/etc/lsb-release" => parse_lsb_release,
        "/etc/debian_version" => parse_debian_version,
        "/etc/alpine-release" => parse_alpine_release,
        "/etc/oracle-release" | "/etc/redhat-release" | "/etc/centos-release" => {
            parse_redhat_release
        }
        _ => parse_os_release,
    }
}

/// Detect the release from the files collected by
/// [`inputs::os_release_action`].
///
/// The first file that can be parsed wins. A file that exists but can't be
/// parsed is an error only if no other file gives a release.
pub fn detect(layers: &ExtractedLayers) -> Result<OsRelease, OsReleaseError> {
    let mut first_error = None;

    for &path in RELEASE_FILES {
        let Some(text) = layers
            .get(path)
            .and_then(|results| results.get(inputs::OS_RELEASE))
            .map(|content| content.to_text())
        else {
            continue;
        };

        match parser(path)(&text) {
            Ok(release) => {
                tracing::debug!(path, %release, "OS release detected");
                return Ok(normalize(release));
            }

            Err(reason) => {
                tracing::debug!(path, %reason, "invalid release file");
                first_error.get_or_insert(OsReleaseError {
                    path: path.to_owned(),
                    reason,
                });
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(OsRelease::unknown()),
    }
}

fn normalize(mut release: OsRelease) -> OsRelease {
    if release.name == "ol" {
        release.name = "oracle".into();
    }

    if release.name == "sles" && !release.version.contains('.') {
        release.version.push_str(".0");
    }

    release
}

/// Read `KEY=value` lines, removing quotes from the values.
fn shell_vars(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        Some((key.trim(), value.trim().trim_matches(['"', '\''])))
    })
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// `/etc/os-release`. Ref: <https://www.freedesktop.org/software/systemd/man/os-release.html>
fn parse_os_release(text: &str) -> Result<OsRelease, String> {
    let mut id = None;
    let mut version = None;
    let mut pretty_name = None;

    for (key, value) in shell_vars(text) {
        match key {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            "PRETTY_NAME" => pretty_name = Some(value),
            _ => (),
        }
    }

    let name = match id {
        Some(id) if !id.is_empty() => id,
        _ => return Err("missing ID".into()),
    };

    // Rolling releases, like Debian sid, have no VERSION_ID.
    let mut version = version.unwrap_or("unstable");

    if name == "ol" {
        version = major_version(version);
    }

    Ok(OsRelease {
        pretty_name: pretty_name.map(str::to_owned),
        ..OsRelease::new(name, version)
    })
}

fn parse_lsb_release(text: &str) -> Result<OsRelease, String> {
    let mut id = None;
    let mut release = None;

    for (key, value) in shell_vars(text) {
        match key {
            "DISTRIB_ID" => id = Some(value),
            "DISTRIB_RELEASE" => release = Some(value),
            _ => (),
        }
    }

    match (id, release) {
        (Some(id), Some(release)) if !id.is_empty() && !release.is_empty() => {
            Ok(OsRelease::new(id.to_lowercase(), release))
        }

        _ => Err("missing DISTRIB_ID or DISTRIB_RELEASE".into()),
    }
}

fn parse_debian_version(text: &str) -> Result<OsRelease, String> {
    let version = text.trim();
    if version.len() < 2 {
        return Err(format!("invalid version {version:?}"));
    }

    Ok(OsRelease::new("debian", major_version(version)))
}

fn parse_alpine_release(text: &str) -> Result<OsRelease, String> {
    match text.trim() {
        "" => Err("empty file".into()),
        version => Ok(OsRelease::new("alpine", version)),
    }
}

/// Files like `Red Hat Enterprise Linux Server release 7.9 (Maipo)`.
fn parse_redhat_release(text: &str) -> Result<OsRelease, String> {
    let text = text.trim();

    let name = match text.split_whitespace().next().map(str::to_lowercase) {
        Some(n) if n == "red" => "rhel".to_owned(),
        Some(n) => n,
        None => return Err("empty file".into()),
    };

    let version = text
        .split_whitespace()
        .skip_while(|w| *w != "release")
        .nth(1)
        .ok_or("missing release number")?;

    Ok(OsRelease::new(name, major_version(version)))
}
