//! Extract actions for the files read by the analyzers, and getters to
//! find their content in [`ExtractedLayers`].

use glob::PatternError;

use crate::{
    extractor::pattern::split_path,
    os_release::RELEASE_FILES,
    packages::{apk, dpkg},
    ExtractAction, ExtractedLayers, FileContent, PathMatcher,
};

pub const APK_DB: &str = "apk-db";

pub const DPKG_STATUS: &str = "dpkg";

pub const APT_EXTENDED_STATES: &str = "ext";

pub const DISTROLESS_STATUS: &str = "dpkg-distroless";

pub const OS_RELEASE: &str = "os-release";

pub const FILE_PATTERN: &str = "find-files-by-pattern";

/// Not a package database. Distroless Node.js images ship this record
/// without the rest of a Debian package.
const DISTROLESS_IGNORED: &str = "/var/lib/dpkg/status.d/nodejs";

pub fn apk_db_action() -> ExtractAction {
    ExtractAction::text(APK_DB, PathMatcher::exact(apk::DATABASE_PATH))
}

pub fn dpkg_status_action() -> ExtractAction {
    ExtractAction::text(DPKG_STATUS, PathMatcher::exact(dpkg::STATUS_PATH))
}

pub fn apt_extended_states_action() -> ExtractAction {
    ExtractAction::text(APT_EXTENDED_STATES, PathMatcher::exact(dpkg::EXTENDED_STATES_PATH))
}

pub fn distroless_action() -> ExtractAction {
    let dir = PathMatcher::prefix(dpkg::DISTROLESS_STATUS_DIR);

    ExtractAction::text(
        DISTROLESS_STATUS,
        PathMatcher::custom(move |path| dir.matches(path) && path != DISTROLESS_IGNORED),
    )
}

/// Release files. Symlinks are not followed, so both `/etc/os-release`
/// and `/usr/lib/os-release` are requested.
pub fn os_release_action() -> ExtractAction {
    ExtractAction::text(OS_RELEASE, PathMatcher::any_of(RELEASE_FILES.iter().copied()))
}

/// Actions for every file used by [`analyze`](crate::analyzer::analyze).
pub fn os_package_actions() -> Vec<ExtractAction> {
    vec![
        apk_db_action(),
        dpkg_status_action(),
        apt_extended_states_action(),
        distroless_action(),
        os_release_action(),
    ]
}

/// Get the raw content of the files that match the glob patterns.
pub fn file_pattern_action(
    include: &[&str],
    exclude: &[&str],
) -> Result<ExtractAction, PatternError> {
    Ok(ExtractAction::bytes(FILE_PATTERN, PathMatcher::glob(include, exclude)?))
}

/// Files found by `action`, as `(dir, name, content)`.
pub fn matching_files<'a>(
    layers: &'a ExtractedLayers,
    action: &ExtractAction,
) -> Vec<(&'a str, &'a str, &'a [u8])> {
    layers
        .iter()
        .filter_map(|(path, results)| {
            let content = results.get(action.name())?;
            let (dir, name) = split_path(path);
            Some((dir, name, content.as_bytes()))
        })
        .collect()
}

fn text<'a>(layers: &'a ExtractedLayers, path: &str, action: &str) -> &'a str {
    layers
        .get(path)
        .and_then(|results| results.get(action))
        .and_then(FileContent::as_text)
        .unwrap_or_default()
}

/// Content of the apk database, or an empty string.
pub fn apk_database(layers: &ExtractedLayers) -> &str {
    text(layers, apk::DATABASE_PATH, APK_DB)
}

/// Content of the dpkg `status` and apt `extended_states` files. Missing
/// files are empty.
pub fn apt_files(layers: &ExtractedLayers) -> (&str, &str) {
    (
        text(layers, dpkg::STATUS_PATH, DPKG_STATUS),
        text(layers, dpkg::EXTENDED_STATES_PATH, APT_EXTENDED_STATES),
    )
}

/// Content of the files in `status.d`, sorted by path.
pub fn distroless_files(layers: &ExtractedLayers) -> Vec<&str> {
    layers
        .iter()
        .filter(|(path, _)| *path != DISTROLESS_IGNORED)
        .filter_map(|(_, results)| results.get(DISTROLESS_STATUS)?.as_text())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_matchers() {
        let actions = os_package_actions();
        let matching = |path: &str| -> Vec<String> {
            actions
                .iter()
                .filter(|a| a.matches(path))
                .map(|a| a.name().to_owned())
                .collect()
        };

        assert_eq!(matching("/lib/apk/db/installed"), [APK_DB]);
        assert_eq!(matching("/var/lib/dpkg/status"), [DPKG_STATUS]);
        assert_eq!(matching("/var/lib/apt/extended_states"), [APT_EXTENDED_STATES]);
        assert_eq!(matching("/var/lib/dpkg/status.d/libc6"), [DISTROLESS_STATUS]);
        assert_eq!(matching("/usr/lib/os-release"), [OS_RELEASE]);

        assert!(matching("/var/lib/dpkg/status.d/nodejs").is_empty());
        assert!(matching("/var/lib/dpkg/status.d").is_empty());
        assert!(matching("/etc/passwd").is_empty());
    }

    #[test]
    fn file_patterns() {
        let action =
            file_pattern_action(&["/app/**/package.json"], &["/app/**/node_modules/**"]).unwrap();

        let layers = ExtractedLayers(
            [
                ("/app/package.json", "{}"),
                ("/app/node_modules/x/package.json", "{}"),
                ("/etc/hostname", "box"),
            ]
            .into_iter()
            .filter(|(path, _)| action.matches(path))
            .map(|(path, text)| {
                let results = [(action.name().to_owned(), FileContent::Binary(text.into()))];
                (path.to_owned(), results.into_iter().collect())
            })
            .collect(),
        );

        assert_eq!(matching_files(&layers, &action), [("/app", "package.json", &b"{}"[..])]);
    }
}
