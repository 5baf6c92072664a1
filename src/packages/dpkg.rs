//! Databases of the Debian package manager.
//!
//! * `/var/lib/dpkg/status`: `Key: value` fields, one package per block.
//! * `/var/lib/apt/extended_states`: packages installed as dependencies.
//! * `/var/lib/dpkg/status.d/*`: one file per package, in distroless
//!   images.

use std::collections::HashMap;

use super::AnalyzedPackage;

pub const STATUS_PATH: &str = "/var/lib/dpkg/status";

pub const EXTENDED_STATES_PATH: &str = "/var/lib/apt/extended_states";

pub const DISTROLESS_STATUS_DIR: &str = "/var/lib/dpkg/status.d";

/// Parse a `status` file.
pub fn parse_status(text: &str) -> Vec<AnalyzedPackage> {
    let mut packages = Vec::new();
    let mut current: Option<AnalyzedPackage> = None;

    for line in text.lines() {
        // Continuation lines start with a space, so they never match a key.
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };

        if key == "Package" {
            packages.extend(current.take());
            current = Some(AnalyzedPackage::new(value.trim()));
            continue;
        }

        let Some(package) = current.as_mut() else {
            continue;
        };

        match key {
            "Version" => package.version = Some(value.trim().to_owned()),

            "Source" => package.source = value.split_whitespace().next().map(str::to_owned),

            "Provides" => package.provides.extend(
                value
                    .split(',')
                    .filter_map(|p| p.split_whitespace().next())
                    .map(str::to_owned),
            ),

            // Every alternative in `a | b` is recorded.
            "Depends" | "Pre-Depends" => package.deps.extend(
                value
                    .split([',', '|'])
                    .filter_map(|d| d.split_whitespace().next())
                    .map(str::to_owned),
            ),

            _ => (),
        }
    }

    packages.extend(current);
    packages
}

/// Parse the `Auto-Installed` flags from an `extended_states` file.
pub fn parse_extended_states(text: &str) -> HashMap<String, bool> {
    let mut states = HashMap::new();
    let mut current: Option<&str> = None;

    for line in text.lines() {
        match line.split_once(": ") {
            Some(("Package", name)) => current = Some(name.trim()),

            Some(("Auto-Installed", value)) => {
                if let Some(name) = current {
                    states.insert(name.to_owned(), value.trim() == "1");
                }
            }

            _ => (),
        }
    }

    states
}

/// Join the flags from `extended_states` to the packages of `status`.
///
/// Packages missing in `extended_states` are left unchanged.
pub fn set_auto_installed(packages: &mut [AnalyzedPackage], states: &HashMap<String, bool>) {
    for package in packages {
        if let Some(&auto) = states.get(&package.name) {
            package.auto_installed = Some(auto);
        }
    }
}

/// Parse the `status` and `extended_states` files of an image.
pub fn analyze(status: &str, extended_states: &str) -> Vec<AnalyzedPackage> {
    let mut packages = parse_status(status);

    if !extended_states.is_empty() {
        set_auto_installed(&mut packages, &parse_extended_states(extended_states));
    }

    packages
}

/// Parse the files from `status.d` in distroless images.
pub fn analyze_distroless<'a>(files: impl IntoIterator<Item = &'a str>) -> Vec<AnalyzedPackage> {
    files.into_iter().flat_map(parse_status).collect()
}
