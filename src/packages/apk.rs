//! Database of the Alpine package manager, in `/lib/apk/db/installed`.
//!
//! Each field is a line with a single-letter key, like `P:musl`.
//!
//! Ref: <https://wiki.alpinelinux.org/wiki/Apk_spec>

use super::AnalyzedPackage;

/// Path of the database in the image.
pub const DATABASE_PATH: &str = "/lib/apk/db/installed";

/// Characters that start a version constraint, like `so:libc.so=1` or
/// `busybox>=1.36`.
const CONSTRAINT_CHARS: &[char] = &['=', '<', '>', '~'];

pub fn parse(text: &str) -> Vec<AnalyzedPackage> {
    let mut packages = Vec::new();
    let mut current: Option<AnalyzedPackage> = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        if key == "P" {
            packages.extend(current.take());
            current = Some(AnalyzedPackage::new(value));
            continue;
        }

        // Fields before the first package are ignored.
        let Some(package) = current.as_mut() else {
            continue;
        };

        match key {
            "V" => package.version = Some(value.to_owned()),

            "p" => package
                .provides
                .extend(value.split_whitespace().map(strip_constraint)),

            "D" | "r" => package.deps.extend(
                value
                    .split_whitespace()
                    .filter(|name| !name.starts_with('!'))
                    .map(strip_constraint),
            ),

            _ => (),
        }
    }

    packages.extend(current);
    packages
}

fn strip_constraint(name: &str) -> String {
    match name.find(CONSTRAINT_CHARS) {
        Some(pos) => name[..pos].to_owned(),
        None => name.to_owned(),
    }
}

#[test]
fn constraints() {
    assert_eq!(strip_constraint("so:libc.musl-x86_64.so.1"), "so:libc.musl-x86_64.so.1");
    assert_eq!(strip_constraint("cmd:busybox=1.36.1-r29"), "cmd:busybox");
    assert_eq!(strip_constraint("busybox>=1.36"), "busybox");
    assert_eq!(strip_constraint("openssl~3.3"), "openssl");
}
