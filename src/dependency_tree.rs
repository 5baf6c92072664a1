//! Build a dependency tree from the packages installed in an image.
//!
//! Packages installed explicitly are the roots of the tree. Packages
//! installed as dependencies of something else appear below them, and
//! the ones that nothing references are attached to the root too.
//!
//! The result is a spanning tree, not a graph: a package is expanded only
//! the first time it is found, and later occurrences are leaves. Cycles
//! are cut the same way, and dependencies that no package provides are
//! dropped.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::{os_release::OsRelease, packages::AnalyzedPackage};

/// A package in the tree.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DependencyNode {
    pub name: String,
    pub version: Option<String>,

    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, DependencyNode>,
}

impl DependencyNode {
    fn leaf(name: String, package: &AnalyzedPackage) -> Self {
        DependencyNode {
            name,
            version: package.version.clone(),
            dependencies: IndexMap::new(),
        }
    }

    /// Number of nodes below this one.
    pub fn size(&self) -> usize {
        self.dependencies.values().map(|d| 1 + d.size()).sum()
    }
}

/// Root of the tree for a whole image.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTree {
    pub name: String,
    pub version: String,

    #[serde(rename = "targetOS")]
    pub target_os: OsRelease,

    pub package_format_version: String,
    pub dependencies: IndexMap<String, DependencyNode>,
}

impl DependencyTree {
    /// Tree for `image` (like `debian:12`), from the packages of a
    /// package manager with the given format (`apk`, `deb`, `rpm`).
    pub fn for_image(
        image: &str,
        format: &str,
        packages: &[AnalyzedPackage],
        os: OsRelease,
    ) -> Self {
        let (name, version) = split_image_name(image);

        DependencyTree {
            name: format!("docker-image|{name}"),
            version: version.to_owned(),
            target_os: os,
            package_format_version: format!("{format}:0.0.1"),
            dependencies: build(packages),
        }
    }

    /// Number of packages in the tree, counting repeated leaves.
    pub fn size(&self) -> usize {
        self.dependencies.values().map(|d| 1 + d.size()).sum()
    }
}

/// Split `name:tag`. References by digest keep the whole string as name.
fn split_image_name(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, ""),
    }
}

/// Build the top-level dependencies of the tree, keyed by the full name
/// (`source/name`) of each package.
pub fn build(packages: &[AnalyzedPackage]) -> IndexMap<String, DependencyNode> {
    let mut builder = TreeBuilder::new(packages);
    let mut roots = IndexMap::new();

    for (index, package) in packages.iter().enumerate() {
        if package.auto_installed != Some(true) {
            builder.attach(&mut roots, index, &[]);
        }
    }

    // Auto-installed packages that no other package depends on.
    for index in 0..packages.len() {
        if !builder.visited.contains(&builder.by_name(index)) {
            builder.attach(&mut roots, index, &[]);
        }
    }

    roots
}

struct TreeBuilder<'a> {
    packages: &'a [AnalyzedPackage],

    /// Index of the package for every name. With duplicates, the last
    /// package wins.
    names: HashMap<&'a str, usize>,

    /// Index of the package that provides a virtual name.
    provided: HashMap<&'a str, usize>,

    /// Packages already expanded.
    visited: HashSet<usize>,
}

impl<'a> TreeBuilder<'a> {
    fn new(packages: &'a [AnalyzedPackage]) -> Self {
        let mut names = HashMap::new();
        let mut provided = HashMap::new();

        for (index, package) in packages.iter().enumerate() {
            names.insert(package.name.as_str(), index);

            for virt in &package.provides {
                provided.insert(virt.as_str(), index);
            }
        }

        TreeBuilder {
            packages,
            names,
            provided,
            visited: HashSet::new(),
        }
    }

    /// Package used in the tree for the package at `index`.
    fn by_name(&self, index: usize) -> usize {
        self.names
            .get(self.packages[index].name.as_str())
            .copied()
            .unwrap_or(index)
    }

    fn resolve(&self, name: &str) -> Option<usize> {
        self.names
            .get(name)
            .or_else(|| self.provided.get(name))
            .copied()
    }

    /// Add the subtree of the package at `index` to `parent`, unless
    /// `parent` already has a node with the same name.
    fn attach(
        &mut self,
        parent: &mut IndexMap<String, DependencyNode>,
        index: usize,
        ancestors: &[String],
    ) {
        let index = self.by_name(index);
        let node = self.expand(index, ancestors);

        parent.entry(node.name.clone()).or_insert(node);
    }

    fn expand(&mut self, index: usize, ancestors: &[String]) -> DependencyNode {
        let packages = self.packages;
        let package = &packages[index];
        let full_name = package.full_name();

        let mut node = DependencyNode::leaf(full_name.clone(), package);

        if ancestors.contains(&full_name) || !self.visited.insert(index) {
            return node;
        }

        let mut path = ancestors.to_vec();
        path.push(full_name);

        for dep in &package.deps {
            match self.resolve(dep) {
                Some(child) => self.attach(&mut node.dependencies, child, &path),
                None => {
                    tracing::trace!(package = %package.name, dep = %dep, "unresolved dependency")
                }
            }
        }

        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str, deps: &[&str]) -> AnalyzedPackage {
        AnalyzedPackage {
            version: Some("1.0".into()),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            ..AnalyzedPackage::new(name)
        }
    }

    fn auto(mut package: AnalyzedPackage) -> AnalyzedPackage {
        package.auto_installed = Some(true);
        package
    }

    fn names(deps: &IndexMap<String, DependencyNode>) -> Vec<&str> {
        deps.keys().map(String::as_str).collect()
    }

    #[test]
    fn cycles_are_leaves() {
        let packages = [package("a", &["b"]), auto(package("b", &["a"]))];

        let tree = build(&packages);
        assert_eq!(names(&tree), ["a"]);

        let b = &tree["a"].dependencies["b"];
        assert_eq!(names(&b.dependencies), ["a"]);
        assert!(b.dependencies["a"].dependencies.is_empty());

        let tree = build(&[package("self", &["self"])]);
        assert_eq!(tree["self"].size(), 1);
    }

    #[test]
    fn virtual_packages() {
        let mut mawk = auto(package("mawk", &[]));
        mawk.provides.push("awk".into());

        let packages = [package("base", &["awk", "missing"]), mawk];

        let tree = build(&packages);
        assert_eq!(names(&tree), ["base"]);
        assert_eq!(names(&tree["base"].dependencies), ["mawk"]);
    }

    #[test]
    fn expand_once() {
        let packages = [
            package("curl", &["libc"]),
            package("wget", &["libc"]),
            auto(package("libc", &["libgcc"])),
            auto(package("libgcc", &[])),
        ];

        let tree = build(&packages);
        assert_eq!(names(&tree), ["curl", "wget"]);

        assert_eq!(names(&tree["curl"].dependencies["libc"].dependencies), ["libgcc"]);
        assert!(tree["wget"].dependencies["libc"].dependencies.is_empty());

        // Manual packages already expanded below another root are
        // attached as leaves.
        let tree = build(&[package("a", &["b"]), package("b", &["c"]), auto(package("c", &[]))]);
        assert_eq!(names(&tree), ["a", "b"]);
        assert!(tree["b"].dependencies.is_empty());
    }

    #[test]
    fn orphaned_auto_installed() {
        let packages = [
            package("app", &[]),
            auto(package("orphan", &["dep"])),
            auto(package("dep", &[])),
        ];

        let tree = build(&packages);
        assert_eq!(names(&tree), ["app", "orphan"]);
        assert_eq!(names(&tree["orphan"].dependencies), ["dep"]);
    }

    #[test]
    fn source_names() {
        let mut libc = auto(package("libc6", &[]));
        libc.source = Some("glibc".into());

        let tree = build(&[package("bash", &["libc6"]), libc]);
        assert_eq!(names(&tree["bash"].dependencies), ["glibc/libc6"]);
        assert_eq!(tree["bash"].dependencies["glibc/libc6"].name, "glibc/libc6");
    }

    #[test]
    fn image_root() {
        let os = OsRelease {
            name: "alpine".into(),
            version: "3.20.3".into(),
            pretty_name: None,
        };

        let tree = DependencyTree::for_image("alpine:3.20", "apk", &[package("musl", &[])], os);

        assert_eq!(tree.name, "docker-image|alpine");
        assert_eq!(tree.version, "3.20");
        assert_eq!(tree.package_format_version, "apk:0.0.1");
        assert_eq!(tree.size(), 1);

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["targetOS"]["name"], "alpine");
        assert_eq!(
            json["dependencies"]["musl"],
            serde_json::json!({"name": "musl", "version": "1.0"})
        );
    }

    #[test]
    fn image_names() {
        assert_eq!(split_image_name("localhost:5000/app"), ("localhost:5000/app", ""));
        assert_eq!(split_image_name("localhost:5000/app:v1"), ("localhost:5000/app", "v1"));
        assert_eq!(split_image_name("debian@sha256:abcd"), ("debian@sha256:abcd", ""));
        assert_eq!(split_image_name("image.tar"), ("image.tar", ""));
    }
}
