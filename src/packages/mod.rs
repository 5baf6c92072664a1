//! Parsers for the databases of OS package managers.
//!
//! The parsers read the text of a database file line by line. Unknown
//! lines are ignored, and an empty file is an empty list of packages.

pub mod apk;
pub mod dpkg;
pub mod rpm;


use std::fmt;

use indexmap::IndexSet;
use serde::{ser::SerializeMap, Serializer};

/// A package installed in the image.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalyzedPackage {
    pub name: String,

    pub version: Option<String>,

    /// Source package, when it is different from the binary package.
    pub source: Option<String>,

    /// Virtual packages provided by this one.
    pub provides: Vec<String>,

    /// Names of the dependencies, without version constraints, in the
    /// order they are declared.
    #[serde(serialize_with = "names_as_map")]
    pub deps: IndexSet<String>,

    /// `None` if the package manager does not track it.
    pub auto_installed: Option<bool>,
}

impl AnalyzedPackage {
    pub fn new(name: impl Into<String>) -> Self {
        AnalyzedPackage {
            name: name.into(),
            ..AnalyzedPackage::default()
        }
    }

    /// Name of the package, prefixed by its source package (if any).
    pub fn full_name(&self) -> String {
        match &self.source {
            Some(source) => format!("{source}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Serialize dependencies as `{"name": true}`.
fn names_as_map<S: Serializer>(names: &IndexSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(names.len()))?;
    for name in names {
        map.serialize_entry(name, &true)?;
    }

    map.end()
}

/// Package manager that produced an analysis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum AnalysisType {
    Apk,
    Apt,
    Rpm,
}

impl AnalysisType {
    /// Name of the package format, used in dependency trees.
    pub fn package_format(&self) -> &'static str {
        match self {
            AnalysisType::Apk => "apk",
            AnalysisType::Apt => "deb",
            AnalysisType::Rpm => "rpm",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Packages found by one package manager.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackagesAnalysis {
    pub image: String,
    pub analyze_type: AnalysisType,
    pub analysis: Vec<AnalyzedPackage>,
}
