//! Turn the files extracted by [`inputs::os_package_actions`] into lists
//! of packages and dependency trees.

use std::thread;

use crate::{
    dependency_tree::DependencyTree,
    inputs,
    os_release::{self, OsRelease, OsReleaseError},
    packages::{apk, dpkg, AnalysisType, AnalyzedPackage, PackagesAnalysis},
    ExtractionResult,
};

/// Packages found in an image.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    pub image_id: Option<String>,
    pub platform: Option<String>,
    pub os_release: OsRelease,

    /// One entry for every package manager, even if it found nothing.
    pub results: Vec<PackagesAnalysis>,

    /// One tree for every package manager with packages.
    pub dependency_trees: Vec<DependencyTree>,
}

/// Parse the package databases and release files of an image.
///
/// `image` is the name used for the root of the dependency trees, like
/// `debian:12`.
pub fn analyze(result: &ExtractionResult, image: &str) -> Result<ImageAnalysis, OsReleaseError> {
    let layers = &result.extracted_layers;

    // Parsers share nothing, so every database is parsed in its own thread.
    let (apk, apt, distroless, os_release) = thread::scope(|s| {
        let apk = s.spawn(|| apk::parse(inputs::apk_database(layers)));

        let apt = s.spawn(|| {
            let (status, extended_states) = inputs::apt_files(layers);
            dpkg::analyze(status, extended_states)
        });

        let distroless = s.spawn(|| dpkg::analyze_distroless(inputs::distroless_files(layers)));

        let os_release = os_release::detect(layers);

        (join(apk), join(apt), join(distroless), os_release)
    });

    let os_release = os_release?;

    let results = [
        (AnalysisType::Apk, apk),
        (AnalysisType::Apt, apt),
        (AnalysisType::Apt, distroless),
    ];

    let dependency_trees = results
        .iter()
        .filter(|(_, packages)| !packages.is_empty())
        .map(|(kind, packages)| {
            DependencyTree::for_image(image, kind.package_format(), packages, os_release.clone())
        })
        .collect();

    let results = results
        .into_iter()
        .map(|(analyze_type, analysis)| {
            tracing::debug!(%analyze_type, packages = analysis.len(), "packages analyzed");

            PackagesAnalysis {
                image: image.to_owned(),
                analyze_type,
                analysis,
            }
        })
        .collect();

    Ok(ImageAnalysis {
        image_id: result.image_id.clone(),
        platform: result.platform.clone(),
        os_release,
        results,
        dependency_trees,
    })
}

fn join(handle: thread::ScopedJoinHandle<'_, Vec<AnalyzedPackage>>) -> Vec<AnalyzedPackage> {
    match handle.join() {
        Ok(packages) => packages,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
