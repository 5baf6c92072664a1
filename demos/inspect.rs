use std::{fmt::Display, io, path::PathBuf};

use clap::Parser;
use oci_extract::{analyzer, inputs, ArchiveKind, EventHandler, Extractor, Platform};

#[derive(Parser, Debug)]
struct Args {
    /// Archive format: docker-archive, oci-archive, kaniko-archive.
    #[arg(short, long)]
    kind: Option<ArchiveKind>,

    /// Platform to read from multi-platform images, like `linux/arm64`.
    #[arg(short, long)]
    platform: Option<Platform>,

    /// Name of the image in the dependency trees.
    #[arg(short, long, default_value = "image")]
    name: String,

    /// Path to the image archive.
    archive: PathBuf,
}

struct Logger;

impl EventHandler for Logger {
    fn archive_opened(&self, kind: ArchiveKind, layers: usize) {
        eprintln!("OPEN {kind} ({layers} layers)");
    }

    fn layer_start(&self, layer: &str, archive_length: u64) {
        eprintln!("LAYER {layer} ({archive_length} bytes)");
    }

    fn layer_skipped(&self, layer: &str, cause: &dyn Display) {
        eprintln!("SKIP {layer}: {cause}");
    }

    fn action_failed(&self, path: &str, action: &str, error: &io::Error) {
        eprintln!("FAIL {action} {path}: {error}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut extractor = Extractor::new(&args.archive)
        .actions(inputs::os_package_actions())
        .event_handler(Logger);

    if let Some(kind) = args.kind {
        extractor = extractor.kind(kind);
    }

    if let Some(platform) = args.platform {
        extractor = extractor.platform(platform);
    }

    let result = extractor.extract()?;
    let analysis = analyzer::analyze(&result, &args.name)?;

    serde_json::to_writer_pretty(io::stdout().lock(), &analysis)?;
    println!();

    Ok(())
}
