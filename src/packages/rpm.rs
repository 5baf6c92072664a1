//! Output of `rpm --query --all --queryformat "%{NAME}\t%{VERSION}\t%{SIZE}\n"`.
//!
//! The binary RPM database is not parsed here.

use super::AnalyzedPackage;

pub fn parse(output: &str) -> Vec<AnalyzedPackage> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');

            match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(version), Some(size))
                    if !name.is_empty() && !version.is_empty() && !size.is_empty() =>
                {
                    Some(AnalyzedPackage {
                        version: Some(version.to_owned()),
                        ..AnalyzedPackage::new(name)
                    })
                }

                _ => None,
            }
        })
        .collect()
}
