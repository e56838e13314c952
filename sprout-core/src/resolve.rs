// sprout-core/src/resolve.rs
use sprout_common::error::{Result, SproutError};
use sprout_common::model::{Architecture, ArtifactDescriptor, Formula};

/// Picks the artifact for `arch`, substituting `{version}` in its URL.
///
/// A missing entry is an error, never a fallback to another architecture.
pub fn resolve(formula: &Formula, arch: Architecture) -> Result<ArtifactDescriptor> {
    let descriptor =
        formula
            .artifact(arch)
            .ok_or_else(|| SproutError::NoArtifactForArchitecture {
                name: formula.name.clone(),
                arch: arch.to_string(),
            })?;
    Ok(ArtifactDescriptor {
        url: descriptor.url.replace("{version}", &formula.version),
        checksum: descriptor.checksum.clone(),
    })
}

/// Like [`resolve`], for an architecture tag that still needs parsing.
pub fn resolve_tag(formula: &Formula, arch: &str) -> Result<ArtifactDescriptor> {
    resolve(formula, arch.parse()?)
}
