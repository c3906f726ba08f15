pub mod manifest;

pub use manifest::{
    expand_env, parse_manifest, validate_manifest, FlowManifest, GatewaySpec, ManifestError,
    ManifestFormat, PodSpec,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load, expand and validate a flow manifest from disk
pub fn load_manifest_file(path: &Path) -> Result<FlowManifest, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let manifest = parse_manifest(&content, ManifestFormat::from_path(path))?;
    Ok(manifest)
}
