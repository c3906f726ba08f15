//! Container image selection for units
//!
//! A unit's `uses` reference either names a concrete image or the
//! default-executor sentinel, in which case the unit runs the framework base
//! image with the bundled default executor class.

pub mod version;

use serde::{Deserialize, Serialize};

pub use version::{parse_tag_names, resolve_framework_version, VersionError};

/// Sentinel `uses` value meaning "framework default executor"
pub const DEFAULT_USES: &str = "BaseExecutor";

/// Image settings shared by every unit of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageConfig {
    /// Repository of the framework base image
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Tag of the base image, normally the resolved framework version
    #[serde(default = "default_version")]
    pub version: String,
    /// Suffix appended to the version to form the full tag
    #[serde(default = "default_tag_suffix")]
    pub tag_suffix: String,
    /// `uses` value that selects the default executor
    #[serde(default = "default_uses")]
    pub default_uses: String,
    /// Executor class passed to `--uses` for default-image units
    #[serde(default = "default_uses")]
    pub default_executor_class: String,
    /// Config path passed to `--uses` for custom images
    #[serde(default = "default_custom_uses_path")]
    pub custom_uses_path: String,
    /// Entrypoint command of runtime and gateway containers
    #[serde(default = "default_command")]
    pub command: Vec<String>,
}

fn default_repository() -> String {
    "podweave/runtime".to_string()
}

fn default_version() -> String {
    "master".to_string()
}

fn default_tag_suffix() -> String {
    "-standard".to_string()
}

fn default_uses() -> String {
    DEFAULT_USES.to_string()
}

fn default_custom_uses_path() -> String {
    "config.yml".to_string()
}

fn default_command() -> Vec<String> {
    vec!["podweave".to_string()]
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            version: default_version(),
            tag_suffix: default_tag_suffix(),
            default_uses: default_uses(),
            default_executor_class: default_uses(),
            custom_uses_path: default_custom_uses_path(),
            command: default_command(),
        }
    }
}

impl ImageConfig {
    /// Replace the base image version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Full reference of the framework base image
    pub fn base_image(&self) -> String {
        format!("{}:{}{}", self.repository, self.version, self.tag_suffix)
    }
}

/// Outcome of resolving a `uses` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedImage {
    /// Run this image with its bundled config
    Custom(String),
    /// Run the framework base image with the default executor
    FrameworkDefault,
}

/// Maps a logical `uses` reference to an image
pub trait ImageResolver: Send + Sync {
    fn resolve(&self, uses: &str) -> ResolvedImage;
}

/// Resolver for plain image references
///
/// - the default-executor sentinel (or an empty reference) selects the base image
/// - `docker://image` selects `image`
/// - anything else is taken as an image reference verbatim
#[derive(Debug, Clone)]
pub struct DefaultImageResolver {
    default_uses: String,
}

impl DefaultImageResolver {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            default_uses: config.default_uses.clone(),
        }
    }
}

impl ImageResolver for DefaultImageResolver {
    fn resolve(&self, uses: &str) -> ResolvedImage {
        let uses = uses.trim();
        if uses.is_empty() || uses == self.default_uses {
            return ResolvedImage::FrameworkDefault;
        }
        match uses.strip_prefix("docker://") {
            Some(image) => ResolvedImage::Custom(image.to_string()),
            None => ResolvedImage::Custom(uses.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_image() {
        let config = ImageConfig::default().with_version("0.3.1");
        assert_eq!(config.base_image(), "podweave/runtime:0.3.1-standard");
    }

    #[test]
    fn test_resolver() {
        let resolver = DefaultImageResolver::new(&ImageConfig::default());
        assert_eq!(resolver.resolve(DEFAULT_USES), ResolvedImage::FrameworkDefault);
        assert_eq!(resolver.resolve(""), ResolvedImage::FrameworkDefault);
        assert_eq!(
            resolver.resolve("docker://acme/merger:2"),
            ResolvedImage::Custom("acme/merger:2".to_string())
        );
        assert_eq!(
            resolver.resolve("acme/encoder"),
            ResolvedImage::Custom("acme/encoder".to_string())
        );
    }

    #[test]
    fn test_custom_sentinel() {
        let config = ImageConfig {
            default_uses: "_pass".to_string(),
            ..Default::default()
        };
        let resolver = DefaultImageResolver::new(&config);
        assert_eq!(resolver.resolve("_pass"), ResolvedImage::FrameworkDefault);
        assert_eq!(
            resolver.resolve(DEFAULT_USES),
            ResolvedImage::Custom(DEFAULT_USES.to_string())
        );
    }

    #[test]
    fn test_config_from_yaml_defaults() {
        let config: ImageConfig = serde_yaml::from_str("repository: acme/base").unwrap();
        assert_eq!(config.repository, "acme/base");
        assert_eq!(config.command, vec!["podweave"]);
        assert_eq!(config.tag_suffix, "-standard");
    }
}
