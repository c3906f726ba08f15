//! Framework version resolution against a registry tag list

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Default tag listing for the framework base image
pub const DEFAULT_TAGS_URL: &str =
    "https://registry.hub.docker.com/v2/repositories/podweave/runtime/tags?page_size=100";

/// Errors that can occur while reading a tag list
#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Tag list request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unrecognised tag list format: {0}")]
    Format(String),
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Registry responses: a bare array (v1) or a paged object (v2)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagList {
    Flat(Vec<TagEntry>),
    Paged { results: Vec<TagEntry> },
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Extract tag names from a registry response body
pub fn parse_tag_names(body: &str) -> Result<Vec<String>, VersionError> {
    let list: TagList =
        serde_json::from_str(body).map_err(|e| VersionError::Format(e.to_string()))?;
    let entries = match list {
        TagList::Flat(entries) => entries,
        TagList::Paged { results } => results,
    };
    Ok(entries.into_iter().map(|t| t.name).collect())
}

/// Pick `running` if it is published, otherwise `fallback`
pub fn select_version(tags: &[String], running: &str, fallback: &str) -> String {
    if tags.iter().any(|t| t == running) {
        running.to_string()
    } else {
        fallback.to_string()
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

async fn fetch_tags(url: &str) -> Result<Vec<String>, VersionError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    parse_tag_names(&body)
}

/// Resolve the base image tag for the running framework version
///
/// Registry failures degrade to `fallback` so an offline deploy still gets a
/// usable tag.
pub async fn resolve_framework_version(url: &str, running: &str, fallback: &str) -> String {
    match fetch_tags(url).await {
        Ok(tags) => {
            let version = select_version(&tags, running, fallback);
            debug!("Resolved base image version {} from {} tags", version, tags.len());
            version
        }
        Err(e) => {
            warn!(
                "Could not read tag list from {}: {}; using '{}'",
                url, e, fallback
            );
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_tag_list() {
        let body = r#"[{"layer": "", "name": "0.1.0"}, {"layer": "", "name": "master"}]"#;
        assert_eq!(parse_tag_names(body).unwrap(), vec!["0.1.0", "master"]);
    }

    #[test]
    fn test_parse_paged_tag_list() {
        let body = r#"{"count": 2, "results": [{"name": "0.2.0"}, {"name": "latest"}]}"#;
        assert_eq!(parse_tag_names(body).unwrap(), vec!["0.2.0", "latest"]);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_tag_names(r#"{"detail": "not found"}"#),
            Err(VersionError::Format(_))
        ));
    }

    #[test]
    fn test_select_version() {
        let tags = vec!["0.1.0".to_string(), "master".to_string()];
        assert_eq!(select_version(&tags, "0.1.0", "master"), "0.1.0");
        assert_eq!(select_version(&tags, "0.9.0", "master"), "master");
    }

    #[tokio::test]
    async fn test_unreachable_registry_falls_back() {
        let version = resolve_framework_version("http://127.0.0.1:1/tags", "0.1.0", "master").await;
        assert_eq!(version, "master");
    }
}
