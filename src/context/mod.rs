use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::images::version::DEFAULT_TAGS_URL;
use crate::k8s::ApiServerConfig;
use crate::pod::{StartOptions, WaitOptions};

/// Name of the built-in context that talks to the API server of the cluster
/// this process runs in
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Mount point of the service-account credentials inside a cluster pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Default config file location: ~/.podweave/config
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".podweave")
        .join("config")
}

/// Errors that can occur during context operations
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context '{0}' not found")]
    ContextNotFound(String),

    #[error("No current context set")]
    NoCurrentContext,

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to read {0}: {1}")]
    CredentialRead(PathBuf, std::io::Error),

    #[error("Not running inside a cluster: {0} is not set")]
    NotInCluster(&'static str),
}

/// A named connection to a Kubernetes API server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Context {
    pub name: String,
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// File holding the bearer token; read on every connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// PEM CA bundle used to verify the server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Orchestration settings shared by every deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrchestrationDefaults {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall readiness deadline per unit; unset waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timeout_secs: Option<u64>,
    #[serde(default)]
    pub parallel_shards: bool,
    /// Registry tag listing used to pick the base image version
    #[serde(default = "default_tags_url")]
    pub tags_url: String,
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Tag used when the running version is not published
    #[serde(default = "default_fallback_tag")]
    pub fallback_tag: String,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_tags_url() -> String {
    DEFAULT_TAGS_URL.to_string()
}

fn default_repository() -> String {
    "podweave/runtime".to_string()
}

fn default_fallback_tag() -> String {
    "master".to_string()
}

impl Default for OrchestrationDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            start_timeout_secs: None,
            parallel_shards: false,
            tags_url: default_tags_url(),
            repository: default_repository(),
            fallback_tag: default_fallback_tag(),
        }
    }
}

impl OrchestrationDefaults {
    pub fn wait_options(&self) -> WaitOptions {
        let options = WaitOptions::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        match self.start_timeout_secs {
            Some(secs) => options.with_deadline(Duration::from_secs(secs)),
            None => options,
        }
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            wait: self.wait_options(),
            parallel_shards: self.parallel_shards,
        }
    }
}

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Currently active context name
    #[serde(rename = "current-context")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,

    /// Map of context name to context definition
    #[serde(default)]
    pub contexts: HashMap<String, Context>,

    #[serde(default)]
    pub defaults: OrchestrationDefaults,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<Config, ContextError> {
    serde_yaml::from_str(content).map_err(|e| ContextError::ParseError(e.to_string()))
}

/// Serialize config to YAML string
pub fn serialize_config(config: &Config) -> Result<String, ContextError> {
    serde_yaml::to_string(config).map_err(|e| ContextError::WriteError(e.to_string()))
}

/// Add or update a context in the config
pub fn add_context(config: &mut Config, context: Context) {
    config.contexts.insert(context.name.clone(), context);
}

/// Remove a context from the config
pub fn remove_context(config: &mut Config, name: &str) -> Option<Context> {
    let removed = config.contexts.remove(name);
    if config.current_context.as_deref() == Some(name) {
        config.current_context = None;
    }
    removed
}

/// Set the current context
pub fn set_current_context(config: &mut Config, name: &str) -> Result<(), ContextError> {
    if !config.contexts.contains_key(name) && name != IN_CLUSTER_CONTEXT {
        return Err(ContextError::ContextNotFound(name.to_string()));
    }
    config.current_context = Some(name.to_string());
    Ok(())
}

/// Get the current context
pub fn get_current_context(config: &Config) -> Result<&str, ContextError> {
    config
        .current_context
        .as_deref()
        .ok_or(ContextError::NoCurrentContext)
}

/// Get a context by name
pub fn get_context<'a>(config: &'a Config, name: &str) -> Result<&'a Context, ContextError> {
    config
        .contexts
        .get(name)
        .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))
}

/// List all context names, sorted
pub fn list_contexts(config: &Config) -> Vec<&str> {
    let mut names: Vec<&str> = config.contexts.keys().map(|s| s.as_str()).collect();
    names.sort_unstable();
    names
}

/// API server URL from the in-cluster service environment
pub fn in_cluster_server(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<Config, ContextError> {
    load_config_from(&default_config_path())
}

/// Load config from a specific path; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> Result<Config, ContextError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Save config to the default location
pub fn save_config(config: &Config) -> Result<(), ContextError> {
    save_config_to(config, &default_config_path())
}

/// Save config to a specific path
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ContextError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

fn read_credential(path: &Path) -> Result<Vec<u8>, ContextError> {
    std::fs::read(path).map_err(|e| ContextError::CredentialRead(path.to_path_buf(), e))
}

/// Connection settings of the in-cluster service account
pub fn in_cluster_api_config(account_dir: &Path) -> Result<ApiServerConfig, ContextError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| ContextError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| ContextError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;

    let token = read_credential(&account_dir.join("token"))?;
    let ca = read_credential(&account_dir.join("ca.crt"))?;

    let mut config = ApiServerConfig::new(in_cluster_server(&host, &port));
    config.token = Some(String::from_utf8_lossy(&token).trim().to_string());
    config.ca_pem = Some(ca);
    Ok(config)
}

impl Config {
    /// Name of the active context; defaults to the in-cluster context
    pub fn current_name(&self) -> &str {
        self.current_context.as_deref().unwrap_or(IN_CLUSTER_CONTEXT)
    }

    /// Check if currently using the in-cluster context
    pub fn is_in_cluster(&self) -> bool {
        self.current_name() == IN_CLUSTER_CONTEXT
    }

    /// Connection settings for the active context
    pub fn api_server_config(&self) -> Result<ApiServerConfig, ContextError> {
        match self.current_name() {
            IN_CLUSTER_CONTEXT => in_cluster_api_config(Path::new(SERVICE_ACCOUNT_DIR)),
            name => get_context(self, name)?.api_server_config(),
        }
    }
}

impl Context {
    /// Create a new context
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            token: None,
            token_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
            description: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Add a description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Resolve credentials into connection settings
    ///
    /// An inline token wins over `token-file`.
    pub fn api_server_config(&self) -> Result<ApiServerConfig, ContextError> {
        let mut config = ApiServerConfig::new(self.server.trim_end_matches('/'));
        config.insecure_skip_tls_verify = self.insecure_skip_tls_verify;

        config.token = match (&self.token, &self.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(path)) => {
                Some(String::from_utf8_lossy(&read_credential(path)?).trim().to_string())
            }
            (None, None) => None,
        };

        if let Some(path) = &self.ca_file {
            config.ca_pem = Some(read_credential(path)?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.current_context.is_none());
        assert!(config.contexts.is_empty());
        assert!(config.is_in_cluster());
        assert_eq!(config.defaults.poll_interval_ms, 100);
        assert!(!config.defaults.parallel_shards);
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
current-context: staging
contexts:
  staging:
    name: staging
    server: https://10.0.0.1:6443
    token: secret123
    insecure-skip-tls-verify: true
defaults:
  poll-interval-ms: 250
  start-timeout-secs: 600
  parallel-shards: true
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.current_context, Some("staging".to_string()));
        let ctx = get_context(&config, "staging").unwrap();
        assert!(ctx.insecure_skip_tls_verify);
        assert_eq!(config.defaults.fallback_tag, "master");

        let options = config.defaults.start_options();
        assert_eq!(options.wait.poll_interval, Duration::from_millis(250));
        assert_eq!(options.wait.deadline, Some(Duration::from_secs(600)));
        assert!(options.parallel_shards);
    }

    #[test]
    fn test_serialize_config() {
        let mut config = Config::default();
        add_context(
            &mut config,
            Context::new("test", "https://localhost:6443").with_token("key123"),
        );
        set_current_context(&mut config, "test").unwrap();

        let yaml = serialize_config(&config).unwrap();
        assert!(yaml.contains("current-context: test"));
        assert!(yaml.contains("server: https://localhost:6443"));
    }

    #[test]
    fn test_remove_context_clears_current() {
        let mut config = Config::default();
        add_context(&mut config, Context::new("test", "https://localhost:6443"));
        set_current_context(&mut config, "test").unwrap();

        assert!(remove_context(&mut config, "test").is_some());
        assert!(config.current_context.is_none());
    }

    #[test]
    fn test_set_current_context() {
        let mut config = Config::default();
        let result = set_current_context(&mut config, "nonexistent");
        assert!(matches!(result, Err(ContextError::ContextNotFound(_))));

        set_current_context(&mut config, IN_CLUSTER_CONTEXT).unwrap();
        assert_eq!(get_current_context(&config).unwrap(), IN_CLUSTER_CONTEXT);
    }

    #[test]
    fn test_list_contexts_sorted() {
        let mut config = Config::default();
        add_context(&mut config, Context::new("prod", "https://b"));
        add_context(&mut config, Context::new("dev", "https://a"));
        assert_eq!(list_contexts(&config), vec!["dev", "prod"]);
    }

    #[test]
    fn test_in_cluster_server() {
        assert_eq!(in_cluster_server("10.96.0.1", "443"), "https://10.96.0.1:443");
        assert_eq!(in_cluster_server("fd00::1", "443"), "https://[fd00::1]:443");
    }

    #[test]
    fn test_context_reads_token_and_ca_files() {
        let mut token = NamedTempFile::new().unwrap();
        writeln!(token, "file-token").unwrap();
        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();

        let mut ctx = Context::new("dev", "https://10.0.0.1:6443/").with_ca_file(ca.path());
        ctx.token_file = Some(token.path().to_path_buf());

        let api = ctx.api_server_config().unwrap();
        assert_eq!(api.server, "https://10.0.0.1:6443");
        assert_eq!(api.token.as_deref(), Some("file-token"));
        assert!(api.ca_pem.is_some());

        let api = ctx.with_token("inline").api_server_config().unwrap();
        assert_eq!(api.token.as_deref(), Some("inline"));
    }

    #[test]
    fn test_missing_credential_file() {
        let ctx = Context::new("dev", "https://x").with_ca_file("/nonexistent/ca.crt");
        assert!(matches!(
            ctx.api_server_config(),
            Err(ContextError::CredentialRead(_, _))
        ));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config");
        assert!(load_config_from(&path).unwrap().contexts.is_empty());

        let mut config = Config::default();
        add_context(&mut config, Context::new("dev", "https://a"));
        save_config_to(&config, &path).unwrap();
        assert!(load_config_from(&path).unwrap().contexts.contains_key("dev"));
    }
}
