//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::DeployArgs;
use crate::config::{load_manifest_file, ConfigError, FlowManifest};
use crate::context::{self, Config, Context, ContextError, OrchestrationDefaults, IN_CLUSTER_CONTEXT};
use crate::flow::{FlowDeployment, FlowError, RoutingTable};
use crate::images::{resolve_framework_version, ImageConfig};
use crate::k8s::{ControlPlaneError, KubeApiClient, SharedControlPlane, SimulatedControlPlane};
use crate::pod::{StartOptions, TeardownReport, UnitContext};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Cluster error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Context Commands (Pure business logic)
// ============================================================================

/// Info about a context for display
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub name: String,
    pub server: String,
    pub is_current: bool,
}

/// List all contexts, including the built-in in-cluster one
pub fn context_list(config: &Config) -> Vec<ContextInfo> {
    let current = config.current_name();
    let mut contexts: Vec<_> = config
        .contexts
        .iter()
        .map(|(name, ctx)| ContextInfo {
            name: name.clone(),
            server: ctx.server.clone(),
            is_current: name == current,
        })
        .collect();

    contexts.push(ContextInfo {
        name: IN_CLUSTER_CONTEXT.to_string(),
        server: "(service account)".to_string(),
        is_current: current == IN_CLUSTER_CONTEXT,
    });

    contexts.sort_by(|a, b| a.name.cmp(&b.name));
    contexts
}

/// Get current context name and server
pub fn context_current(config: &Config) -> CommandResult<(String, String)> {
    let name = config.current_name();
    let server = match name {
        IN_CLUSTER_CONTEXT => "(service account)".to_string(),
        other => context::get_context(config, other)?.server.clone(),
    };
    Ok((name.to_string(), server))
}

/// Switch to a context
pub fn context_use(config: &mut Config, name: &str) -> CommandResult<()> {
    context::set_current_context(config, name)?;
    Ok(())
}

/// Connection settings for `context set`
#[derive(Debug, Clone, Default)]
pub struct ContextSettings {
    pub server: String,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
}

/// Add or replace a context
pub fn context_set(config: &mut Config, name: &str, settings: ContextSettings) {
    let mut ctx = Context::new(name, settings.server);
    ctx.token = settings.token;
    ctx.token_file = settings.token_file;
    ctx.ca_file = settings.ca_file;
    ctx.insecure_skip_tls_verify = settings.insecure_skip_tls_verify;
    context::add_context(config, ctx);
}

/// Delete a context
pub fn context_delete(config: &mut Config, name: &str) -> bool {
    context::remove_context(config, name).is_some()
}

// ============================================================================
// Flow Commands
// ============================================================================

/// Load a manifest, applying deploy-time overrides
pub fn load_flow(path: &Path, noblock: bool) -> CommandResult<FlowManifest> {
    let mut manifest = load_manifest_file(path)?;
    if noblock {
        manifest.noblock_on_start = true;
    }
    Ok(manifest)
}

/// Start options from the config defaults and command-line overrides
pub fn start_options(
    defaults: &OrchestrationDefaults,
    args: &DeployArgs,
    cancel: Option<CancellationToken>,
) -> StartOptions {
    let mut options = defaults.start_options();
    if let Some(secs) = args.timeout {
        options.wait.deadline = Some(Duration::from_secs(secs));
    }
    options.parallel_shards |= args.parallel_shards;
    options.wait.cancel = cancel;
    options
}

/// Image settings for a flow
///
/// A manifest that pins `images` is used as is. Otherwise the base image
/// version is looked up in the registry, unless `offline`, in which case the
/// fallback tag is used.
pub async fn image_config(
    manifest: &FlowManifest,
    defaults: &OrchestrationDefaults,
    offline: bool,
) -> ImageConfig {
    if let Some(images) = &manifest.images {
        return images.clone();
    }
    let version = if offline {
        defaults.fallback_tag.clone()
    } else {
        resolve_framework_version(
            &defaults.tags_url,
            env!("CARGO_PKG_VERSION"),
            &defaults.fallback_tag,
        )
        .await
    };
    ImageConfig {
        repository: defaults.repository.clone(),
        ..ImageConfig::default()
    }
    .with_version(version)
}

/// Control plane of the current context, or an in-memory one
pub fn control_plane(config: &Config, dry_run: bool) -> CommandResult<SharedControlPlane> {
    if dry_run {
        return Ok(Arc::new(SimulatedControlPlane::new()));
    }
    let api = config.api_server_config()?;
    info!("Using API server {}", api.server);
    Ok(Arc::new(KubeApiClient::new(&api)?))
}

/// Plan a flow without any cluster access
pub fn plan_flow(manifest: &FlowManifest, images: ImageConfig) -> CommandResult<FlowDeployment> {
    let context = UnitContext::new(Arc::new(SimulatedControlPlane::new()), images);
    Ok(FlowDeployment::new(
        manifest,
        context,
        StartOptions::default(),
    )?)
}

/// Deploy a flow and return its routing table
pub async fn deploy_flow(
    manifest: &FlowManifest,
    control_plane: SharedControlPlane,
    images: ImageConfig,
    options: StartOptions,
) -> CommandResult<RoutingTable> {
    let context = UnitContext::new(control_plane, images);
    let mut flow = FlowDeployment::new(manifest, context, options)?;
    flow.start().await?;
    Ok(flow.routing_table())
}

/// Delete every unit of a flow
pub async fn teardown_flow(
    manifest: &FlowManifest,
    control_plane: SharedControlPlane,
    images: ImageConfig,
) -> CommandResult<TeardownReport> {
    let context = UnitContext::new(control_plane, images);
    let mut flow = FlowDeployment::new(manifest, context, StartOptions::default())?;
    Ok(flow.teardown().await)
}
