//! Build strategy resolution.
//!
//! For each (tool, platform) pair: a non-null entry in the tool's runner
//! job map sends the build through the local container runner; anything
//! else builds natively on the host the platform maps to.

use anyhow::{Context, Result};

use shipwright_config::ConfigView;
use shipwright_types::{ErrorKind, Platform, Tool, Transport};

/// How one target gets built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStrategy {
    /// Run a workflow job in the local container-runner emulator.
    Runner {
        host_id: String,
        workflow: String,
        job: String,
    },
    /// Execute the tool's build command on a native host over SSH (or
    /// locally when the mapped host is the controller).
    Native { host_id: String },
}

impl BuildStrategy {
    pub fn host_id(&self) -> &str {
        match self {
            BuildStrategy::Runner { host_id, .. } => host_id,
            BuildStrategy::Native { host_id } => host_id,
        }
    }
}

/// Decide the strategy for one target.
pub fn resolve(config: &ConfigView, tool: &Tool, platform: &Platform) -> Result<BuildStrategy> {
    if let Some(job) = tool.runner_job(platform) {
        let workflow = tool
            .workflow
            .clone()
            .with_context(|| format!("tool {} routes {platform} to the runner but has no workflow", tool.id))?;
        let host_id = runner_host(config)?;
        return Ok(BuildStrategy::Runner {
            host_id,
            workflow,
            job: job.to_string(),
        });
    }
    let host = config
        .platform_to_host(platform)
        .with_context(|| format!("tool {}: no native host for {platform}", tool.id))?;
    Ok(BuildStrategy::Native {
        host_id: host.id.clone(),
    })
}

/// The host whose slots container-runner builds occupy: a local host
/// declaring the `runner` capability.
fn runner_host(config: &ConfigView) -> Result<String> {
    config
        .hosts()
        .find(|h| h.transport == Transport::Local && h.has_capability("runner"))
        .map(|h| h.id.clone())
        .ok_or_else(|| {
            anyhow::Error::new(ErrorKind::DependencyMissing(
                "no local host declares the runner capability".into(),
            ))
        })
}
