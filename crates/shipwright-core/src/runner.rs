//! Container-runner driver.
//!
//! Drives the local GitHub-Actions-compatible runner emulator for Linux
//! jobs. Pre-flight refuses to run when the emulator binary or the Docker
//! daemon is missing, and (fatally, not as a warning) when the user's
//! runner config bind-mounts the workspace without a UID/GID override,
//! which would litter the tree with root-owned files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shipwright_config::ConfigView;
use shipwright_types::ErrorKind;

use crate::logger::Logger;
use crate::process::{self, RunSpec, TIMEOUT_EXIT_CODE};

const DEFAULT_RUNNER_BIN: &str = "act";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Success,
    Timeout,
    Failed,
}

/// Structured result of one workflow invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerResult {
    pub run_id: String,
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub status: RunnerStatus,
    pub exit_code: i32,
    pub duration_seconds: u64,
    pub artifact_dir: PathBuf,
    pub artifact_count: usize,
    pub log_file: PathBuf,
    /// Artifact name the workflow reported in a trailing JSON block, when
    /// it printed one amid the log output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_artifact: Option<String>,
}

impl RunnerResult {
    /// The error kind this result maps to, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            RunnerStatus::Success => None,
            RunnerStatus::Timeout => Some(ErrorKind::Timeout(format!(
                "workflow {} timed out",
                self.workflow
            ))),
            RunnerStatus::Failed => Some(ErrorKind::BuildFailure(format!(
                "workflow {} exited {}",
                self.workflow, self.exit_code
            ))),
        }
    }
}

/// Classification of a workflow's jobs by their `runs-on` label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowAnalysis {
    pub linux_jobs: Vec<String>,
    pub macos_jobs: Vec<String>,
    pub windows_jobs: Vec<String>,
    pub other_jobs: Vec<String>,
    pub act_compatible_count: usize,
    pub native_required_count: usize,
}

/// Verify the emulator binary, the Docker daemon, and the bind-mount
/// footgun before any workflow runs.
pub fn preflight(config: &ConfigView) -> Result<()> {
    let bin = runner_bin(config);
    which::which(&bin).map_err(|_| {
        anyhow::Error::new(ErrorKind::DependencyMissing(format!(
            "runner emulator {bin:?} not found on PATH"
        )))
    })?;

    let docker = docker_bin();
    let spec = RunSpec::new(docker.as_str(), ["info", "--format", "ok"])
        .timeout(Duration::from_secs(30));
    let daemon_ok = process::run(&spec).map(|o| o.success()).unwrap_or(false);
    if !daemon_ok {
        return Err(anyhow::Error::new(ErrorKind::DependencyMissing(
            "docker daemon is not responding".into(),
        )));
    }

    check_runner_config(config)
}

/// The fatal bind-mount check, separable for testing.
fn check_runner_config(config: &ConfigView) -> Result<()> {
    let Some(path) = &config.global.runner_config else {
        return Ok(());
    };
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(());
    };
    let binds = content.lines().any(|l| l.trim_start().starts_with("--bind"));
    let has_user_override = content.contains("--user");
    if binds && !has_user_override {
        return Err(anyhow::Error::new(ErrorKind::InvalidArgs(format!(
            "runner config {} enables --bind without a --user UID/GID override; \
             builds would produce root-owned files in the workspace",
            path.display()
        ))));
    }
    Ok(())
}

/// Invoke the emulator for one workflow (optionally one job). When
/// `version` is set, environment bindings simulating a tag-push event are
/// injected so release workflows see the right ref.
#[allow(clippy::too_many_arguments)]
pub fn run_workflow(
    config: &ConfigView,
    logger: &Logger,
    run_id: &str,
    repo_path: &Path,
    workflow: &str,
    job: Option<&str>,
    event: &str,
    version: Option<&str>,
    artifact_dir: &Path,
    log_dir: &Path,
    extra_flags: &[String],
) -> Result<RunnerResult> {
    preflight(config)?;
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let log_file = log_dir.join(format!("runner-{run_id}.log"));

    let mut args: Vec<String> = vec![
        event.to_string(),
        "-W".into(),
        workflow.to_string(),
        "--artifact-server-path".into(),
        artifact_dir.display().to_string(),
    ];
    if let Some(job) = job {
        args.extend(["-j".to_string(), job.to_string()]);
    }
    if let Some(version) = version {
        let tag = shipwright_types::v_prefixed(version);
        for (key, value) in [
            ("GITHUB_REF", format!("refs/tags/{tag}")),
            ("GITHUB_REF_NAME", tag.clone()),
            ("GITHUB_REF_TYPE", "tag".to_string()),
        ] {
            args.extend(["--env".to_string(), format!("{key}={value}")]);
        }
    }
    args.extend(extra_flags.iter().cloned());

    let bin = runner_bin(config);
    let log = logger.scoped(None, None, Some("runner"));
    log.info(&format!("running {workflow} job {job:?} via {bin}"));

    let spec = RunSpec::new(bin.as_str(), args)
        .cwd(repo_path)
        .timeout(config.global.timeouts.build);
    let out = process::run(&spec)?;

    // The emulator's own exit code decides the outcome; the log copy below
    // is bookkeeping and must not mask it.
    if let Err(e) = fs::write(&log_file, format!("{}\n{}", out.stdout, out.stderr)) {
        log.warn(&format!("failed to write runner log: {e}"));
    }

    let status = match out.exit_code {
        0 => RunnerStatus::Success,
        TIMEOUT_EXIT_CODE => RunnerStatus::Timeout,
        _ => RunnerStatus::Failed,
    };

    // Workflows may print a structured trailer; fish the last well-formed
    // JSON object out of the interleaved log stream.
    let reported_artifact = process::extract_last_json(&out.stdout)
        .and_then(|v| v.get("artifact").and_then(|a| a.as_str()).map(str::to_string));

    Ok(RunnerResult {
        run_id: run_id.to_string(),
        workflow: workflow.to_string(),
        job: job.map(str::to_string),
        status,
        exit_code: out.exit_code,
        duration_seconds: out.duration.as_secs(),
        artifact_dir: artifact_dir.to_path_buf(),
        artifact_count: count_files(artifact_dir),
        log_file,
        reported_artifact,
    })
}

/// Collect the files the runner's artifact server wrote.
pub fn collect_artifacts(artifact_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![artifact_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn count_files(dir: &Path) -> usize {
    collect_artifacts(dir).map(|v| v.len()).unwrap_or(0)
}

/// Classify a workflow's jobs by `runs-on`. Only the `jobs:` / `runs-on:`
/// shape is needed, so this is a line scan rather than a YAML dependency.
pub fn analyze_workflow(path: &Path) -> Result<WorkflowAnalysis> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;

    let mut analysis = WorkflowAnalysis::default();
    let mut in_jobs = false;
    let mut current_job: Option<String> = None;

    for line in content.lines() {
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if indent == 0 {
            in_jobs = trimmed == "jobs:";
            current_job = None;
            continue;
        }
        if !in_jobs {
            continue;
        }
        if indent == 2 && trimmed.ends_with(':') && !trimmed.contains(' ') {
            current_job = Some(trimmed.trim_end_matches(':').to_string());
            continue;
        }
        if let Some(job) = &current_job
            && let Some(value) = trimmed.strip_prefix("runs-on:")
        {
            let label = value.trim().to_ascii_lowercase();
            if label.contains("ubuntu") || label.contains("linux") {
                analysis.linux_jobs.push(job.clone());
            } else if label.contains("macos") {
                analysis.macos_jobs.push(job.clone());
            } else if label.contains("windows") {
                analysis.windows_jobs.push(job.clone());
            } else {
                analysis.other_jobs.push(job.clone());
            }
        }
    }

    analysis.act_compatible_count = analysis.linux_jobs.len();
    analysis.native_required_count = analysis.macos_jobs.len() + analysis.windows_jobs.len();
    Ok(analysis)
}

fn runner_bin(config: &ConfigView) -> String {
    config
        .global
        .runner_bin
        .clone()
        .unwrap_or_else(|| DEFAULT_RUNNER_BIN.to_string())
}

fn docker_bin() -> String {
    std::env::var("SHIPWRIGHT_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string())
}
