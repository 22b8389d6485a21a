//! Per-run workspace and persisted build state.
//!
//! Every orchestration owns `<state-root>/builds/<tool>/<version>/<run_id>/`
//! with `state.json`, `artifacts/`, and `logs/`. All mutations are
//! read-modify-write through a temp file and atomic rename, serialised by
//! an in-process mutex; readers therefore observe either the pre- or the
//! post-mutation file, never a torn one.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use shipwright_types::{
    BuildRun, CURRENT_STATE_VERSION, HostProgress, HostStatus, Platform, RetryAttempt, RunStatus,
};

pub const STATE_FILE: &str = "state.json";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const RUN_LOGS_DIR: &str = "logs";
pub const LATEST_LINK: &str = "latest";
pub const BUILDS_DIR: &str = "builds";

/// Default number of runs kept per (tool, version) by `cleanup`.
pub const DEFAULT_KEEP: usize = 5;

/// What `resume_plan` found in the latest run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResumePlan {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
    /// Failed hosts still inside the retry budget.
    pub retryable: Vec<String>,
    /// Failed hosts that exhausted the retry budget.
    pub exceeded: Vec<String>,
}

#[derive(Debug)]
pub struct StateStore {
    state_root: PathBuf,
    // Serialises read-modify-write cycles across orchestrator threads.
    write_guard: Mutex<()>,
}

impl StateStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            state_root: state_root.to_path_buf(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    /// Directory holding every run of one (tool, version); also where the
    /// build lock lives.
    pub fn tool_version_dir(&self, tool: &str, version: &str) -> PathBuf {
        self.state_root.join(BUILDS_DIR).join(tool).join(version)
    }

    pub fn run_dir(&self, tool: &str, version: &str, run_id: &str) -> PathBuf {
        self.tool_version_dir(tool, version).join(run_id)
    }

    pub fn artifacts_dir(&self, tool: &str, version: &str, run_id: &str) -> PathBuf {
        self.run_dir(tool, version, run_id).join(ARTIFACTS_DIR)
    }

    pub fn run_logs_dir(&self, tool: &str, version: &str, run_id: &str) -> PathBuf {
        self.run_dir(tool, version, run_id).join(RUN_LOGS_DIR)
    }

    /// Create a fresh build run: workspace directories, initial state, and
    /// the `latest` symlink. The run id is `run-<epoch>-<pid>`, suffixed on
    /// the rare collision within one second.
    pub fn create(
        &self,
        tool: &str,
        version: &str,
        plan: &[(String, Platform)],
    ) -> Result<BuildRun> {
        let _guard = self.write_guard.lock().expect("state mutex poisoned");

        let base = format!("run-{}-{}", Utc::now().timestamp(), std::process::id());
        let parent = self.tool_version_dir(tool, version);
        let mut run_id = base.clone();
        let mut n = 1;
        while parent.join(&run_id).exists() {
            run_id = format!("{base}-{n}");
            n += 1;
        }

        let run_dir = parent.join(&run_id);
        fs::create_dir_all(run_dir.join(ARTIFACTS_DIR))
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        fs::create_dir_all(run_dir.join(RUN_LOGS_DIR))
            .context("failed to create run logs dir")?;

        let mut hosts = BTreeMap::new();
        let mut targets = Vec::new();
        for (host_id, platform) in plan {
            targets.push(platform.clone());
            hosts.insert(host_id.clone(), HostProgress::pending(platform.clone()));
        }

        let run = BuildRun {
            state_version: CURRENT_STATE_VERSION.to_string(),
            run_id: run_id.clone(),
            tool: tool.to_string(),
            version: version.to_string(),
            targets,
            git_sha: None,
            git_ref: None,
            status: RunStatus::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            hosts,
            artifacts: Vec::new(),
        };
        atomic_write_json(&run_dir.join(STATE_FILE), &run)?;
        self.point_latest(tool, version, &run_id)?;
        Ok(run)
    }

    /// Load a run; `"latest"` resolves through the symlink.
    pub fn get(&self, tool: &str, version: &str, run_ref: &str) -> Result<BuildRun> {
        let run_id = self.resolve_run_ref(tool, version, run_ref)?;
        let path = self.run_dir(tool, version, &run_id).join(STATE_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let run: BuildRun = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state JSON {}", path.display()))?;
        if run.state_version != CURRENT_STATE_VERSION {
            bail!(
                "state version {} is not supported (expected {})",
                run.state_version,
                CURRENT_STATE_VERSION
            );
        }
        Ok(run)
    }

    pub fn set_status(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        status: RunStatus,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            run.status = status;
            Ok(())
        })
    }

    /// Update one host's sub-record.
    pub fn set_host(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        host: &str,
        status: HostStatus,
        artifact_path: Option<PathBuf>,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            let progress = run
                .hosts
                .get_mut(host)
                .with_context(|| format!("run has no host {host:?}"))?;
            progress.status = status;
            if artifact_path.is_some() {
                progress.artifact_path = artifact_path.clone();
            }
            if duration_ms.is_some() {
                progress.duration_ms = duration_ms;
            }
            if error.is_some() {
                progress.last_error = error.clone();
            }
            progress.last_updated_at = Utc::now();
            Ok(())
        })
    }

    /// Record a collected artifact against its host.
    pub fn add_artifact(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        host: &str,
        name: &str,
        path: &Path,
        sha256: &str,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            if !run.hosts.contains_key(host) {
                bail!("run has no host {host:?}");
            }
            run.artifacts.push(shipwright_types::StateArtifact {
                host: host.to_string(),
                name: name.to_string(),
                path: path.to_path_buf(),
                sha256: sha256.to_string(),
            });
            Ok(())
        })
    }

    pub fn set_git_info(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        sha: &str,
        git_ref: &str,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            run.git_sha = Some(sha.to_string());
            run.git_ref = Some(git_ref.to_string());
            Ok(())
        })
    }

    pub fn record_retry(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        host: &str,
        attempt: u32,
        error: &str,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            let progress = run
                .hosts
                .get_mut(host)
                .with_context(|| format!("run has no host {host:?}"))?;
            progress.attempts = attempt;
            progress.last_error = Some(error.to_string());
            progress.trail.push(RetryAttempt {
                attempt,
                error: error.to_string(),
                at: Utc::now(),
            });
            progress.last_updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn reset_retries(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        host: &str,
    ) -> Result<BuildRun> {
        self.mutate(tool, version, run_ref, |run| {
            let progress = run
                .hosts
                .get_mut(host)
                .with_context(|| format!("run has no host {host:?}"))?;
            progress.attempts = 0;
            progress.last_error = None;
            progress.last_updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn can_retry(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        host: &str,
        max_attempts: u32,
    ) -> Result<bool> {
        let run = self.get(tool, version, run_ref)?;
        let progress = run
            .hosts
            .get(host)
            .with_context(|| format!("run has no host {host:?}"))?;
        Ok(progress.attempts < max_attempts)
    }

    /// Classify the latest run's hosts for `--resume`.
    pub fn resume_plan(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        max_attempts: u32,
    ) -> Result<ResumePlan> {
        let run = self.get(tool, version, run_ref)?;
        let mut plan = ResumePlan::default();
        for (host, progress) in &run.hosts {
            match progress.status {
                HostStatus::Completed | HostStatus::Skipped => {
                    plan.completed.push(host.clone());
                }
                HostStatus::Failed => {
                    plan.failed.push(host.clone());
                    if progress.attempts < max_attempts {
                        plan.retryable.push(host.clone());
                    } else {
                        plan.exceeded.push(host.clone());
                    }
                }
                HostStatus::Pending | HostStatus::Running => {
                    plan.pending.push(host.clone());
                }
            }
        }
        Ok(plan)
    }

    /// Retention: keep the newest `keep` runs per (tool, version),
    /// regardless of status. The `latest` link survives.
    pub fn cleanup(&self, tool: &str, version: &str, keep: usize) -> Result<usize> {
        let _guard = self.write_guard.lock().expect("state mutex poisoned");
        let parent = self.tool_version_dir(tool, version);
        if !parent.is_dir() {
            return Ok(0);
        }
        let mut runs: Vec<String> = Vec::new();
        for entry in fs::read_dir(&parent)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("run-") && entry.file_type()?.is_dir() {
                runs.push(name);
            }
        }
        // run-<epoch>-<pid>: lexicographic order tracks creation order for
        // equal-width epochs; ties within a second carry a counter suffix.
        runs.sort();
        let mut removed = 0;
        if runs.len() > keep {
            for name in &runs[..runs.len() - keep] {
                fs::remove_dir_all(parent.join(name))
                    .with_context(|| format!("failed to remove old run {name}"))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn mutate(
        &self,
        tool: &str,
        version: &str,
        run_ref: &str,
        f: impl FnOnce(&mut BuildRun) -> Result<()>,
    ) -> Result<BuildRun> {
        let _guard = self.write_guard.lock().expect("state mutex poisoned");
        let run_id = self.resolve_run_ref(tool, version, run_ref)?;
        let path = self.run_dir(tool, version, &run_id).join(STATE_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let mut run: BuildRun = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state JSON {}", path.display()))?;

        // Completed and cancelled runs are frozen for audit.
        if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
            bail!(
                "run {} is {} and frozen; refusing to mutate",
                run.run_id,
                serde_json::to_string(&run.status).unwrap_or_default()
            );
        }

        f(&mut run)?;
        run.updated_at = Utc::now();
        atomic_write_json(&path, &run)?;
        Ok(run)
    }

    fn resolve_run_ref(&self, tool: &str, version: &str, run_ref: &str) -> Result<String> {
        if run_ref != LATEST_LINK {
            return Ok(run_ref.to_string());
        }
        let link = self.tool_version_dir(tool, version).join(LATEST_LINK);
        let target = fs::read_link(&link)
            .with_context(|| format!("no latest run for {tool} {version}"))?;
        Ok(target
            .file_name()
            .context("latest symlink has no file name")?
            .to_string_lossy()
            .to_string())
    }

    fn point_latest(&self, tool: &str, version: &str, run_id: &str) -> Result<()> {
        let parent = self.tool_version_dir(tool, version);
        let link = parent.join(LATEST_LINK);
        let _ = fs::remove_file(&link);
        #[cfg(unix)]
        std::os::unix::fs::symlink(parent.join(run_id), &link)
            .with_context(|| format!("failed to update latest link for {tool} {version}"))?;
        #[cfg(not(unix))]
        fs::write(&link, run_id).with_context(|| "failed to update latest marker")?;
        Ok(())
    }
}

/// Best-effort fsync of the parent directory after a rename, making the
/// directory entry durable on crash. Ignored where unsupported.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    fsync_parent_dir(path);
    Ok(())
}
