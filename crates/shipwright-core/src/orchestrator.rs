//! Top-level per-tool orchestration.
//!
//! One `orchestrate` call takes a tool and version through the whole
//! pipeline: plan targets, snapshot git, take the build lock, create the
//! run, build every target concurrently under host slot caps with a retry
//! envelope, aggregate, emit the manifest, and release the lock on every
//! exit path. Cancellation stops scheduling, lets in-flight targets finish
//! within their own timeouts, and marks the run cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use shipwright_config::ConfigView;
use shipwright_retry::RetryConfig;
use shipwright_types::{
    BuildRun, ErrorKind, HostStatus, Platform, ReleaseManifest, RunStatus, Tool,
};

use crate::gitinfo;
use crate::health::HealthChecker;
use crate::lock;
use crate::logger::{self, Logger};
use crate::manifest;
use crate::runner;
use crate::selector::HostSelector;
use crate::ssh;
use crate::state::{DEFAULT_KEEP, StateStore};
use crate::strategy::{self, BuildStrategy};
use crate::sync;

/// How long a worker waits for a host slot before giving up.
const SLOT_WAIT: Duration = Duration::from_secs(10 * 60);
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// CLI target override; config targets otherwise.
    pub explicit_targets: Option<Vec<Platform>>,
    pub dry_run: bool,
    /// Re-try only the unfinished targets of the latest run.
    pub resume: bool,
    pub sign: bool,
}

/// Per-target outcome in the final report.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub platform: Platform,
    pub host: String,
    pub status: HostStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// What one orchestration produced.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub tool: String,
    pub version: String,
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub targets: Vec<TargetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ReleaseManifest>,
    pub dry_run: bool,
}

pub struct Orchestrator<'a> {
    config: &'a ConfigView,
    store: Arc<StateStore>,
    logger: Logger,
    retry: RetryConfig,
    cancel: Arc<AtomicBool>,
}

/// One resolved target: its platform, how it builds, and the key its
/// sub-record lives under in run state. Keys are the host id, extended
/// with the platform when several targets share one host (both Darwin
/// arches on one Mac, say).
#[derive(Debug, Clone)]
struct PlannedTarget {
    platform: Platform,
    strategy: BuildStrategy,
    state_key: String,
}

fn plan_targets(resolved: Vec<(Platform, BuildStrategy)>) -> Vec<PlannedTarget> {
    let mut host_counts: std::collections::BTreeMap<String, usize> =
        std::collections::BTreeMap::new();
    for (_, strategy) in &resolved {
        *host_counts.entry(strategy.host_id().to_string()).or_default() += 1;
    }
    resolved
        .into_iter()
        .map(|(platform, strategy)| {
            let host_id = strategy.host_id().to_string();
            let state_key = if host_counts[&host_id] > 1 {
                format!("{host_id}:{platform}")
            } else {
                host_id
            };
            PlannedTarget {
                platform,
                strategy,
                state_key,
            }
        })
        .collect()
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a ConfigView, logger: Logger) -> Self {
        Self {
            config,
            store: Arc::new(StateStore::new(&config.paths.state_root)),
            logger,
            retry: RetryConfig::from_env(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag a signal handler flips to request cancellation.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    /// Run the full pipeline for (tool, version).
    pub fn orchestrate(
        &self,
        tool_id: &str,
        version: &str,
        opts: &OrchestrateOptions,
    ) -> Result<OrchestrationReport> {
        let _ = logger::rotate_logs(&self.config.paths.state_root);
        let tool = self.config.tool(tool_id)?.clone();
        let version = shipwright_types::v_prefixed(version);

        // 1. Resolve targets and their strategies up front; a bad target is
        //    invalid_args before anything is locked or written.
        let targets = self.resolve_targets(&tool, opts)?;
        let mut resolved: Vec<(Platform, BuildStrategy)> = Vec::new();
        for platform in &targets {
            resolved.push((platform.clone(), strategy::resolve(self.config, &tool, platform)?));
        }
        let plan = plan_targets(resolved);

        if opts.dry_run {
            return Ok(self.dry_run_report(&tool, &version, &plan));
        }

        // 2. Git metadata, best-effort.
        let snapshot = gitinfo::snapshot(&tool.local_path);

        // 3. The lock gates everything below; a conflict must leave no
        //    trace in the state store.
        let tool_version_dir = self.store.tool_version_dir(&tool.id, &version);
        let lock_run_id = format!("run-{}-{}", chrono::Utc::now().timestamp(), std::process::id());
        let mut build_lock = lock::acquire(&tool_version_dir, &lock_run_id)?;

        let result = self.orchestrate_locked(&tool, &version, &plan, snapshot, opts);

        // 4. The lock is released on every path out, success or not.
        if let Err(e) = build_lock.release() {
            self.logger.warn(&format!("lock release failed: {e:#}"));
        }
        result
    }

    fn orchestrate_locked(
        &self,
        tool: &Tool,
        version: &str,
        plan: &[PlannedTarget],
        snapshot: Option<gitinfo::GitSnapshot>,
        opts: &OrchestrateOptions,
    ) -> Result<OrchestrationReport> {
        let run = self.create_or_resume_run(tool, version, plan, opts)?;
        let run_id = run.run_id.clone();
        let log = self.logger.scoped(Some(&tool.id), None, None).with_run_id(&run_id);

        if let Some(snap) = &snapshot {
            self.store
                .set_git_info(&tool.id, version, &run_id, &snap.sha, &snap.git_ref)?;
        }
        self.store
            .set_status(&tool.id, version, &run_id, RunStatus::Running)?;

        // Targets already terminal from a resumed run are skipped.
        let pending: Vec<&PlannedTarget> = plan
            .iter()
            .filter(|target| {
                !run.hosts
                    .get(&target.state_key)
                    .is_some_and(|p| p.status == HostStatus::Completed)
            })
            .collect();

        let checker = HealthChecker::new(self.config, &log);
        let selector = HostSelector::new(self.config);

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for target in &pending {
                if self.cancel.load(Ordering::SeqCst) {
                    let _ = self.store.set_host(
                        &tool.id,
                        version,
                        &run_id,
                        &target.state_key,
                        HostStatus::Skipped,
                        None,
                        None,
                        Some("cancelled before start".into()),
                    );
                    continue;
                }
                let run_id = run_id.clone();
                let log = log.clone();
                let selector = &selector;
                let checker = &checker;
                handles.push(scope.spawn(move || {
                    self.build_target(tool, version, &run_id, target, selector, checker, &log)
                }));
            }
            for handle in handles {
                if let Err(e) = handle.join().expect("worker panicked") {
                    log.error(&format!("target worker failed: {e:#}"));
                }
            }
        });

        // 6. Aggregate.
        let final_run = self.store.get(&tool.id, version, &run_id)?;
        let status = aggregate_status(&final_run, self.cancel.load(Ordering::SeqCst));
        self.store.set_status(&tool.id, version, &run_id, status)?;

        // 7. Manifest for anything that succeeded, then retention.
        let manifest = if matches!(status, RunStatus::Completed | RunStatus::Partial) {
            let final_run = self.store.get(&tool.id, version, &run_id)?;
            let m = manifest::build_manifest(self.config, &log, &final_run, opts.sign)?;
            let artifacts_dir = self.store.artifacts_dir(&tool.id, version, &run_id);
            manifest::write_manifest(&m, &artifacts_dir.join(MANIFEST_FILE))?;
            manifest::write_checksums(&m, &artifacts_dir)?;
            Some(m)
        } else {
            None
        };
        if let Err(e) = self.store.cleanup(&tool.id, version, DEFAULT_KEEP) {
            log.warn(&format!("retention cleanup failed: {e:#}"));
        }

        let final_run = self.store.get(&tool.id, version, &run_id)?;
        Ok(build_report(&final_run, status, manifest, false))
    }

    /// One target worker: slot, driver, retry envelope, state updates.
    #[allow(clippy::too_many_arguments)]
    fn build_target(
        &self,
        tool: &Tool,
        version: &str,
        run_id: &str,
        target: &PlannedTarget,
        selector: &HostSelector<'_>,
        checker: &HealthChecker<'_>,
        log: &Logger,
    ) -> Result<()> {
        let host_id = target.strategy.host_id();
        let key = target.state_key.as_str();
        let platform = &target.platform;
        let host = self.config.host(host_id)?;
        let tlog = log.scoped(None, Some(host_id), None);

        if !checker.check(host)?.is_healthy() {
            self.store.set_host(
                &tool.id,
                version,
                run_id,
                key,
                HostStatus::Failed,
                None,
                None,
                Some(ErrorKind::DependencyMissing(format!("host {host_id} unhealthy")).ident().to_string()),
            )?;
            return Ok(());
        }

        // Slot names carry the state key so two targets sharing a host in
        // one run hold distinct slots.
        let slot_id = format!("{run_id}-{}", key.replace(['/', ':'], "-"));
        let _slot = selector.acquire_slot(host, &slot_id, Some(SLOT_WAIT))?;
        self.store.set_host(
            &tool.id,
            version,
            run_id,
            key,
            HostStatus::Running,
            None,
            None,
            None,
        )?;

        let artifact_dir = self.store.artifacts_dir(&tool.id, version, run_id);
        let logs_dir = self.store.run_logs_dir(&tool.id, version, run_id);

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.store.set_host(
                    &tool.id,
                    version,
                    run_id,
                    key,
                    HostStatus::Skipped,
                    None,
                    None,
                    Some("cancelled".into()),
                )?;
                return Ok(());
            }

            let outcome = self.run_driver(
                tool,
                version,
                run_id,
                platform,
                &target.strategy,
                &artifact_dir,
                &logs_dir,
                &tlog,
            );

            match outcome {
                Ok((artifact, duration_ms)) => {
                    if let Some(path) = &artifact {
                        let sha = manifest::sha256_file(path).unwrap_or_default();
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        self.store
                            .add_artifact(&tool.id, version, run_id, key, &name, path, &sha)?;
                    }
                    self.store.set_host(
                        &tool.id,
                        version,
                        run_id,
                        key,
                        HostStatus::Completed,
                        artifact,
                        Some(duration_ms),
                        None,
                    )?;
                    return Ok(());
                }
                Err(kind) => {
                    let run = self.store.get(&tool.id, version, run_id)?;
                    let attempts = run.hosts.get(key).map(|p| p.attempts).unwrap_or(0) + 1;
                    self.store.record_retry(
                        &tool.id,
                        version,
                        run_id,
                        key,
                        attempts,
                        &kind.to_string(),
                    )?;

                    let may_retry = kind.retryable()
                        && self
                            .store
                            .can_retry(&tool.id, version, run_id, key, self.retry.max_attempts)?
                        && !self.cancel.load(Ordering::SeqCst);
                    if may_retry {
                        let delay = self.retry.delay_for(attempts);
                        tlog.warn(&format!(
                            "attempt {attempts} failed ({}); retrying in {}",
                            kind.ident(),
                            humantime::format_duration(delay)
                        ));
                        std::thread::sleep(delay);
                        continue;
                    }

                    self.store.set_host(
                        &tool.id,
                        version,
                        run_id,
                        key,
                        HostStatus::Failed,
                        None,
                        None,
                        Some(kind.ident().to_string()),
                    )?;
                    return Ok(());
                }
            }
        }
    }

    /// Invoke the right driver once; Ok carries (artifact, duration).
    #[allow(clippy::too_many_arguments)]
    fn run_driver(
        &self,
        tool: &Tool,
        version: &str,
        run_id: &str,
        platform: &Platform,
        strat: &BuildStrategy,
        artifact_dir: &std::path::Path,
        logs_dir: &std::path::Path,
        log: &Logger,
    ) -> std::result::Result<(Option<PathBuf>, u64), ErrorKind> {
        match strat {
            BuildStrategy::Runner { workflow, job, .. } => {
                let result = runner::run_workflow(
                    self.config,
                    log,
                    run_id,
                    &tool.local_path,
                    workflow,
                    Some(job),
                    "push",
                    Some(version),
                    artifact_dir,
                    logs_dir,
                    &[],
                )
                .map_err(|e| to_kind(e, "runner driver"))?;
                if let Some(kind) = result.error_kind() {
                    return Err(kind);
                }
                let artifact = self
                    .pick_runner_artifact(tool, platform, version, &result)
                    .ok_or_else(|| {
                        ErrorKind::ArtifactFailure(format!(
                            "workflow {workflow} produced no artifacts"
                        ))
                    })?;
                Ok((Some(artifact), result.duration_seconds * 1000))
            }
            BuildStrategy::Native { host_id } => {
                // Remote work trees are brought to a clean checkout of the
                // version, then topped up with the local tree's deltas.
                let host = self
                    .config
                    .host(host_id)
                    .map_err(|e| to_kind(e, "native host"))?;
                if let shipwright_types::Transport::Ssh { .. } = &host.transport {
                    let remote_path = self.config.remote_path(tool, host);
                    let repo_url = format!("https://github.com/{}.git", tool.repo);
                    sync::ensure_repo_ready(host, log, &remote_path, &repo_url, version)
                        .map_err(|e| to_kind(e, "repo prepare"))?;
                    sync::sync(
                        host,
                        log,
                        &tool.local_path,
                        &remote_path,
                        &[],
                        self.config.global.timeouts.sync,
                    )
                    .map_err(|e| to_kind(e, "source sync"))?;
                }
                let result = ssh::run_native(
                    self.config,
                    log,
                    tool,
                    platform,
                    version,
                    run_id,
                    artifact_dir,
                )
                .map_err(|e| to_kind(e, "native driver"))?;
                if let Some(kind) = result.error_kind() {
                    return Err(kind);
                }
                Ok((result.artifact_path, result.duration_seconds * 1000))
            }
        }
    }

    /// Choose the primary artifact among the files the runner collected:
    /// the workflow-reported name first, then the expected versioned name,
    /// then the first file.
    fn pick_runner_artifact(
        &self,
        tool: &Tool,
        platform: &Platform,
        version: &str,
        result: &runner::RunnerResult,
    ) -> Option<PathBuf> {
        let files = runner::collect_artifacts(&result.artifact_dir).ok()?;
        if files.is_empty() {
            return None;
        }
        if let Some(reported) = &result.reported_artifact
            && let Some(found) = files.iter().find(|f| {
                f.file_name().is_some_and(|n| n.to_string_lossy() == *reported)
            })
        {
            return Some(found.clone());
        }
        if let Ok(expected) = crate::naming::versioned_name(self.config, tool, platform, version)
            && let Some(found) = files.iter().find(|f| {
                f.file_name().is_some_and(|n| n.to_string_lossy() == expected)
            })
        {
            return Some(found.clone());
        }
        files.first().cloned()
    }

    fn resolve_targets(&self, tool: &Tool, opts: &OrchestrateOptions) -> Result<Vec<Platform>> {
        let targets = match &opts.explicit_targets {
            Some(explicit) if !explicit.is_empty() => {
                for t in explicit {
                    if !tool.targets.contains(t) {
                        return Err(anyhow::Error::new(ErrorKind::InvalidArgs(format!(
                            "target {t} is not configured for tool {}",
                            tool.id
                        ))));
                    }
                }
                explicit.clone()
            }
            _ => tool.targets.clone(),
        };
        if targets.is_empty() {
            return Err(anyhow::Error::new(ErrorKind::InvalidArgs(format!(
                "tool {} has no targets",
                tool.id
            ))));
        }
        Ok(targets)
    }

    fn create_or_resume_run(
        &self,
        tool: &Tool,
        version: &str,
        plan: &[PlannedTarget],
        opts: &OrchestrateOptions,
    ) -> Result<BuildRun> {
        if opts.resume
            && let Ok(latest) = self.store.get(&tool.id, version, "latest")
        {
            if matches!(latest.status, RunStatus::Completed | RunStatus::Cancelled) {
                bail!(
                    "latest run {} is {:?}; nothing to resume",
                    latest.run_id,
                    latest.status
                );
            }
            // Give failed hosts a fresh retry budget; completed hosts keep
            // their artifacts.
            let resume = self.store.resume_plan(
                &tool.id,
                version,
                &latest.run_id,
                self.retry.max_attempts,
            )?;
            for host in resume.failed.iter().chain(resume.pending.iter()) {
                self.store.reset_retries(&tool.id, version, &latest.run_id, host)?;
            }
            self.logger.info(&format!(
                "resuming run {} ({} done, {} to retry)",
                latest.run_id,
                resume.completed.len(),
                resume.failed.len() + resume.pending.len()
            ));
            return self.store.get(&tool.id, version, &latest.run_id);
        }

        let assignment: Vec<(String, Platform)> = plan
            .iter()
            .map(|target| (target.state_key.clone(), target.platform.clone()))
            .collect();
        self.store.create(&tool.id, version, &assignment)
    }

    fn dry_run_report(
        &self,
        tool: &Tool,
        version: &str,
        plan: &[PlannedTarget],
    ) -> OrchestrationReport {
        let targets = plan
            .iter()
            .map(|target| TargetReport {
                platform: target.platform.clone(),
                host: target.strategy.host_id().to_string(),
                status: HostStatus::Pending,
                attempts: 0,
                error: None,
                artifact: None,
                duration_ms: None,
            })
            .collect();
        OrchestrationReport {
            tool: tool.id.clone(),
            version: version.to_string(),
            run_id: String::new(),
            status: RunStatus::Created,
            exit_code: 0,
            targets,
            manifest: None,
            dry_run: true,
        }
    }
}

/// Load the persisted manifest of a run, falling back to rebuilding it
/// from state.
pub fn load_manifest(
    config: &ConfigView,
    logger: &Logger,
    tool: &str,
    version: &str,
    run_ref: &str,
) -> Result<ReleaseManifest> {
    let store = StateStore::new(&config.paths.state_root);
    let run = store.get(tool, version, run_ref)?;
    let path = store
        .artifacts_dir(tool, version, &run.run_id)
        .join(MANIFEST_FILE);
    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()));
    }
    manifest::build_manifest(config, logger, &run, false)
}

fn aggregate_status(run: &BuildRun, cancelled: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    let total = run.hosts.len();
    let completed = run
        .hosts
        .values()
        .filter(|p| p.status == HostStatus::Completed)
        .count();
    if completed == total {
        RunStatus::Completed
    } else if completed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

fn build_report(
    run: &BuildRun,
    status: RunStatus,
    manifest: Option<ReleaseManifest>,
    dry_run: bool,
) -> OrchestrationReport {
    let targets: Vec<TargetReport> = run
        .hosts
        .iter()
        .map(|(host, progress)| TargetReport {
            platform: progress.platform.clone(),
            host: host.clone(),
            status: progress.status,
            attempts: progress.attempts,
            error: progress.last_error.clone(),
            artifact: progress.artifact_path.clone(),
            duration_ms: progress.duration_ms,
        })
        .collect();

    let exit_code = match status {
        RunStatus::Completed => 0,
        RunStatus::Partial => 1,
        RunStatus::Cancelled => 1,
        RunStatus::Failed => {
            let kinds: std::collections::BTreeSet<&str> = run
                .hosts
                .values()
                .filter_map(|p| p.last_error.as_deref())
                .collect();
            match kinds.iter().next() {
                Some(&ident) if kinds.len() == 1 => exit_code_for_ident(ident),
                _ => 1,
            }
        }
        RunStatus::Created | RunStatus::Running => 1,
    };

    OrchestrationReport {
        tool: run.tool.clone(),
        version: run.version.clone(),
        run_id: run.run_id.clone(),
        status,
        exit_code,
        targets,
        manifest,
        dry_run,
    }
}

fn exit_code_for_ident(ident: &str) -> i32 {
    match ident {
        "invalid_args" => 4,
        "lock_conflict" => 2,
        "dependency_missing" => 3,
        "timeout" => 5,
        "build_failure" => 6,
        "artifact_failure" => 7,
        "rate_limited" => 8,
        _ => 1,
    }
}

/// Flatten an anyhow error from a driver into an ErrorKind, preserving a
/// typed kind when one is in the chain.
fn to_kind(e: anyhow::Error, context: &str) -> ErrorKind {
    match e.downcast::<ErrorKind>() {
        Ok(kind) => kind,
        Err(e) => ErrorKind::Internal(format!("{context}: {e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use serial_test::serial;
    use tempfile::tempdir;

    use shipwright_config::{GlobalConfig, Paths};
    use shipwright_types::{ArchiveFormats, Host, NamingOverrides, Transport};

    use crate::logger::LogLevel;

    use super::*;

    fn executable(path: &Path, script: &str) {
        fs::write(path, script).expect("write script");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    /// Fake emulator: drops an artifact into --artifact-server-path.
    fn fake_runner_ok(dir: &Path, artifact_name: &str) -> PathBuf {
        let bin = dir.join("fake-act");
        executable(
            &bin,
            &format!(
                r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo fake-act 1.0.0; exit 0; fi
prev=""
for a in "$@"; do
  if [ "$prev" = "--artifact-server-path" ]; then out="$a"; fi
  prev="$a"
done
mkdir -p "$out"
echo binary > "$out/{artifact_name}"
echo 'emulator chatter'
echo '{{"artifact": "{artifact_name}"}}'
exit 0
"#
            ),
        );
        bin
    }

    fn fake_docker(dir: &Path) -> PathBuf {
        let bin = dir.join("fake-docker");
        executable(&bin, "#!/bin/sh\necho ok\n");
        bin
    }

    /// Fake ssh covering every remote fragment the engine issues: health
    /// probes, the rsync probe, the repo classifier, git recovery, and
    /// finally the build command, whose behaviour the caller chooses.
    fn probe_ssh_script(build_behaviour: &str) -> String {
        format!(
            concat!(
                "#!/bin/sh\n",
                "case \"$*\" in\n",
                "  *'echo ok'*) echo ok;;\n",
                "  *'df -P'*) printf 'h\\n/dev/root 100 50 100000000 50%% /\\n';;\n",
                "  *'date +%s'*) date +%s;;\n",
                "  *'--version'*|*' version'*) echo fake;;\n",
                "  *'command -v rsync'*) echo no;;\n",
                "  *'echo missing'*) echo clean;;\n",
                "  *'git fetch'*|*'git checkout'*|*'git clone'*|*'git stash'*) exit 0;;\n",
                "  *'tar -xzf'*) cat > /dev/null;;\n",
                "  *'cargo build --release'*) {build};;\n",
                "  *) exit 0;;\n",
                "esac\n",
            ),
            build = build_behaviour,
        )
    }

    fn demo_tool(root: &Path, targets: &[&str], runner_targets: &[&str]) -> Tool {
        let mut runner_job_map = BTreeMap::new();
        for t in targets {
            if runner_targets.contains(t) {
                runner_job_map.insert(t.to_string(), Some("build".to_string()));
            } else {
                runner_job_map.insert(t.to_string(), None);
            }
        }
        Tool {
            id: "demo".into(),
            repo: "doodlestein/demo".into(),
            local_path: root.join("src"),
            language: "rust".into(),
            build_cmd: "cargo build --release".into(),
            binary_name: "demo".into(),
            archive_format: ArchiveFormats::default(),
            targets: targets.iter().map(|t| t.parse().unwrap()).collect(),
            workflow: Some("wf.yml".into()),
            runner_job_map,
            host_paths: BTreeMap::new(),
            artifact_naming: NamingOverrides::default(),
            install_script_path: None,
            cross_compile: BTreeMap::new(),
            checks: vec![],
            minisign_pubkey: None,
            target_triples: BTreeMap::new(),
            arch_aliases: BTreeMap::new(),
        }
    }

    fn fixture(
        root: &Path,
        targets: &[&str],
        runner_targets: &[&str],
        runner_bin: Option<String>,
    ) -> ConfigView {
        fs::create_dir_all(root.join("src")).expect("mkdir src");
        let paths = Paths {
            state_root: root.join("state"),
            cache_root: root.join("cache"),
            config_root: root.join("config"),
        };
        let hosts = vec![
            Host {
                id: "trj".into(),
                platform: "linux/amd64".parse().unwrap(),
                transport: Transport::Local,
                capabilities: BTreeSet::from(["rust".to_string(), "runner".to_string()]),
                concurrency: 2,
                description: None,
            },
            Host {
                id: "mmini".into(),
                platform: "darwin/arm64".parse().unwrap(),
                transport: Transport::Ssh {
                    alias: "mmini".into(),
                },
                capabilities: BTreeSet::from(["rust".to_string()]),
                concurrency: 1,
                description: None,
            },
        ];
        let global = GlobalConfig {
            runner_bin,
            ..GlobalConfig::default()
        };
        ConfigView::from_parts(
            paths,
            global,
            vec![demo_tool(root, targets, runner_targets)],
            hosts,
            BTreeMap::new(),
        )
        .expect("config")
    }

    fn quiet() -> Logger {
        Logger::stderr_only(LogLevel::Error)
    }

    #[test]
    #[serial]
    fn single_linux_target_all_green() {
        let td = tempdir().expect("tempdir");
        let runner = fake_runner_ok(td.path(), "demo-1.0.0-linux-x86_64.tar.gz");
        let docker = fake_docker(td.path());
        let config = fixture(
            td.path(),
            &["linux/amd64"],
            &["linux/amd64"],
            Some(runner.display().to_string()),
        );

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("SHIPWRIGHT_SSH_BIN", Some("false")),
                ("RETRY_DELAY", Some("0")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("orchestrate");

                assert_eq!(report.status, RunStatus::Completed);
                assert_eq!(report.exit_code, 0);
                assert_eq!(report.targets.len(), 1);
                assert_eq!(report.targets[0].status, HostStatus::Completed);
                assert_eq!(report.targets[0].host, "trj");

                let manifest = report.manifest.expect("manifest");
                assert_eq!(manifest.artifacts.len(), 1);
                assert_eq!(manifest.artifacts[0].name, "demo-1.0.0-linux-x86_64.tar.gz");
                assert!(manifest.artifacts[0].size_bytes > 0);

                // State on disk agrees.
                let run = orch
                    .state_store()
                    .get("demo", "v1.0.0", "latest")
                    .expect("state");
                assert_eq!(run.status, RunStatus::Completed);
                assert_eq!(run.hosts["trj"].status, HostStatus::Completed);
            },
        );
    }

    #[test]
    #[serial]
    fn native_scp_failure_exits_seven() {
        let td = tempdir().expect("tempdir");
        let ssh_ok = td.path().join("fake-ssh");
        executable(&ssh_ok, &probe_ssh_script("exit 0"));
        let scp_fail = td.path().join("fake-scp");
        executable(&scp_fail, "#!/bin/sh\nexit 1\n");
        let config = fixture(td.path(), &["darwin/arm64"], &[], None);

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_SSH_BIN", Some(ssh_ok.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_BIN", Some(scp_fail.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
                ("RETRY_DELAY", Some("0")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("orchestrate");

                assert_eq!(report.status, RunStatus::Failed);
                assert_eq!(report.exit_code, 7);
                assert_eq!(report.targets[0].status, HostStatus::Failed);
                assert_eq!(report.targets[0].error.as_deref(), Some("artifact_failure"));
                assert!(report.manifest.is_none());
            },
        );
    }

    #[test]
    #[serial]
    fn lock_conflict_exits_two_without_state() {
        let td = tempdir().expect("tempdir");
        let config = fixture(td.path(), &["linux/amd64"], &["linux/amd64"], None);
        let store = StateStore::new(&config.paths.state_root);

        // Another live process holds the lock.
        let dir = store.tool_version_dir("demo", "v1.0.0");
        let _held = lock::acquire(&dir, "run-other").expect("hold lock");

        let orch = Orchestrator::new(&config, quiet());
        let err = orch
            .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
            .unwrap_err();
        let kind = err.downcast_ref::<ErrorKind>().expect("typed");
        assert!(matches!(kind, ErrorKind::LockConflict { .. }));
        assert_eq!(kind.exit_code(), 2);

        // No run was created.
        assert!(store.get("demo", "v1.0.0", "latest").is_err());
    }

    #[test]
    #[serial]
    fn stale_dead_lock_is_reclaimed_and_run_proceeds() {
        let td = tempdir().expect("tempdir");
        let runner = fake_runner_ok(td.path(), "demo.tar.gz");
        let docker = fake_docker(td.path());
        let config = fixture(
            td.path(),
            &["linux/amd64"],
            &["linux/amd64"],
            Some(runner.display().to_string()),
        );
        let store = StateStore::new(&config.paths.state_root);

        // A dead-PID lock aged two hours.
        let dir = store.tool_version_dir("demo", "v1.0.0");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join(".lock"),
            format!("{} {} run-dead\n", u32::MAX - 7, chrono::Utc::now().timestamp() - 7200),
        )
        .expect("plant stale lock");

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("RETRY_DELAY", Some("0")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("orchestrate despite stale lock");
                assert_eq!(report.exit_code, 0);
            },
        );
    }

    #[test]
    #[serial]
    fn mixed_outcome_is_partial_exit_one() {
        let td = tempdir().expect("tempdir");
        let runner = fake_runner_ok(td.path(), "demo-linux.tar.gz");
        let docker = fake_docker(td.path());
        // ssh reachability works, but the build command exits 2.
        let ssh = td.path().join("fake-ssh");
        executable(&ssh, &probe_ssh_script("exit 2"));
        let config = fixture(
            td.path(),
            &["linux/amd64", "darwin/arm64"],
            &["linux/amd64"],
            Some(runner.display().to_string()),
        );

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("SHIPWRIGHT_SSH_BIN", Some(ssh.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
                ("RETRY_DELAY", Some("0")),
                ("RETRY_MAX", Some("2")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("orchestrate");

                assert_eq!(report.status, RunStatus::Partial);
                assert_eq!(report.exit_code, 1);
                let manifest = report.manifest.expect("partial manifest");
                assert_eq!(manifest.artifacts.len(), 1, "only the linux artifact");

                // Retry budget respected on the failed host.
                let run = orch
                    .state_store()
                    .get("demo", "v1.0.0", "latest")
                    .expect("state");
                assert_eq!(run.hosts["mmini"].attempts, 2);
                assert_eq!(run.hosts["mmini"].status, HostStatus::Failed);
                assert_eq!(run.hosts["mmini"].trail.len(), 2);
            },
        );
    }

    #[test]
    #[serial]
    fn resume_retries_only_the_failed_target() {
        let td = tempdir().expect("tempdir");
        let runner = fake_runner_ok(td.path(), "demo-linux.tar.gz");
        let docker = fake_docker(td.path());
        let ssh_fail = td.path().join("fake-ssh-fail");
        executable(&ssh_fail, &probe_ssh_script("exit 2"));
        let ssh_ok = td.path().join("fake-ssh-ok");
        executable(&ssh_ok, &probe_ssh_script("exit 0"));
        let scp_ok = td.path().join("fake-scp");
        executable(
            &scp_ok,
            "#!/bin/sh\nfor dest in \"$@\"; do :; done\necho binary > \"$dest\"\n",
        );
        let config = fixture(
            td.path(),
            &["linux/amd64", "darwin/arm64"],
            &["linux/amd64"],
            Some(runner.display().to_string()),
        );

        // First run: darwin fails, linux succeeds.
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("SHIPWRIGHT_SSH_BIN", Some(ssh_fail.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_BIN", Some(scp_ok.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
                ("RETRY_DELAY", Some("0")),
                ("RETRY_MAX", Some("2")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("first run");
                assert_eq!(report.status, RunStatus::Partial);
            },
        );
        let first_run_id = StateStore::new(&config.paths.state_root)
            .get("demo", "v1.0.0", "latest")
            .expect("state")
            .run_id
            .clone();

        // Resume: the health cache still says mmini is healthy; now the
        // build succeeds and the run completes on the SAME run id.
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("SHIPWRIGHT_SSH_BIN", Some(ssh_ok.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_BIN", Some(scp_ok.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
                ("RETRY_DELAY", Some("0")),
                ("RETRY_MAX", Some("2")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                let report = orch
                    .orchestrate(
                        "demo",
                        "1.0.0",
                        &OrchestrateOptions {
                            resume: true,
                            ..OrchestrateOptions::default()
                        },
                    )
                    .expect("resume");

                assert_eq!(report.run_id, first_run_id);
                assert_eq!(report.status, RunStatus::Completed);
                assert_eq!(report.exit_code, 0);
                let manifest = report.manifest.expect("manifest");
                assert_eq!(manifest.artifacts.len(), 2);
            },
        );
    }

    #[test]
    #[serial]
    fn dry_run_plans_without_locking_or_state() {
        let td = tempdir().expect("tempdir");
        let config = fixture(td.path(), &["linux/amd64"], &["linux/amd64"], None);

        let orch = Orchestrator::new(&config, quiet());
        let report = orch
            .orchestrate(
                "demo",
                "1.0.0",
                &OrchestrateOptions {
                    dry_run: true,
                    ..OrchestrateOptions::default()
                },
            )
            .expect("dry run");

        assert!(report.dry_run);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.targets[0].host, "trj");
        let store = StateStore::new(&config.paths.state_root);
        assert!(store.get("demo", "v1.0.0", "latest").is_err());
        assert!(!store.tool_version_dir("demo", "v1.0.0").join(".lock").exists());
    }

    #[test]
    fn unknown_explicit_target_is_invalid_args() {
        let td = tempdir().expect("tempdir");
        let config = fixture(td.path(), &["linux/amd64"], &["linux/amd64"], None);

        let orch = Orchestrator::new(&config, quiet());
        let err = orch
            .orchestrate(
                "demo",
                "1.0.0",
                &OrchestrateOptions {
                    explicit_targets: Some(vec!["windows/amd64".parse().unwrap()]),
                    ..OrchestrateOptions::default()
                },
            )
            .unwrap_err();
        let kind = err.downcast_ref::<ErrorKind>().expect("typed");
        assert!(matches!(kind, ErrorKind::InvalidArgs(_)));
        assert_eq!(kind.exit_code(), 4);
    }

    #[test]
    #[serial]
    fn cancellation_marks_run_cancelled() {
        let td = tempdir().expect("tempdir");
        let runner = fake_runner_ok(td.path(), "demo.tar.gz");
        let docker = fake_docker(td.path());
        let config = fixture(
            td.path(),
            &["linux/amd64"],
            &["linux/amd64"],
            Some(runner.display().to_string()),
        );

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_DOCKER_BIN", Some(docker.to_str().unwrap())),
                ("RETRY_DELAY", Some("0")),
            ],
            || {
                let orch = Orchestrator::new(&config, quiet());
                // Cancel before work is scheduled.
                orch.cancel_flag().store(true, Ordering::SeqCst);
                let report = orch
                    .orchestrate("demo", "1.0.0", &OrchestrateOptions::default())
                    .expect("orchestrate");

                assert_eq!(report.status, RunStatus::Cancelled);
                assert_eq!(report.targets[0].status, HostStatus::Skipped);

                // The lock is gone; a fresh orchestration can start.
                let store = StateStore::new(&config.paths.state_root);
                assert!(!store.tool_version_dir("demo", "v1.0.0").join(".lock").exists());
            },
        );
    }
}
