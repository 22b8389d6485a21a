//! Downstream fan-out after a release.
//!
//! Fires one `repository_dispatch` event per configured downstream repo,
//! then synchronises checksum files into clones made under a fresh temp
//! directory. Repositories the project does not own get a review issue
//! instead of a push. Nothing under the protected prefix is ever touched.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use shipwright_config::ConfigView;
use shipwright_retry::RetryConfig;
use shipwright_types::{ErrorKind, ReleaseManifest};

use crate::github::GitHubClient;
use crate::guardrails;
use crate::logger::Logger;
use crate::manifest::CHECKSUMS_FILE;
use crate::process::{self, RunSpec};

const DISPATCH_EVENT: &str = "shipwright-release";

/// Outcome of the fan-out for one downstream repository.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub repo: String,
    pub dispatched: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Dispatcher<'a> {
    config: &'a ConfigView,
    client: GitHubClient,
    logger: Logger,
    retry: RetryConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a ConfigView, client: GitHubClient, logger: &Logger) -> Self {
        Self {
            config,
            client,
            logger: logger.scoped(None, None, Some("dispatch")),
            retry: RetryConfig::dispatch(),
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Send the release event to every downstream repo (or the explicit
    /// subset). Per-repo failures are collected, not fatal.
    pub fn dispatch_release(
        &self,
        tool: &str,
        version: &str,
        git_sha: Option<&str>,
        run_id: &str,
        repos: Option<&[String]>,
    ) -> Result<Vec<DispatchOutcome>> {
        let targets: Vec<String> = match repos {
            Some(explicit) => explicit.to_vec(),
            None => self.config.global.downstream_repos.clone(),
        };
        let payload = json!({
            "tool": tool,
            "version": version,
            "git_sha": git_sha,
            "run_id": run_id,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let mut outcomes = Vec::new();
        for repo in targets {
            let mut attempts = 0;
            let outcome = loop {
                attempts += 1;
                match self
                    .client
                    .repository_dispatch(&repo, DISPATCH_EVENT, &payload)
                {
                    Ok(()) => {
                        self.logger.info(&format!("dispatched release event to {repo}"));
                        break DispatchOutcome {
                            repo: repo.clone(),
                            dispatched: true,
                            attempts,
                            error: None,
                        };
                    }
                    Err(e) => {
                        // Rate limiting already exhausted the client's own
                        // envelope; trying again here would only dig deeper.
                        let exhausted = e.downcast_ref::<ErrorKind>().is_some_and(|k| {
                            matches!(k, ErrorKind::RateLimited(_))
                        });
                        if exhausted || !self.retry.can_retry(attempts) {
                            self.logger
                                .error(&format!("dispatch to {repo} failed: {e:#}"));
                            break DispatchOutcome {
                                repo: repo.clone(),
                                dispatched: false,
                                attempts,
                                error: Some(format!("{e:#}")),
                            };
                        }
                        std::thread::sleep(self.retry.delay_for(attempts));
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Copy the manifest and `SHA256SUMS` into each downstream repo. Owned
    /// repos get a commit pushed from a fresh temp clone; external repos
    /// get a review issue instead.
    pub fn sync_checksums(
        &self,
        manifest: &ReleaseManifest,
        checksums_path: &Path,
        manifest_path: &Path,
        repos: Option<&[String]>,
    ) -> Result<()> {
        let targets: Vec<String> = match repos {
            Some(explicit) => explicit.to_vec(),
            None => self.config.global.downstream_repos.clone(),
        };

        for repo in &targets {
            if self.is_external(repo) {
                self.open_review_issue(repo, manifest)?;
                continue;
            }
            self.push_checksums(repo, manifest, checksums_path, manifest_path)?;
        }
        Ok(())
    }

    fn is_external(&self, repo: &str) -> bool {
        self.config
            .global
            .external_repos
            .iter()
            .any(|r| r == repo)
    }

    fn open_review_issue(&self, repo: &str, manifest: &ReleaseManifest) -> Result<()> {
        self.logger.info(&format!(
            "{repo} is external; opening a review issue instead of pushing"
        ));
        self.client.create_issue(
            repo,
            &format!("Update {} checksums for {}", manifest.tool, manifest.version),
            &format!(
                "A new release of {} ({}) is available; run id {}. \
                 Please update the pinned checksums.",
                manifest.tool, manifest.version, manifest.run_id
            ),
        )?;
        Ok(())
    }

    fn push_checksums(
        &self,
        repo: &str,
        manifest: &ReleaseManifest,
        checksums_path: &Path,
        manifest_path: &Path,
    ) -> Result<()> {
        let workdir = guardrails::safe_tmpdir("shipwright-dispatch")?;
        self.guard_protected(&workdir)?;
        let clone_dir = workdir.join(repo.replace('/', "-"));

        let url = format!("https://github.com/{repo}.git");
        self.git(&["clone", "--depth", "1", &url, &clone_dir.display().to_string()], None)?;

        let dest = clone_dir
            .join("checksums")
            .join(&manifest.tool)
            .join(&manifest.version);
        self.guard_protected(&dest)?;
        fs::create_dir_all(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        fs::copy(checksums_path, dest.join(CHECKSUMS_FILE))
            .with_context(|| format!("failed to copy {}", checksums_path.display()))?;
        fs::copy(manifest_path, dest.join("manifest.json"))
            .with_context(|| format!("failed to copy {}", manifest_path.display()))?;

        self.git(&["add", "."], Some(&clone_dir))?;
        self.git(
            &[
                "commit",
                "-m",
                &format!("chore: {} {} checksums", manifest.tool, manifest.version),
            ],
            Some(&clone_dir),
        )?;
        self.git(&["push", "origin", "HEAD"], Some(&clone_dir))?;
        self.logger
            .info(&format!("pushed checksum update to {repo}"));

        // The clone was only ever a vehicle for the commit.
        let _ = guardrails::SafeDelete::new(&self.config.paths).safe_rm(&workdir);
        Ok(())
    }

    /// Refuse to operate on anything under the protected prefix.
    fn guard_protected(&self, path: &Path) -> Result<()> {
        let protected = self
            .config
            .global
            .protected_prefix
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join("projects")));
        if let Some(prefix) = protected
            && path.starts_with(&prefix)
        {
            bail!(
                "refusing to touch {} (under the protected prefix {})",
                path.display(),
                prefix.display()
            );
        }
        Ok(())
    }

    fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<()> {
        let program = git_program();
        let mut spec = RunSpec::new(program.as_str(), args.iter().map(|s| s.to_string()));
        if let Some(dir) = cwd {
            spec = spec.cwd(dir);
        }
        let out = process::run(&spec.timeout(std::time::Duration::from_secs(300)))?;
        if !out.success() {
            bail!("git {:?} exited {}: {}", args.first(), out.exit_code, out.stderr.trim());
        }
        Ok(())
    }
}

fn git_program() -> String {
    std::env::var("SHIPWRIGHT_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}
