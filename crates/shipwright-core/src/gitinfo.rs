//! Best-effort git metadata snapshots.
//!
//! The orchestrator records the SHA and ref of the tool's local source
//! tree at plan time. A tree that is not a git repository yields `None`
//! rather than an error; releases of unversioned trees are legal.

use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSnapshot {
    pub sha: String,
    /// Symbolic ref when available (`refs/tags/v1.2.3`, `refs/heads/main`),
    /// otherwise the short SHA.
    pub git_ref: String,
}

/// Snapshot `HEAD` of the repository at `tree`.
pub fn snapshot(tree: &Path) -> Option<GitSnapshot> {
    let sha = git_stdout(tree, &["rev-parse", "HEAD"])?;

    let git_ref = git_stdout(tree, &["describe", "--tags", "--exact-match"])
        .map(|tag| format!("refs/tags/{tag}"))
        .or_else(|| {
            git_stdout(tree, &["symbolic-ref", "HEAD"]).filter(|r| !r.is_empty())
        })
        .unwrap_or_else(|| sha.chars().take(12).collect());

    Some(GitSnapshot { sha, git_ref })
}

fn git_stdout(tree: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(tree)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}
