//! Source tree synchronisation and remote git state recovery.
//!
//! `sync` pushes the tool's local tree to a remote host, preferring rsync
//! deltas and falling back to a tar stream over SSH. `ensure_repo_ready`
//! drives the remote work tree through its recovery state machine until it
//! is a clean checkout of the requested version:
//!
//! ```text
//!  missing   --clone-->  pristine  --checkout-->  ready
//!  broken    --rm+clone->  pristine
//!  pristine  --fetch+reset--> pristine
//!  dirty     --stash-and-retry--> pristine
//!  dirty     --rm+clone (last resort)--> pristine
//! ```
//!
//! Remote commands are composed from the constants in this file plus
//! single-quoted configuration values; the grammar differs between POSIX
//! shells and Windows `cmd`.

use std::env;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use shipwright_types::{ErrorKind, Host, OsKind, Transport};

use crate::logger::Logger;
use crate::process::{self, RunSpec};

/// Per-step timeouts from the recovery state machine.
const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths never shipped to a build host.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "dist",
    "build",
    "__pycache__",
    ".DS_Store",
    "Thumbs.db",
    ".env",
    "*.env",
];

/// Push `local_path` to `remote_path` on the host. Idempotent: a second
/// successful sync leaves the remote tree byte-identical.
pub fn sync(
    host: &Host,
    logger: &Logger,
    local_path: &Path,
    remote_path: &str,
    extra_excludes: &[String],
    timeout: Duration,
) -> Result<()> {
    let Transport::Ssh { alias } = &host.transport else {
        // The controller builds straight out of the local tree.
        return Ok(());
    };
    if !local_path.is_dir() {
        bail!("local source tree {} does not exist", local_path.display());
    }
    let log = logger.scoped(None, Some(&host.id), Some("sync"));

    if remote_has_rsync(alias) {
        log.debug("syncing via rsync");
        rsync(alias, local_path, remote_path, extra_excludes, timeout)
    } else {
        log.debug("remote lacks rsync; falling back to tar stream");
        tar_stream(alias, local_path, remote_path, extra_excludes, timeout)
    }
}

fn remote_has_rsync(alias: &str) -> bool {
    let program = ssh_program();
    let spec = RunSpec::new(
        program.as_str(),
        ssh_args(alias, "command -v rsync >/dev/null 2>&1 && echo yes || echo no"),
    )
    .timeout(CLASSIFY_TIMEOUT);
    match process::run(&spec) {
        Ok(out) => out.success() && out.stdout.trim() == "yes",
        Err(_) => false,
    }
}

/// The rsync argv. `--delete` plus a stable exclude set is what makes two
/// successive syncs leave the remote tree byte-identical.
fn rsync_args(alias: &str, local_path: &Path, remote_path: &str, extra_excludes: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-az".into(),
        "--delete".into(),
        // Honour the project's own ignore file on top of the defaults.
        "--filter=:- .gitignore".into(),
        "-e".into(),
        format!("{} -o BatchMode=yes -o StrictHostKeyChecking=accept-new", ssh_program()),
    ];
    for exclude in DEFAULT_EXCLUDES.iter().copied().map(str::to_string).chain(
        extra_excludes.iter().cloned(),
    ) {
        args.push(format!("--exclude={exclude}"));
    }
    // Trailing slash: sync the tree's contents, not the directory itself.
    args.push(format!("{}/", local_path.display()));
    args.push(format!("{alias}:{remote_path}/"));
    args
}

fn rsync(
    alias: &str,
    local_path: &Path,
    remote_path: &str,
    extra_excludes: &[String],
    timeout: Duration,
) -> Result<()> {
    let args = rsync_args(alias, local_path, remote_path, extra_excludes);
    let program = rsync_program();
    let out = process::run(&RunSpec::new(program.as_str(), args).timeout(timeout))?;
    if out.timed_out {
        return Err(anyhow::Error::new(ErrorKind::Timeout("source sync".into())));
    }
    if !out.success() {
        bail!("rsync exited {}: {}", out.exit_code, tail(&out.stderr));
    }
    Ok(())
}

/// `tar -cz` locally, piped into `tar -xz` on the remote. Two argv-based
/// children connected by a pipe; no shell in between on our side.
fn tar_stream(
    alias: &str,
    local_path: &Path,
    remote_path: &str,
    extra_excludes: &[String],
    timeout: Duration,
) -> Result<()> {
    let mut tar_args: Vec<String> = vec!["-C".into(), local_path.display().to_string()];
    for exclude in DEFAULT_EXCLUDES.iter().copied().map(str::to_string).chain(
        extra_excludes.iter().cloned(),
    ) {
        tar_args.push(format!("--exclude={exclude}"));
    }
    tar_args.extend(["-czf".into(), "-".into(), ".".into()]);

    let mut tar = Command::new("tar")
        .args(&tar_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn tar")?;
    let tar_stdout = tar.stdout.take().context("tar stdout unavailable")?;

    let unpack = format!(
        "mkdir -p {path} && tar -xzf - -C {path}",
        path = shell_quote(remote_path)
    );
    let program = ssh_program();
    let mut ssh = Command::new(&program)
        .args(ssh_args(alias, &unpack))
        .stdin(tar_stdout)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn ssh for tar stream")?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match ssh.try_wait().context("failed to poll ssh")? {
            Some(status) => {
                let _ = tar.wait();
                if !status.success() {
                    bail!("tar-over-ssh sync exited {}", status.code().unwrap_or(-1));
                }
                return Ok(());
            }
            None if std::time::Instant::now() >= deadline => {
                let _ = ssh.kill();
                let _ = tar.kill();
                let _ = ssh.wait();
                let _ = tar.wait();
                return Err(anyhow::Error::new(ErrorKind::Timeout("source sync".into())));
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

/// State the classifier reports for the remote directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepoState {
    Missing,
    Broken,
    Pristine,
    Dirty,
}

/// Drive the remote work tree to a clean checkout of `version`.
pub fn ensure_repo_ready(
    host: &Host,
    logger: &Logger,
    remote_path: &str,
    repo_url: &str,
    version: &str,
) -> Result<()> {
    let Transport::Ssh { alias } = &host.transport else {
        bail!("ensure_repo_ready only applies to remote hosts");
    };
    let os = host.platform.os;
    let log = logger.scoped(None, Some(&host.id), Some("sync"));

    let mut stashed_once = false;
    // Each loop iteration performs one recovery transition; four covers the
    // longest path (dirty → stash fail → rm+clone → checkout).
    for _ in 0..4 {
        let state = classify(alias, os, remote_path)?;
        match state {
            RepoState::Missing => {
                log.info("remote checkout missing; cloning");
                run_remote(
                    alias,
                    &compose_clone(os, repo_url, remote_path),
                    CLONE_TIMEOUT,
                )?;
            }
            RepoState::Broken => {
                log.warn("remote directory is not a work tree; re-cloning");
                run_remote(
                    alias,
                    &compose_rm_clone(os, repo_url, remote_path),
                    CLONE_TIMEOUT,
                )?;
            }
            RepoState::Dirty => {
                if stashed_once {
                    // Stash did not get the tree clean; last resort.
                    log.warn("stash failed to clean the tree; re-cloning");
                    run_remote(
                        alias,
                        &compose_rm_clone(os, repo_url, remote_path),
                        CLONE_TIMEOUT,
                    )?;
                } else {
                    log.info("remote tree is dirty; stashing");
                    stashed_once = true;
                    if run_remote(alias, &compose_stash(os, remote_path), FETCH_TIMEOUT).is_err() {
                        log.warn("stash failed; re-cloning");
                        run_remote(
                            alias,
                            &compose_rm_clone(os, repo_url, remote_path),
                            CLONE_TIMEOUT,
                        )?;
                    }
                }
            }
            RepoState::Pristine => {
                run_remote(alias, &compose_fetch(os, remote_path), FETCH_TIMEOUT)?;
                run_remote(
                    alias,
                    &compose_checkout(os, remote_path, version),
                    CHECKOUT_TIMEOUT,
                )?;
                return Ok(());
            }
        }
    }
    bail!("remote work tree on {} did not converge to a clean state", host.id)
}

fn classify(alias: &str, os: OsKind, remote_path: &str) -> Result<RepoState> {
    let out = run_remote(alias, &compose_classify(os, remote_path), CLASSIFY_TIMEOUT)?;
    let answer = out.stdout.trim();
    match answer {
        "missing" => Ok(RepoState::Missing),
        "broken" => Ok(RepoState::Broken),
        "clean" => Ok(RepoState::Pristine),
        "dirty" => Ok(RepoState::Dirty),
        other => bail!("unrecognised remote state {other:?}"),
    }
}

fn run_remote(alias: &str, command: &str, timeout: Duration) -> Result<process::CommandOutput> {
    let program = ssh_program();
    let out = process::run(
        &RunSpec::new(program.as_str(), ssh_args(alias, command)).timeout(timeout),
    )?;
    if out.timed_out {
        return Err(anyhow::Error::new(ErrorKind::Timeout(format!(
            "remote command on {alias}"
        ))));
    }
    if !out.success() {
        bail!(
            "remote command exited {} on {alias}: {}",
            out.exit_code,
            tail(&out.stderr)
        );
    }
    Ok(out)
}

fn ssh_args(alias: &str, command: &str) -> Vec<String> {
    vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        alias.to_string(),
        command.to_string(),
    ]
}

// Command grammar. Unix composes with `&&` over `sh`; Windows composes
// with `&&` over `cmd` using `cd /d` and backslash paths.

fn compose_classify(os: OsKind, path: &str) -> String {
    match os {
        OsKind::Windows => format!(
            "if not exist {p} (echo missing) else if not exist {p}\\.git (echo broken) else (cd /d {p} && git diff --quiet && git diff --cached --quiet && echo clean || echo dirty)",
            p = windows_path(path)
        ),
        _ => format!(
            "if [ ! -e {p} ]; then echo missing; elif [ ! -d {p}/.git ]; then echo broken; elif [ -n \"$(cd {p} && git status --porcelain)\" ]; then echo dirty; else echo clean; fi",
            p = shell_quote(path)
        ),
    }
}

fn compose_clone(os: OsKind, repo_url: &str, path: &str) -> String {
    match os {
        OsKind::Windows => format!("git clone {repo_url} {}", windows_path(path)),
        _ => format!("git clone {} {}", shell_quote(repo_url), shell_quote(path)),
    }
}

fn compose_rm_clone(os: OsKind, repo_url: &str, path: &str) -> String {
    match os {
        OsKind::Windows => format!(
            "rmdir /s /q {p} && git clone {repo_url} {p}",
            p = windows_path(path)
        ),
        _ => format!(
            "rm -rf {p} && git clone {url} {p}",
            p = shell_quote(path),
            url = shell_quote(repo_url)
        ),
    }
}

fn compose_fetch(os: OsKind, path: &str) -> String {
    match os {
        OsKind::Windows => format!(
            "cd /d {} && git fetch --tags --force origin",
            windows_path(path)
        ),
        _ => format!(
            "cd {} && git fetch --tags --force origin",
            shell_quote(path)
        ),
    }
}

fn compose_stash(os: OsKind, path: &str) -> String {
    match os {
        OsKind::Windows => format!(
            "cd /d {} && git stash --include-untracked",
            windows_path(path)
        ),
        _ => format!(
            "cd {} && git stash --include-untracked",
            shell_quote(path)
        ),
    }
}

fn compose_checkout(os: OsKind, path: &str, version: &str) -> String {
    match os {
        OsKind::Windows => format!(
            "cd /d {} && git checkout --detach {version}",
            windows_path(path)
        ),
        _ => format!(
            "cd {} && git checkout --detach {}",
            shell_quote(path),
            shell_quote(version)
        ),
    }
}

/// Single-quote a value for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn windows_path(path: &str) -> String {
    path.replace('/', "\\")
}

fn tail(s: &str) -> String {
    let lines: Vec<&str> = s.lines().collect();
    lines
        .iter()
        .rev()
        .take(5)
        .rev()
        .copied()
        .collect::<Vec<_>>()
        .join(" | ")
}

fn ssh_program() -> String {
    env::var("SHIPWRIGHT_SSH_BIN").unwrap_or_else(|_| "ssh".to_string())
}

fn rsync_program() -> String {
    env::var("SHIPWRIGHT_RSYNC_BIN").unwrap_or_else(|_| "rsync".to_string())
}
