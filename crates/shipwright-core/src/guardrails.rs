//! Path and interactivity guardrails.
//!
//! Deletion goes through an allowlist rooted at the project's state,
//! cache, and `/tmp` trees; nothing outside it is ever removed, and the
//! roots themselves are protected. Interactive prompts collapse to their
//! defaults in CI or when stdin is not a terminal.

use std::env;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use shipwright_config::Paths;

/// Resolve a user-supplied path: reject relative paths, expand a leading
/// `~`, and normalise away `.`/`..` components lexically.
pub fn resolve_path(raw: &str, must_exist: bool) -> Result<PathBuf> {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .context("cannot expand ~: no home directory")?
            .join(rest)
    } else if raw == "~" {
        dirs::home_dir().context("cannot expand ~: no home directory")?
    } else {
        PathBuf::from(raw)
    };

    if !expanded.is_absolute() {
        bail!("path must be absolute: {raw:?}");
    }

    let normalised = normalise(&expanded);
    if must_exist && !normalised.exists() {
        bail!("path does not exist: {}", normalised.display());
    }
    Ok(normalised)
}

fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// The set of roots under which deletion is permitted.
#[derive(Debug, Clone)]
pub struct SafeDelete {
    roots: Vec<PathBuf>,
}

impl SafeDelete {
    pub fn new(paths: &Paths) -> Self {
        Self {
            roots: vec![
                paths.state_root.clone(),
                paths.cache_root.clone(),
                PathBuf::from("/tmp"),
            ],
        }
    }

    #[cfg(test)]
    fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Delete a file or directory tree, but only strictly inside one of
    /// the allowlisted roots. The roots themselves are never deleted.
    pub fn safe_rm(&self, path: &Path) -> Result<()> {
        if !path.is_absolute() {
            bail!("refusing to delete relative path {}", path.display());
        }
        let target = normalise(path);
        let allowed = self.roots.iter().any(|root| {
            let root = normalise(root);
            target != root && target.starts_with(&root)
        });
        if !allowed {
            bail!(
                "refusing to delete {} (outside the allowlisted roots)",
                target.display()
            );
        }
        let Ok(meta) = target.symlink_metadata() else {
            return Ok(());
        };
        if meta.file_type().is_dir() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("failed to delete {}", target.display()))?;
        } else {
            // Files and symlinks; a symlink to a directory is removed as a
            // link, never followed.
            fs::remove_file(&target)
                .with_context(|| format!("failed to delete {}", target.display()))?;
        }
        Ok(())
    }
}

/// Create a fresh `/tmp/<prefix>.<random>` directory.
pub fn safe_tmpdir(prefix: &str) -> Result<PathBuf> {
    for _ in 0..16 {
        let suffix: u64 = rand::random();
        let dir = PathBuf::from("/tmp").join(format!("{prefix}.{suffix:016x}"));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", dir.display()));
            }
        }
    }
    bail!("failed to create a unique temp dir for prefix {prefix:?}");
}

/// True in CI or when stdin is not a terminal.
pub fn is_non_interactive() -> bool {
    if env::var_os("CI").is_some() {
        return true;
    }
    !io::stdin().is_terminal()
}

/// Ask the user a yes/no question; non-interactively, the default wins.
pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    if is_non_interactive() {
        return Ok(default);
    }
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    eprint!("{prompt} {hint} ");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(match line.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}

/// Whether coloured output is wanted on stderr. `NO_COLOR` (any value)
/// wins over TTY detection.
pub fn color_enabled() -> bool {
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    io::stderr().is_terminal()
}
