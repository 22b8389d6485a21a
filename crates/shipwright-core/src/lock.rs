//! Per-(tool, version) advisory locking.
//!
//! The lock file lives beside the tool-version's build runs and holds one
//! line: `<pid> <epoch> <run_id>`. Reclaiming requires BOTH conditions: the
//! recorded process is gone AND the lock has aged past the stale
//! threshold. A live process never loses its lock, however old.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use shipwright_types::ErrorKind;

pub const LOCK_FILE: &str = ".lock";
/// Locks older than this are eligible for reclaim (dead holder required).
pub const STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_epoch: i64,
    pub run_id: String,
}

impl LockInfo {
    pub(crate) fn to_line(&self) -> String {
        format!("{} {} {}\n", self.pid, self.acquired_epoch, self.run_id)
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let mut parts = content.split_whitespace();
        let pid = parts
            .next()
            .context("lock file is empty")?
            .parse()
            .context("lock file has a malformed pid")?;
        let acquired_epoch = parts
            .next()
            .context("lock file is missing the epoch")?
            .parse()
            .context("lock file has a malformed epoch")?;
        let run_id = parts
            .next()
            .context("lock file is missing the run id")?
            .to_string();
        Ok(Self {
            pid,
            acquired_epoch,
            run_id,
        })
    }

    pub fn age(&self) -> Duration {
        let secs = (Utc::now().timestamp() - self.acquired_epoch).max(0) as u64;
        Duration::from_secs(secs)
    }
}

/// Observation returned by [`check`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct LockCheck {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub process_alive: bool,
    pub stale: bool,
}

/// Held lock handle; released on Drop as a best effort.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

fn lock_path(tool_version_dir: &Path) -> PathBuf {
    tool_version_dir.join(LOCK_FILE)
}

/// Acquire the lock for one (tool, version) directory, reclaiming a stale
/// one when its holder is dead and past the threshold. A held lock surfaces
/// as `ErrorKind::LockConflict` inside the error chain.
pub fn acquire(tool_version_dir: &Path, run_id: &str) -> Result<BuildLock> {
    fs::create_dir_all(tool_version_dir).with_context(|| {
        format!("failed to create lock dir {}", tool_version_dir.display())
    })?;
    let path = lock_path(tool_version_dir);

    if path.exists() {
        match read_info(&path) {
            Ok(existing) => {
                let alive = process_alive(existing.pid);
                let aged = existing.age() >= STALE_THRESHOLD;
                if !alive && aged {
                    // Reclaim: the recorded process is gone and the lock is old.
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to remove stale lock {}", path.display())
                    })?;
                } else {
                    return Err(anyhow::Error::new(ErrorKind::LockConflict {
                        pid: existing.pid,
                        run_id: existing.run_id.clone(),
                    }))
                    .with_context(|| {
                        format!(
                            "lock already held by pid {} (age {}s, run {})",
                            existing.pid,
                            existing.age().as_secs(),
                            existing.run_id
                        )
                    });
                }
            }
            Err(_) => {
                // Corrupt lock files are removed rather than wedging releases.
                fs::remove_file(&path).with_context(|| {
                    format!("failed to remove corrupt lock {}", path.display())
                })?;
            }
        }
    }

    let info = LockInfo {
        pid: std::process::id(),
        acquired_epoch: Utc::now().timestamp(),
        run_id: run_id.to_string(),
    };
    write_atomically(&path, &info)?;

    Ok(BuildLock {
        path,
        pid: info.pid,
        released: false,
    })
}

/// Report the lock state without mutating anything.
pub fn check(tool_version_dir: &Path) -> Result<LockCheck> {
    let path = lock_path(tool_version_dir);
    if !path.exists() {
        return Ok(LockCheck {
            locked: false,
            pid: None,
            age_secs: None,
            run_id: None,
            process_alive: false,
            stale: false,
        });
    }
    let info = read_info(&path)?;
    let alive = process_alive(info.pid);
    let age = info.age();
    Ok(LockCheck {
        locked: true,
        pid: Some(info.pid),
        age_secs: Some(age.as_secs()),
        run_id: Some(info.run_id),
        process_alive: alive,
        stale: !alive && age >= STALE_THRESHOLD,
    })
}

impl BuildLock {
    /// Release the lock, verifying this process still owns it.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.path.exists() {
            let info = read_info(&self.path)?;
            if info.pid != self.pid {
                bail!(
                    "lock at {} is now owned by pid {}, refusing to release",
                    self.path.display(),
                    info.pid
                );
            }
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn read_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    LockInfo::parse(&content)
        .with_context(|| format!("failed to parse lock file {}", path.display()))
}

fn write_atomically(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create lock tmp file {}", tmp.display()))?;
        file.write_all(info.to_line().as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp.display()))?;
        file.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename lock file to {}", path.display()))?;
    Ok(())
}

/// Whether a PID refers to a live process.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // kill -0 probes for existence without signalling.
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
