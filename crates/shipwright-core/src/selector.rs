//! Host selection and concurrency slot accounting.
//!
//! Each host has a slot directory under `<state-root>/locks/<host>/`; one
//! file per in-flight build. Slot files older than an hour are reclaimed,
//! covering crashed runs. Selection scores candidates so a mostly-idle
//! local host wins over a busy remote one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;

use shipwright_config::ConfigView;
use shipwright_types::{Host, Platform};

use crate::health::HealthChecker;
use crate::lock::LockInfo;

pub const SLOTS_DIR: &str = "locks";
/// Slot files older than this are treated as leaked and reclaimed.
pub const SLOT_TTL: Duration = Duration::from_secs(60 * 60);
const WAIT_POLL: Duration = Duration::from_secs(2);

const SCORE_BASE: i64 = 100;
const SCORE_PER_FREE_SLOT: i64 = 10;
const SCORE_LOCAL: i64 = 20;

/// Per-host usage snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SlotUsage {
    pub host: String,
    pub usage: u32,
    pub limit: u32,
    pub available: u32,
    pub at_capacity: bool,
}

/// A held slot; removed on release or Drop.
#[derive(Debug)]
pub struct SlotGuard {
    path: PathBuf,
}

impl SlotGuard {
    pub fn release(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct HostSelector<'a> {
    config: &'a ConfigView,
    slots_root: PathBuf,
}

impl<'a> HostSelector<'a> {
    pub fn new(config: &'a ConfigView) -> Self {
        Self {
            config,
            slots_root: config.paths.state_root.join(SLOTS_DIR),
        }
    }

    /// Pick the host to build `platform`. Candidates must be healthy,
    /// match the platform, and carry `capability` when one is required.
    /// `prefer_host` wins while it has free capacity. When every candidate
    /// is saturated the best-scoring one is returned anyway; the caller
    /// must then wait on a slot or fail.
    pub fn choose_host(
        &self,
        checker: &HealthChecker<'_>,
        platform: &Platform,
        capability: Option<&str>,
        prefer_host: Option<&str>,
    ) -> Result<String> {
        let mut candidates: Vec<(&Host, u32)> = Vec::new();
        for host in self.config.hosts() {
            if host.platform != *platform {
                continue;
            }
            if let Some(cap) = capability
                && !host.has_capability(cap)
            {
                continue;
            }
            if !checker.check(host)?.is_healthy() {
                continue;
            }
            let free = self.free_slots(host)?;
            candidates.push((host, free));
        }
        if candidates.is_empty() {
            bail!("no healthy host available for platform {platform}");
        }

        if let Some(preferred) = prefer_host
            && let Some((host, free)) = candidates.iter().find(|(h, _)| h.id == preferred)
            && *free > 0
        {
            return Ok(host.id.clone());
        }

        candidates.sort_by_key(|(host, free)| std::cmp::Reverse(score(host, *free)));

        // Highest-scoring candidate with capacity, else the best overall.
        if let Some((host, _)) = candidates.iter().find(|(_, free)| *free > 0) {
            return Ok(host.id.clone());
        }
        Ok(candidates[0].0.id.clone())
    }

    /// Take one concurrency slot on `host`, optionally waiting for one to
    /// free up. Fails immediately at capacity when `wait` is None.
    pub fn acquire_slot(
        &self,
        host: &Host,
        run_id: &str,
        wait: Option<Duration>,
    ) -> Result<SlotGuard> {
        let deadline = wait.map(|w| std::time::Instant::now() + w);
        loop {
            self.reclaim_stale(host)?;
            if self.used_slots(host)? < host.concurrency {
                match self.try_create_slot(host, run_id) {
                    Ok(guard) => return Ok(guard),
                    // Lost the race to another process; re-evaluate.
                    Err(e) if e.is::<SlotRace>() => {}
                    Err(e) => return Err(e),
                }
            }
            match deadline {
                Some(d) if std::time::Instant::now() < d => {
                    std::thread::sleep(WAIT_POLL);
                }
                Some(_) => bail!(
                    "timed out waiting for a build slot on {} ({} in use)",
                    host.id,
                    host.concurrency
                ),
                None => bail!(
                    "host {} is at capacity ({} slots in use)",
                    host.id,
                    host.concurrency
                ),
            }
        }
    }

    /// Remove a slot by name; used when releasing on behalf of a finished
    /// run id rather than through a live guard.
    pub fn release_slot(&self, host: &Host, run_id: &str) -> Result<()> {
        let path = self.slot_dir(&host.id).join(format!("{run_id}.lock"));
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove slot {}", path.display()))?;
        }
        Ok(())
    }

    /// Usage across all configured hosts.
    pub fn queue_status(&self) -> Result<Vec<SlotUsage>> {
        let mut out = Vec::new();
        for host in self.config.hosts() {
            self.reclaim_stale(host)?;
            let usage = self.used_slots(host)?;
            out.push(SlotUsage {
                host: host.id.clone(),
                usage,
                limit: host.concurrency,
                available: host.concurrency.saturating_sub(usage),
                at_capacity: usage >= host.concurrency,
            });
        }
        Ok(out)
    }

    fn slot_dir(&self, host_id: &str) -> PathBuf {
        self.slots_root.join(host_id)
    }

    fn used_slots(&self, host: &Host) -> Result<u32> {
        let dir = self.slot_dir(&host.id);
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "lock") {
                count += 1;
            }
        }
        Ok(count)
    }

    fn free_slots(&self, host: &Host) -> Result<u32> {
        self.reclaim_stale(host)?;
        Ok(host.concurrency.saturating_sub(self.used_slots(host)?))
    }

    fn reclaim_stale(&self, host: &Host) -> Result<()> {
        let dir = self.slot_dir(&host.id);
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "lock") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match LockInfo::parse(&content) {
                Ok(info) if info.age() >= SLOT_TTL => {
                    let _ = fs::remove_file(&path);
                }
                Ok(_) => {}
                // Unreadable slot files are leaked junk.
                Err(_) => {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    fn try_create_slot(&self, host: &Host, run_id: &str) -> Result<SlotGuard> {
        let dir = self.slot_dir(&host.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create slot dir {}", dir.display()))?;
        let path = dir.join(format!("{run_id}.lock"));
        let info = LockInfo {
            pid: std::process::id(),
            acquired_epoch: Utc::now().timestamp(),
            run_id: run_id.to_string(),
        };
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(anyhow::Error::new(SlotRace));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to create slot {}", path.display()));
            }
        };
        file.write_all(info.to_line().as_bytes())
            .with_context(|| format!("failed to write slot {}", path.display()))?;
        Ok(SlotGuard { path })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("slot already taken")]
struct SlotRace;

fn score(host: &Host, free_slots: u32) -> i64 {
    let mut score = SCORE_BASE + SCORE_PER_FREE_SLOT * free_slots as i64;
    if host.transport.is_local() {
        score += SCORE_LOCAL;
    }
    score
}
