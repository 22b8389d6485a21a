//! Host health probes.
//!
//! Five probes per host: reachability, disk, declared toolchains, the
//! container daemon, and clock drift. A reachability failure short-circuits
//! the rest. Results are cached on disk for five minutes so `check_all`
//! before every orchestration stays cheap.
//!
//! Remote commands are composed from the constant fragments below plus the
//! host's SSH alias; no user-supplied strings are ever interpolated.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shipwright_config::ConfigView;
use shipwright_types::{Host, Transport};

use crate::logger::Logger;
use crate::process::{self, RunSpec};
use crate::state::atomic_write_json;

/// On-disk cache TTL for a host's health report.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Per-probe command timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Disk usage thresholds (percent).
const DISK_WARN_PCT: u8 = 90;
const DISK_ERROR_PCT: u8 = 95;
/// Clock drift warning threshold.
const DRIFT_WARN: Duration = Duration::from_secs(30);

const CACHE_DIR: &str = "health";

// The whole remote command vocabulary. Anything else is a bug.
const FRAG_ECHO_OK: &str = "echo ok";
const FRAG_DISK: &str = "df -P /";
const FRAG_EPOCH: &str = "date +%s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostHealth {
    pub host: String,
    pub status: HealthStatus,
    pub probes: Vec<ProbeResult>,
    pub checked_at: DateTime<Utc>,
}

impl HostHealth {
    pub fn is_healthy(&self) -> bool {
        self.status != HealthStatus::Error
    }

    fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.name == name)
    }
}

pub struct HealthChecker<'a> {
    config: &'a ConfigView,
    logger: Logger,
    cache_dir: PathBuf,
    ssh_timeout: Duration,
}

impl<'a> HealthChecker<'a> {
    pub fn new(config: &'a ConfigView, logger: &Logger) -> Self {
        Self {
            config,
            logger: logger.scoped(None, None, Some("health")),
            cache_dir: config.paths.cache_root.join(CACHE_DIR),
            ssh_timeout: config.global.timeouts.ssh,
        }
    }

    /// Health of one host, served from cache when fresh.
    pub fn check(&self, host: &Host) -> Result<HostHealth> {
        if let Some(cached) = self.read_cache(&host.id) {
            return Ok(cached);
        }
        let health = self.probe_host(host);
        self.write_cache(&health);
        Ok(health)
    }

    /// Probe regardless of cache age, refreshing the cache.
    pub fn check_fresh(&self, host: &Host) -> HostHealth {
        let health = self.probe_host(host);
        self.write_cache(&health);
        health
    }

    pub fn check_all(&self) -> Result<Vec<HostHealth>> {
        self.config.hosts().map(|h| self.check(h)).collect()
    }

    /// Hosts whose aggregate status is not `error`, optionally filtered by
    /// a required capability.
    pub fn healthy_hosts(&self, capability: Option<&str>) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for host in self.config.hosts() {
            if let Some(cap) = capability
                && !host.has_capability(cap)
            {
                continue;
            }
            if self.check(host)?.is_healthy() {
                out.push(host.id.clone());
            }
        }
        Ok(out)
    }

    /// Whether a host is healthy and every required capability probed ok.
    pub fn is_ready(&self, host: &Host, required: &BTreeSet<String>) -> Result<bool> {
        let health = self.check(host)?;
        if !health.is_healthy() {
            return Ok(false);
        }
        for cap in required {
            if !host.has_capability(cap) {
                return Ok(false);
            }
            match health.probe(&format!("toolchain:{cap}")) {
                Some(p) if p.status != HealthStatus::Error => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn probe_host(&self, host: &Host) -> HostHealth {
        let mut probes = Vec::new();

        let reach = self.probe_reachability(host);
        let reachable = reach.status != HealthStatus::Error;
        probes.push(reach);

        if reachable {
            probes.push(self.probe_disk(host));
            for cap in &host.capabilities {
                probes.push(self.probe_toolchain(host, cap));
            }
            if host.has_capability("docker") || host.has_capability("runner") {
                probes.push(self.probe_daemon(host));
            }
            probes.push(self.probe_clock(host));
        }

        let status = aggregate(&probes);
        let health = HostHealth {
            host: host.id.clone(),
            status,
            probes,
            checked_at: Utc::now(),
        };
        if status == HealthStatus::Error {
            self.logger
                .scoped(None, Some(&host.id), None)
                .warn("host is unhealthy");
        }
        health
    }

    fn probe_reachability(&self, host: &Host) -> ProbeResult {
        match &host.transport {
            Transport::Local => ProbeResult {
                name: "reachability".into(),
                status: HealthStatus::Ok,
                detail: Some("local".into()),
                latency_ms: Some(0),
            },
            Transport::Ssh { alias } => match self.remote(alias, FRAG_ECHO_OK, self.ssh_timeout) {
                Ok(out) if out.success() && out.stdout.trim() == "ok" => ProbeResult {
                    name: "reachability".into(),
                    status: HealthStatus::Ok,
                    detail: None,
                    latency_ms: Some(out.duration.as_millis() as u64),
                },
                Ok(out) => ProbeResult {
                    name: "reachability".into(),
                    status: HealthStatus::Error,
                    detail: Some(if out.timed_out {
                        "connect timed out".to_string()
                    } else {
                        format!("ssh exited {}", out.exit_code)
                    }),
                    latency_ms: None,
                },
                Err(e) => ProbeResult {
                    name: "reachability".into(),
                    status: HealthStatus::Error,
                    detail: Some(format!("{e:#}")),
                    latency_ms: None,
                },
            },
        }
    }

    fn probe_disk(&self, host: &Host) -> ProbeResult {
        let out = match &host.transport {
            Transport::Local => process::run(
                &RunSpec::new("df", ["-P", "/"]).timeout(PROBE_TIMEOUT),
            ),
            Transport::Ssh { alias } => self.remote(alias, FRAG_DISK, PROBE_TIMEOUT),
        };
        match out {
            Ok(out) if out.success() => match parse_df(&out.stdout) {
                Some((pct, free_gib)) => {
                    let status = if pct > DISK_ERROR_PCT {
                        HealthStatus::Error
                    } else if pct > DISK_WARN_PCT {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Ok
                    };
                    ProbeResult {
                        name: "disk".into(),
                        status,
                        detail: Some(format!("{pct}% used, {free_gib:.1} GiB free")),
                        latency_ms: None,
                    }
                }
                None => probe_error("disk", "unparseable df output"),
            },
            Ok(out) => probe_error("disk", &format!("df exited {}", out.exit_code)),
            Err(e) => probe_error("disk", &format!("{e:#}")),
        }
    }

    fn probe_toolchain(&self, host: &Host, capability: &str) -> ProbeResult {
        let name = format!("toolchain:{capability}");
        let Some(argv) = toolchain_probe(capability, self.config) else {
            // Capabilities with no version probe (e.g. "runner" slots on
            // remote hosts) are reported present by declaration.
            return ProbeResult {
                name,
                status: HealthStatus::Ok,
                detail: Some("declared".into()),
                latency_ms: None,
            };
        };
        let out = match &host.transport {
            Transport::Local => process::run(
                &RunSpec::new(&argv[0], argv[1..].to_vec()).timeout(PROBE_TIMEOUT),
            ),
            Transport::Ssh { alias } => self.remote(alias, &argv.join(" "), PROBE_TIMEOUT),
        };
        match out {
            Ok(out) if out.success() => ProbeResult {
                name,
                status: HealthStatus::Ok,
                detail: Some(first_line(&out.stdout)),
                latency_ms: Some(out.duration.as_millis() as u64),
            },
            _ => ProbeResult {
                name,
                status: HealthStatus::Error,
                detail: Some("missing".into()),
                latency_ms: None,
            },
        }
    }

    fn probe_daemon(&self, host: &Host) -> ProbeResult {
        let out = match &host.transport {
            Transport::Local => process::run(
                &RunSpec::new("docker", ["info", "--format", "ok"]).timeout(PROBE_TIMEOUT),
            ),
            Transport::Ssh { alias } => {
                self.remote(alias, "docker info --format ok", PROBE_TIMEOUT)
            }
        };
        match out {
            Ok(out) if out.success() => ProbeResult {
                name: "docker".into(),
                status: HealthStatus::Ok,
                detail: Some("running".into()),
                latency_ms: None,
            },
            _ => probe_error("docker", "daemon not responding"),
        }
    }

    fn probe_clock(&self, host: &Host) -> ProbeResult {
        let Transport::Ssh { alias } = &host.transport else {
            // The local host defines zero drift.
            return ProbeResult {
                name: "clock".into(),
                status: HealthStatus::Ok,
                detail: Some("0s drift".into()),
                latency_ms: None,
            };
        };
        match self.remote(alias, FRAG_EPOCH, PROBE_TIMEOUT) {
            Ok(out) if out.success() => match out.stdout.trim().parse::<i64>() {
                Ok(remote_epoch) => {
                    let drift = (Utc::now().timestamp() - remote_epoch).unsigned_abs();
                    let status = if drift > DRIFT_WARN.as_secs() {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Ok
                    };
                    ProbeResult {
                        name: "clock".into(),
                        status,
                        detail: Some(format!("{drift}s drift")),
                        latency_ms: None,
                    }
                }
                Err(_) => probe_error("clock", "unparseable remote epoch"),
            },
            _ => probe_error("clock", "probe failed"),
        }
    }

    fn remote(
        &self,
        alias: &str,
        fragment: &str,
        timeout: Duration,
    ) -> Result<process::CommandOutput> {
        let connect_secs = self.ssh_timeout.as_secs().clamp(1, 30);
        let program = ssh_program();
        let spec = RunSpec::new(
            program.as_str(),
            [
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={connect_secs}"),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                alias.to_string(),
                fragment.to_string(),
            ],
        )
        .timeout(timeout);
        process::run(&spec)
    }

    fn read_cache(&self, host_id: &str) -> Option<HostHealth> {
        let path = self.cache_dir.join(format!("{host_id}.json"));
        let content = fs::read_to_string(path).ok()?;
        let health: HostHealth = serde_json::from_str(&content).ok()?;
        let age = Utc::now().signed_duration_since(health.checked_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > CACHE_TTL.as_secs() {
            return None;
        }
        Some(health)
    }

    fn write_cache(&self, health: &HostHealth) {
        // Best-effort: an unwritable cache only costs re-probing.
        if fs::create_dir_all(&self.cache_dir).is_err() {
            return;
        }
        let path = self.cache_dir.join(format!("{}.json", health.host));
        let _ = atomic_write_json(&path, health);
    }
}

fn aggregate(probes: &[ProbeResult]) -> HealthStatus {
    if probes.iter().any(|p| p.status == HealthStatus::Error) {
        HealthStatus::Error
    } else if probes.iter().any(|p| p.status == HealthStatus::Warning) {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    }
}

fn probe_error(name: &str, detail: &str) -> ProbeResult {
    ProbeResult {
        name: name.into(),
        status: HealthStatus::Error,
        detail: Some(detail.to_string()),
        latency_ms: None,
    }
}

/// Version-probe argv for a declared capability; None means "declaration
/// is trusted".
fn toolchain_probe(capability: &str, config: &ConfigView) -> Option<Vec<String>> {
    let argv: Vec<&str> = match capability {
        "rust" => vec!["cargo", "--version"],
        "go" => vec!["go", "version"],
        "bun" => vec!["bun", "--version"],
        "node" => vec!["node", "--version"],
        "docker" => vec!["docker", "--version"],
        "runner" => {
            let bin = config.global.runner_bin.as_deref().unwrap_or("act");
            return Some(vec![bin.to_string(), "--version".to_string()]);
        }
        _ => return None,
    };
    Some(argv.into_iter().map(str::to_string).collect())
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().trim().to_string()
}

/// Parse `df -P` output into (usage percent, free GiB).
fn parse_df(output: &str) -> Option<(u8, f64)> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let pct = fields[4].trim_end_matches('%').parse::<u8>().ok()?;
    let free_kib = fields[3].parse::<u64>().ok()?;
    Some((pct, free_kib as f64 / (1024.0 * 1024.0)))
}

fn ssh_program() -> String {
    env::var("SHIPWRIGHT_SSH_BIN").unwrap_or_else(|_| "ssh".to_string())
}
