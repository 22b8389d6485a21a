//! Shared domain types for the shipwright release orchestrator.
//!
//! Everything that crosses a component boundary lives here: target
//! platforms, host records, the per-run build state, artifact and manifest
//! records, and the closed set of error kinds with their process exit
//! codes. Components exchange these typed records; only the CLI renders
//! JSON for human or machine consumption.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Current build-run state schema version
pub const CURRENT_STATE_VERSION: &str = "shipwright.state.v1";

/// Current release manifest schema version
pub const CURRENT_MANIFEST_VERSION: &str = "shipwright.manifest.v1";

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Operating system half of a target platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Linux,
    Darwin,
    Windows,
}

impl OsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsKind::Linux => "linux",
            OsKind::Darwin => "darwin",
            OsKind::Windows => "windows",
        }
    }

    /// Default archive extension for release assets on this OS.
    pub fn default_archive_ext(&self) -> &'static str {
        match self {
            OsKind::Windows => "zip",
            _ => "tar.gz",
        }
    }

    /// Binaries on Windows carry `.exe`; elsewhere no suffix.
    pub fn exe_suffix(&self) -> &'static str {
        match self {
            OsKind::Windows => ".exe",
            _ => "",
        }
    }
}

impl FromStr for OsKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(OsKind::Linux),
            "darwin" | "macos" => Ok(OsKind::Darwin),
            "windows" => Ok(OsKind::Windows),
            other => anyhow::bail!("unknown os {other:?} (expected linux, darwin, or windows)"),
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build target platform, written `os/arch` (e.g. `linux/amd64`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Platform {
    pub os: OsKind,
    pub arch: String,
}

impl Platform {
    pub fn new(os: OsKind, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid platform {s:?} (expected os/arch)"))?;
        if arch.is_empty() {
            anyhow::bail!("invalid platform {s:?} (empty arch)");
        }
        Ok(Platform {
            os: os.parse()?,
            arch: arch.to_string(),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

// Platforms serialize as their `os/arch` string form so state files and
// manifests stay readable.
impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How the controller reaches a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// The controller machine itself.
    Local,
    /// A remote machine reached through a stable SSH alias.
    Ssh { alias: String },
}

impl Transport {
    pub fn is_local(&self) -> bool {
        matches!(self, Transport::Local)
    }
}

/// A machine capable of producing artifacts for one or more platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub platform: Platform,
    pub transport: Transport,
    /// Declared capability set, e.g. {"rust", "go", "docker"}.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Maximum concurrent builds this host accepts. Build commands running
    /// in parallel on the same work tree must be race-free; shipwright does
    /// not serialise per-tool beyond this cap.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_concurrency() -> u32 {
    1
}

impl Host {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}

/// Per-OS archive formats for a tool's release assets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveFormats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub darwin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<String>,
}

impl ArchiveFormats {
    pub fn for_os(&self, os: OsKind) -> Option<&str> {
        match os {
            OsKind::Linux => self.linux.as_deref(),
            OsKind::Darwin => self.darwin.as_deref(),
            OsKind::Windows => self.windows.as_deref(),
        }
    }
}

/// Artifact naming pattern overrides for a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamingOverrides {
    /// Versioned pattern used for release assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioned: Option<String>,
    /// Version-less pattern expected by legacy installer scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<String>,
}

/// Immutable description of one tool in the release fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    /// Upstream repository in `owner/name` form.
    pub repo: String,
    /// Source tree on the controller.
    pub local_path: PathBuf,
    /// Language tag driving the remote artifact path (e.g. "rust", "go").
    pub language: String,
    /// Build command template executed on native hosts.
    pub build_cmd: String,
    /// Base name of the produced binary. Must be non-empty when any target
    /// builds natively.
    pub binary_name: String,
    #[serde(default)]
    pub archive_format: ArchiveFormats,
    /// Ordered target platforms.
    pub targets: Vec<Platform>,
    /// Workflow file path for the container runner, relative to the tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// platform → runner job name; an absent or null entry means native.
    #[serde(default)]
    pub runner_job_map: BTreeMap<String, Option<String>>,
    /// host id → remote source path override.
    #[serde(default)]
    pub host_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact_naming: NamingOverrides,
    /// Bundled installer script expected to resolve the compat name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_script_path: Option<PathBuf>,
    /// platform → extra environment for cross builds.
    #[serde(default)]
    pub cross_compile: BTreeMap<String, BTreeMap<String, String>>,
    /// Canary check commands run downstream (names only; execution is
    /// outside the engine).
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minisign_pubkey: Option<String>,
    /// platform → target triple override.
    #[serde(default)]
    pub target_triples: BTreeMap<String, String>,
    /// arch → alias used when rendering artifact names (e.g. amd64 → x86_64).
    #[serde(default)]
    pub arch_aliases: BTreeMap<String, String>,
}

impl Tool {
    /// The runner job for a platform, if the tool builds it in containers.
    pub fn runner_job(&self, platform: &Platform) -> Option<&str> {
        self.runner_job_map
            .get(&platform.to_string())
            .and_then(|j| j.as_deref())
    }
}

/// Overall status of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs are frozen: the state store refuses further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of one host's work within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One recorded retry attempt against a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Mutable per-host sub-record of a build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProgress {
    pub platform: Platform,
    pub status: HostStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub trail: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub last_updated_at: DateTime<Utc>,
}

impl HostProgress {
    pub fn pending(platform: Platform) -> Self {
        Self {
            platform,
            status: HostStatus::Pending,
            attempts: 0,
            last_error: None,
            trail: Vec::new(),
            artifact_path: None,
            duration_ms: None,
            last_updated_at: Utc::now(),
        }
    }
}

/// A collected build output as recorded in run state; the full
/// [`ArtifactRecord`] with format detection lives in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateArtifact {
    pub host: String,
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// Persisted state of one orchestration invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub state_version: String,
    pub run_id: String,
    pub tool: String,
    pub version: String,
    pub targets: Vec<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by host id.
    pub hosts: BTreeMap<String, HostProgress>,
    /// Collected artifacts, appended as hosts complete.
    #[serde(default)]
    pub artifacts: Vec<StateArtifact>,
}

/// Archive format of a collected artifact, detected from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    TarGz,
    Zip,
    None,
}

impl ArchiveKind {
    pub fn detect(name: &str) -> Self {
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else {
            ArchiveKind::None
        }
    }
}

/// A successful build output plus computed metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub platform: Platform,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub format: ArchiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance_path: Option<PathBuf>,
}

/// The authoritative JSON description of a release. Checksum files and
/// signatures are derived from this record, never the reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub manifest_version: String,
    pub tool: String,
    /// Always `v`-prefixed.
    pub version: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    pub built_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub artifacts: Vec<ArtifactRecord>,
}

/// The closed set of failure kinds the orchestrator reports. Each maps to
/// a stable process exit code; `partial` and `internal_error` share 1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("invalid arguments or configuration: {0}")]
    InvalidArgs(String),
    #[error("lock held by pid {pid} (run {run_id})")]
    LockConflict { pid: u32, run_id: String },
    #[error("required dependency missing: {0}")]
    DependencyMissing(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("build failed: {0}")]
    BuildFailure(String),
    #[error("artifact collection failed: {0}")]
    ArtifactFailure(String),
    #[error("upstream API rate limited: {0}")]
    RateLimited(String),
    #[error("some targets failed")]
    Partial,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvalidArgs(_) => 4,
            ErrorKind::LockConflict { .. } => 2,
            ErrorKind::DependencyMissing(_) => 3,
            ErrorKind::Timeout(_) => 5,
            ErrorKind::BuildFailure(_) => 6,
            ErrorKind::ArtifactFailure(_) => 7,
            ErrorKind::RateLimited(_) => 8,
            ErrorKind::Partial => 1,
            ErrorKind::Internal(_) => 1,
        }
    }

    /// Only transient failures are eligible for the retry envelope.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout(_) | ErrorKind::BuildFailure(_))
    }

    /// Stable identifier used in state files and log records.
    pub fn ident(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgs(_) => "invalid_args",
            ErrorKind::LockConflict { .. } => "lock_conflict",
            ErrorKind::DependencyMissing(_) => "dependency_missing",
            ErrorKind::Timeout(_) => "timeout",
            ErrorKind::BuildFailure(_) => "build_failure",
            ErrorKind::ArtifactFailure(_) => "artifact_failure",
            ErrorKind::RateLimited(_) => "rate_limited",
            ErrorKind::Partial => "partial",
            ErrorKind::Internal(_) => "internal_error",
        }
    }
}

/// Normalise a version tag to its `v`-prefixed form.
pub fn v_prefixed(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_and_displays() {
        let p: Platform = "linux/amd64".parse().expect("parse");
        assert_eq!(p.os, OsKind::Linux);
        assert_eq!(p.arch, "amd64");
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn platform_accepts_macos_alias() {
        let p: Platform = "macos/arm64".parse().expect("parse");
        assert_eq!(p.os, OsKind::Darwin);
        assert_eq!(p.to_string(), "darwin/arm64");
    }

    #[test]
    fn platform_rejects_missing_arch() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_rejects_unknown_os() {
        let err = "plan9/amd64".parse::<Platform>().unwrap_err();
        assert!(err.to_string().contains("unknown os"));
    }

    #[test]
    fn platform_serde_uses_string_form() {
        let p = Platform::new(OsKind::Darwin, "arm64");
        let json = serde_json::to_string(&p).expect("serialize");
        assert_eq!(json, "\"darwin/arm64\"");
        let back: Platform = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, p);
    }

    #[test]
    fn archive_kind_detection() {
        assert_eq!(ArchiveKind::detect("t-1.0-linux-amd64.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("t.tgz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("t-1.0-windows-amd64.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect("t-linux-amd64"), ArchiveKind::None);
    }

    #[test]
    fn exit_codes_are_the_closed_set() {
        assert_eq!(ErrorKind::InvalidArgs("x".into()).exit_code(), 4);
        assert_eq!(
            ErrorKind::LockConflict {
                pid: 1,
                run_id: "r".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(ErrorKind::DependencyMissing("docker".into()).exit_code(), 3);
        assert_eq!(ErrorKind::Timeout("build".into()).exit_code(), 5);
        assert_eq!(ErrorKind::BuildFailure("exit 1".into()).exit_code(), 6);
        assert_eq!(ErrorKind::ArtifactFailure("scp".into()).exit_code(), 7);
        assert_eq!(ErrorKind::RateLimited("api".into()).exit_code(), 8);
        assert_eq!(ErrorKind::Partial.exit_code(), 1);
        assert_eq!(ErrorKind::Internal("bug".into()).exit_code(), 1);
    }

    #[test]
    fn only_timeout_and_build_failure_retry() {
        assert!(ErrorKind::Timeout("t".into()).retryable());
        assert!(ErrorKind::BuildFailure("b".into()).retryable());
        assert!(!ErrorKind::DependencyMissing("d".into()).retryable());
        assert!(!ErrorKind::InvalidArgs("a".into()).retryable());
        assert!(!ErrorKind::RateLimited("r".into()).retryable());
        assert!(!ErrorKind::ArtifactFailure("s".into()).retryable());
    }

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Created.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn tool_runner_job_lookup() {
        let mut map = BTreeMap::new();
        map.insert("linux/amd64".to_string(), Some("build-linux".to_string()));
        map.insert("darwin/arm64".to_string(), None);
        let tool = sample_tool(map);

        assert_eq!(
            tool.runner_job(&"linux/amd64".parse().unwrap()),
            Some("build-linux")
        );
        assert_eq!(tool.runner_job(&"darwin/arm64".parse().unwrap()), None);
        assert_eq!(tool.runner_job(&"windows/amd64".parse().unwrap()), None);
    }

    #[test]
    fn v_prefix_is_idempotent() {
        assert_eq!(v_prefixed("1.2.3"), "v1.2.3");
        assert_eq!(v_prefixed("v1.2.3"), "v1.2.3");
    }

    #[test]
    fn build_run_roundtrips_through_json() {
        let mut hosts = BTreeMap::new();
        hosts.insert(
            "trj".to_string(),
            HostProgress::pending("linux/amd64".parse().unwrap()),
        );
        let run = BuildRun {
            state_version: CURRENT_STATE_VERSION.to_string(),
            run_id: "run-1700000000-42".to_string(),
            tool: "demo".to_string(),
            version: "v1.0.0".to_string(),
            targets: vec!["linux/amd64".parse().unwrap()],
            git_sha: Some("abc123".to_string()),
            git_ref: Some("refs/tags/v1.0.0".to_string()),
            status: RunStatus::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            hosts,
            artifacts: Vec::new(),
        };

        let json = serde_json::to_string_pretty(&run).expect("serialize");
        let back: BuildRun = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.hosts.len(), 1);
        assert_eq!(back.hosts["trj"].status, HostStatus::Pending);
    }

    #[test]
    fn error_kind_serde_uses_stable_idents() {
        let json = serde_json::to_string(&ErrorKind::Timeout("build".into())).expect("serialize");
        assert!(json.contains("\"timeout\""));
        let json = serde_json::to_string(&ErrorKind::Partial).expect("serialize");
        assert!(json.contains("\"partial\""));
    }

    #[test]
    fn duration_helpers_accept_both_forms() {
        #[derive(Serialize, Deserialize)]
        struct D {
            #[serde(
                deserialize_with = "deserialize_duration",
                serialize_with = "serialize_duration"
            )]
            d: Duration,
        }

        let from_string: D = serde_json::from_str(r#"{"d": "5s"}"#).expect("string form");
        assert_eq!(from_string.d, Duration::from_secs(5));

        let from_ms: D = serde_json::from_str(r#"{"d": 1500}"#).expect("millis form");
        assert_eq!(from_ms.d, Duration::from_millis(1500));

        let out = serde_json::to_string(&from_string).expect("serialize");
        assert_eq!(out, r#"{"d":5000}"#);
    }

    proptest::proptest! {
        #[test]
        fn platform_string_roundtrip(
            os in "(linux|darwin|windows)",
            arch in "[a-z0-9_]{1,12}",
        ) {
            let s = format!("{os}/{arch}");
            let p: Platform = s.parse().expect("parse");
            proptest::prop_assert_eq!(p.to_string(), s);
        }
    }

    fn sample_tool(runner_job_map: BTreeMap<String, Option<String>>) -> Tool {
        Tool {
            id: "demo".to_string(),
            repo: "doodlestein/demo".to_string(),
            local_path: PathBuf::from("/src/demo"),
            language: "rust".to_string(),
            build_cmd: "cargo build --release".to_string(),
            binary_name: "demo".to_string(),
            archive_format: ArchiveFormats::default(),
            targets: vec!["linux/amd64".parse().unwrap()],
            workflow: Some(".github/workflows/release.yml".to_string()),
            runner_job_map,
            host_paths: BTreeMap::new(),
            artifact_naming: NamingOverrides::default(),
            install_script_path: None,
            cross_compile: BTreeMap::new(),
            checks: Vec::new(),
            minisign_pubkey: None,
            target_triples: BTreeMap::new(),
            arch_aliases: BTreeMap::new(),
        }
    }
}
