//! Read-only configuration store.
//!
//! Configuration lives in TOML under the config root: `config.toml`
//! (globals), `hosts.toml` (host table + platform map), and one
//! `tools/<id>.toml` per tool. The whole tree is loaded once into an
//! immutable [`ConfigView`]; nothing here ever writes. Persisting edits is
//! the caller's concern.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use shipwright_types::{
    ArchiveFormats, Host, NamingOverrides, OsKind, Platform, Tool, Transport,
};

pub const CONFIG_FILE: &str = "config.toml";
pub const HOSTS_FILE: &str = "hosts.toml";
pub const TOOLS_DIR: &str = "tools";

/// Which artifact-naming pattern is being looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Includes the version; used for release assets.
    Versioned,
    /// Omits the version; expected by legacy installer scripts.
    Compat,
}

/// Filesystem roots, honouring the XDG override environment variables.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_root: PathBuf,
    pub cache_root: PathBuf,
    pub config_root: PathBuf,
}

impl Paths {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            state_root: root_from("SHIPWRIGHT_STATE_DIR", dirs::state_dir)?,
            cache_root: root_from("SHIPWRIGHT_CACHE_DIR", dirs::cache_dir)?,
            config_root: root_from("SHIPWRIGHT_CONFIG_DIR", dirs::config_dir)?,
        })
    }
}

fn root_from(var: &str, fallback: fn() -> Option<PathBuf>) -> Result<PathBuf> {
    if let Ok(v) = env::var(var) {
        let p = PathBuf::from(v.trim());
        if !p.is_absolute() {
            bail!("config_error: {var} must be an absolute path");
        }
        return Ok(p);
    }
    let base = fallback()
        .or_else(dirs::data_local_dir)
        .with_context(|| format!("config_error: no base directory available for {var}"))?;
    Ok(base.join("shipwright"))
}

/// Timeouts for external calls, each overridable through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(
        deserialize_with = "shipwright_types::deserialize_duration",
        serialize_with = "shipwright_types::serialize_duration"
    )]
    #[serde(default = "default_ssh_timeout")]
    pub ssh: Duration,
    #[serde(
        deserialize_with = "shipwright_types::deserialize_duration",
        serialize_with = "shipwright_types::serialize_duration"
    )]
    #[serde(default = "default_build_timeout")]
    pub build: Duration,
    #[serde(
        deserialize_with = "shipwright_types::deserialize_duration",
        serialize_with = "shipwright_types::serialize_duration"
    )]
    #[serde(default = "default_sync_timeout")]
    pub sync: Duration,
}

fn default_ssh_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_build_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ssh: default_ssh_timeout(),
            build: default_build_timeout(),
            sync: default_sync_timeout(),
        }
    }
}

impl Timeouts {
    /// Apply SSH_TIMEOUT / BUILD_TIMEOUT / SYNC_TIMEOUT overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(d) = env_duration("SSH_TIMEOUT") {
            self.ssh = d;
        }
        if let Some(d) = env_duration("BUILD_TIMEOUT") {
            self.build = d;
        }
        if let Some(d) = env_duration("SYNC_TIMEOUT") {
            self.sync = d;
        }
        self
    }
}

fn env_duration(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).ok()
}

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Downstream repositories (owner/name) that receive dispatch events
    /// and checksum updates after a release.
    pub downstream_repos: Vec<String>,
    /// Downstream repositories we do not own: checksum updates open a
    /// review issue there instead of pushing.
    pub external_repos: Vec<String>,
    /// The dispatcher refuses to touch any path under this prefix.
    pub protected_prefix: Option<PathBuf>,
    /// Container-runner emulator binary name.
    pub runner_bin: Option<String>,
    /// Path to the runner emulator's own config file (for the bind-mount
    /// preflight check).
    pub runner_config: Option<PathBuf>,
    pub timeouts: Timeouts,
    /// Global environment exported into every native build.
    pub build_env: BTreeMap<String, String>,
    /// Minisign secret key file name under `<config-root>/secrets/`.
    pub signing_key: Option<String>,
}

/// One entry of `hosts.toml`.
#[derive(Debug, Clone, Deserialize)]
struct HostFile {
    platform: String,
    /// "local" or "ssh".
    connection: String,
    ssh_host: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default = "default_host_concurrency")]
    concurrency: u32,
    description: Option<String>,
}

fn default_host_concurrency() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HostsFile {
    #[serde(default)]
    hosts: BTreeMap<String, HostFile>,
    /// Explicit platform → host overrides, consulted before derivation.
    #[serde(default)]
    platform_map: BTreeMap<String, String>,
}

/// Raw shape of `tools/<id>.toml`. TOML cannot express null map values, so
/// the runner job map uses the literal value `"native"` to mean "build this
/// platform natively".
#[derive(Debug, Clone, Deserialize)]
struct ToolFile {
    repo: String,
    local_path: PathBuf,
    language: String,
    build_cmd: String,
    #[serde(default)]
    binary_name: String,
    #[serde(default)]
    archive_format: ArchiveFormats,
    targets: Vec<String>,
    workflow: Option<String>,
    #[serde(default)]
    act_job_map: BTreeMap<String, String>,
    #[serde(default)]
    host_paths: BTreeMap<String, String>,
    artifact_naming: Option<String>,
    install_script_compat: Option<String>,
    install_script_path: Option<PathBuf>,
    #[serde(default)]
    cross_compile: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    checks: Vec<String>,
    minisign_pubkey: Option<String>,
    #[serde(default)]
    target_triples: BTreeMap<String, String>,
    #[serde(default)]
    arch_aliases: BTreeMap<String, String>,
}

/// Immutable view over the whole configuration tree. Loaded once per
/// process; all lookups borrow from it.
#[derive(Debug, Clone)]
pub struct ConfigView {
    pub paths: Paths,
    pub global: GlobalConfig,
    tools: BTreeMap<String, Tool>,
    hosts: BTreeMap<String, Host>,
    platform_map: BTreeMap<String, String>,
}

impl ConfigView {
    /// Load and validate the configuration tree under `paths.config_root`.
    pub fn load(paths: Paths) -> Result<Self> {
        let root = &paths.config_root;

        let mut global: GlobalConfig = read_toml_or_default(&root.join(CONFIG_FILE))?;
        global.timeouts = global.timeouts.with_env_overrides();
        let hosts_file: HostsFile = read_toml_or_default(&root.join(HOSTS_FILE))?;

        let mut hosts = BTreeMap::new();
        for (id, hf) in &hosts_file.hosts {
            hosts.insert(id.clone(), build_host(id, hf)?);
        }
        validate_local_uniqueness(&hosts)?;

        let mut tools = BTreeMap::new();
        let tools_dir = root.join(TOOLS_DIR);
        if tools_dir.is_dir() {
            for entry in fs::read_dir(&tools_dir)
                .with_context(|| format!("config_error: unreadable {}", tools_dir.display()))?
            {
                let path = entry
                    .with_context(|| format!("config_error: unreadable {}", tools_dir.display()))?
                    .path();
                if path.extension().is_none_or(|e| e != "toml") {
                    continue;
                }
                let id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .with_context(|| format!("config_error: bad tool file name {}", path.display()))?
                    .to_string();
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("config_error: unreadable {}", path.display()))?;
                let tf: ToolFile = toml::from_str(&raw)
                    .with_context(|| format!("config_error: invalid tool config {}", path.display()))?;
                tools.insert(id.clone(), build_tool(&id, tf)?);
            }
        }

        let view = Self {
            paths,
            global,
            tools,
            hosts,
            platform_map: hosts_file.platform_map,
        };
        view.validate()?;
        Ok(view)
    }

    /// A view built from already-typed records; used by tests and embedders.
    pub fn from_parts(
        paths: Paths,
        global: GlobalConfig,
        tools: Vec<Tool>,
        hosts: Vec<Host>,
        platform_map: BTreeMap<String, String>,
    ) -> Result<Self> {
        let view = Self {
            paths,
            global,
            tools: tools.into_iter().map(|t| (t.id.clone(), t)).collect(),
            hosts: hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
            platform_map,
        };
        validate_local_uniqueness(&view.hosts)?;
        view.validate()?;
        Ok(view)
    }

    pub fn tool(&self, id: &str) -> Result<&Tool> {
        self.tools
            .get(id)
            .with_context(|| format!("config_error: unknown tool {id:?}"))
    }

    pub fn host(&self, id: &str) -> Result<&Host> {
        self.hosts
            .get(id)
            .with_context(|| format!("config_error: unknown host {id:?}"))
    }

    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Resolve the host that builds `platform` natively: explicit
    /// `platform_map` override first, then the host table (local transport
    /// preferred).
    pub fn platform_to_host(&self, platform: &Platform) -> Result<&Host> {
        let key = platform.to_string();
        if let Some(id) = self.platform_map.get(&key) {
            return self
                .host(id)
                .with_context(|| format!("config_error: platform_map.{key} names unknown host"));
        }
        let mut candidates: Vec<&Host> = self
            .hosts
            .values()
            .filter(|h| h.platform == *platform)
            .collect();
        candidates.sort_by_key(|h| !h.transport.is_local());
        candidates
            .first()
            .copied()
            .with_context(|| format!("config_error: no host for platform {key}"))
    }

    /// The explicit per-tool naming override, if configured. The full
    /// precedence chain (workflow extraction, release metadata, defaults)
    /// lives with the artifact-naming component.
    pub fn naming_pattern(&self, tool: &str, kind: PatternKind) -> Result<Option<&str>> {
        let t = self.tool(tool)?;
        Ok(match kind {
            PatternKind::Versioned => t.artifact_naming.versioned.as_deref(),
            PatternKind::Compat => t.artifact_naming.compat.as_deref(),
        })
    }

    /// Target triple for (tool, platform): per-tool override, else the
    /// built-in table.
    pub fn target_triple(&self, tool: &str, platform: &Platform) -> Result<String> {
        let t = self.tool(tool)?;
        if let Some(triple) = t.target_triples.get(&platform.to_string()) {
            return Ok(triple.clone());
        }
        builtin_target_triple(platform)
            .map(str::to_string)
            .with_context(|| {
                format!("config_error: no target triple known for platform {platform}")
            })
    }

    /// Arch alias for rendering artifact names; identity when no alias is
    /// configured.
    pub fn arch_alias(&self, tool: &str, arch: &str) -> Result<String> {
        let t = self.tool(tool)?;
        Ok(t.arch_aliases
            .get(arch)
            .cloned()
            .unwrap_or_else(|| arch.to_string()))
    }

    /// Remote source path for a tool on a host: per-tool override, else a
    /// conventional `~/build/<tool>` location (rendered per remote OS by the
    /// sync layer).
    pub fn remote_path(&self, tool: &Tool, host: &Host) -> String {
        tool.host_paths
            .get(&host.id)
            .cloned()
            .unwrap_or_else(|| format!("build/{}", tool.id))
    }

    /// Cross-table invariants from the data model.
    fn validate(&self) -> Result<()> {
        for tool in self.tools.values() {
            let mut needs_native = false;
            for target in &tool.targets {
                if tool.runner_job(target).is_some() {
                    if tool.workflow.is_none() {
                        bail!(
                            "config_error: tool {}: field workflow is required when act_job_map routes {} to the runner",
                            tool.id,
                            target
                        );
                    }
                    continue;
                }
                needs_native = true;
                self.platform_to_host(target).with_context(|| {
                    format!(
                        "config_error: tool {}: target {} has no runner job and no native host",
                        tool.id, target
                    )
                })?;
            }
            if needs_native && tool.binary_name.is_empty() {
                bail!(
                    "config_error: tool {}: field binary_name must be non-empty for native builds",
                    tool.id
                );
            }
        }
        Ok(())
    }
}

fn build_host(id: &str, hf: &HostFile) -> Result<Host> {
    let platform: Platform = hf
        .platform
        .parse()
        .with_context(|| format!("config_error: host {id}: field platform"))?;
    let transport = match hf.connection.as_str() {
        "local" => Transport::Local,
        "ssh" => {
            let alias = hf
                .ssh_host
                .clone()
                .with_context(|| format!("config_error: host {id}: field ssh_host is required for ssh connection"))?;
            Transport::Ssh { alias }
        }
        other => bail!("config_error: host {id}: field connection has unknown value {other:?}"),
    };
    if hf.concurrency == 0 {
        bail!("config_error: host {id}: field concurrency must be >= 1");
    }
    Ok(Host {
        id: id.to_string(),
        platform,
        transport,
        capabilities: hf.capabilities.iter().cloned().collect(),
        concurrency: hf.concurrency,
        description: hf.description.clone(),
    })
}

fn build_tool(id: &str, tf: ToolFile) -> Result<Tool> {
    let mut targets = Vec::with_capacity(tf.targets.len());
    for raw in &tf.targets {
        let p: Platform = raw
            .parse()
            .with_context(|| format!("config_error: tool {id}: field targets"))?;
        targets.push(p);
    }
    if targets.is_empty() {
        bail!("config_error: tool {id}: field targets must not be empty");
    }

    let mut runner_job_map = BTreeMap::new();
    for (platform, job) in &tf.act_job_map {
        platform
            .parse::<Platform>()
            .with_context(|| format!("config_error: tool {id}: field act_job_map key {platform:?}"))?;
        let entry = match job.as_str() {
            "native" | "" => None,
            j => Some(j.to_string()),
        };
        runner_job_map.insert(platform.clone(), entry);
    }

    Ok(Tool {
        id: id.to_string(),
        repo: tf.repo,
        local_path: tf.local_path,
        language: tf.language,
        build_cmd: tf.build_cmd,
        binary_name: tf.binary_name,
        archive_format: tf.archive_format,
        targets,
        workflow: tf.workflow,
        runner_job_map,
        host_paths: tf.host_paths,
        artifact_naming: NamingOverrides {
            versioned: tf.artifact_naming,
            compat: tf.install_script_compat,
        },
        install_script_path: tf.install_script_path,
        cross_compile: tf.cross_compile,
        checks: tf.checks,
        minisign_pubkey: tf.minisign_pubkey,
        target_triples: tf.target_triples,
        arch_aliases: tf.arch_aliases,
    })
}

fn validate_local_uniqueness(hosts: &BTreeMap<String, Host>) -> Result<()> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for host in hosts.values() {
        if host.transport.is_local() {
            let key = host.platform.to_string();
            if let Some(prev) = seen.insert(key.clone(), &host.id) {
                bail!(
                    "config_error: hosts {prev} and {} are both local for platform {key}",
                    host.id
                );
            }
        }
    }
    Ok(())
}

fn read_toml_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("config_error: unreadable {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("config_error: invalid TOML {}", path.display()))
}

/// Built-in platform → target-triple table. Per-tool `target_triples`
/// entries override it.
pub fn builtin_target_triple(platform: &Platform) -> Option<&'static str> {
    Some(match (platform.os, platform.arch.as_str()) {
        (OsKind::Linux, "amd64" | "x86_64") => "x86_64-unknown-linux-gnu",
        (OsKind::Linux, "arm64" | "aarch64") => "aarch64-unknown-linux-gnu",
        (OsKind::Darwin, "amd64" | "x86_64") => "x86_64-apple-darwin",
        (OsKind::Darwin, "arm64" | "aarch64") => "aarch64-apple-darwin",
        (OsKind::Windows, "amd64" | "x86_64") => "x86_64-pc-windows-msvc",
        (OsKind::Windows, "arm64" | "aarch64") => "aarch64-pc-windows-msvc",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn write_fixture(root: &Path) {
        fs::create_dir_all(root.join(TOOLS_DIR)).expect("mkdir tools");
        fs::write(
            root.join(CONFIG_FILE),
            r#"
downstream_repos = ["doodlestein/homebrew-tap"]
runner_bin = "act"

[timeouts]
ssh = "10s"
"#,
        )
        .expect("write config.toml");
        fs::write(
            root.join(HOSTS_FILE),
            r#"
[hosts.trj]
platform = "linux/amd64"
connection = "local"
capabilities = ["rust", "docker", "runner"]
concurrency = 2

[hosts.mmini]
platform = "darwin/arm64"
connection = "ssh"
ssh_host = "mmini"
capabilities = ["rust", "go"]
concurrency = 1
description = "mac mini in the closet"

[platform_map]
"darwin/amd64" = "mmini"
"#,
        )
        .expect("write hosts.toml");
        fs::write(
            root.join(TOOLS_DIR).join("demo.toml"),
            r#"
repo = "doodlestein/demo"
local_path = "/src/demo"
language = "rust"
build_cmd = "cargo build --release"
binary_name = "demo"
targets = ["linux/amd64", "darwin/arm64"]
workflow = ".github/workflows/release.yml"

[act_job_map]
"linux/amd64" = "build-linux"
"darwin/arm64" = "native"

[archive_format]
linux = "tar.gz"
darwin = "tar.gz"

[arch_aliases]
amd64 = "x86_64"
"#,
        )
        .expect("write demo.toml");
    }

    fn test_paths(root: &Path) -> Paths {
        Paths {
            state_root: root.join("state"),
            cache_root: root.join("cache"),
            config_root: root.to_path_buf(),
        }
    }

    #[test]
    fn loads_full_fixture() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());

        let view = ConfigView::load(test_paths(td.path())).expect("load");
        let tool = view.tool("demo").expect("tool");
        assert_eq!(tool.repo, "doodlestein/demo");
        assert_eq!(tool.targets.len(), 2);
        assert_eq!(
            tool.runner_job(&"linux/amd64".parse().unwrap()),
            Some("build-linux")
        );
        assert_eq!(tool.runner_job(&"darwin/arm64".parse().unwrap()), None);

        let host = view.host("mmini").expect("host");
        assert!(matches!(&host.transport, Transport::Ssh { alias } if alias == "mmini"));
        assert_eq!(view.global.timeouts.ssh, Duration::from_secs(10));
    }

    #[test]
    fn unknown_tool_is_config_error() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        let err = view.tool("nope").unwrap_err();
        assert!(err.to_string().contains("config_error"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn platform_map_override_wins() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        // darwin/amd64 has no matching host but an explicit mapping.
        let host = view
            .platform_to_host(&"darwin/amd64".parse().unwrap())
            .expect("mapped host");
        assert_eq!(host.id, "mmini");
    }

    #[test]
    fn platform_derivation_prefers_local() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        let host = view
            .platform_to_host(&"linux/amd64".parse().unwrap())
            .expect("derived host");
        assert_eq!(host.id, "trj");
    }

    #[test]
    fn unmapped_platform_is_config_error() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        let err = view
            .platform_to_host(&"windows/amd64".parse().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("no host for platform"));
    }

    #[test]
    fn missing_ssh_host_names_the_field() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        fs::write(
            td.path().join(HOSTS_FILE),
            r#"
[hosts.broken]
platform = "darwin/arm64"
connection = "ssh"
"#,
        )
        .expect("overwrite hosts.toml");

        let err = ConfigView::load(test_paths(td.path())).unwrap_err();
        assert!(format!("{err:#}").contains("field ssh_host"));
    }

    #[test]
    fn native_target_without_host_is_rejected() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        fs::write(
            td.path().join(TOOLS_DIR).join("demo.toml"),
            r#"
repo = "doodlestein/demo"
local_path = "/src/demo"
language = "rust"
build_cmd = "cargo build --release"
binary_name = "demo"
targets = ["windows/amd64"]
"#,
        )
        .expect("overwrite demo.toml");

        let err = ConfigView::load(test_paths(td.path())).unwrap_err();
        assert!(format!("{err:#}").contains("no runner job and no native host"));
    }

    #[test]
    fn empty_binary_name_rejected_for_native_builds() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        fs::write(
            td.path().join(TOOLS_DIR).join("demo.toml"),
            r#"
repo = "doodlestein/demo"
local_path = "/src/demo"
language = "rust"
build_cmd = "cargo build --release"
targets = ["darwin/arm64"]
"#,
        )
        .expect("overwrite demo.toml");

        let err = ConfigView::load(test_paths(td.path())).unwrap_err();
        assert!(format!("{err:#}").contains("binary_name"));
    }

    #[test]
    fn two_local_hosts_per_platform_rejected() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        fs::write(
            td.path().join(HOSTS_FILE),
            r#"
[hosts.one]
platform = "linux/amd64"
connection = "local"

[hosts.two]
platform = "linux/amd64"
connection = "local"
"#,
        )
        .expect("overwrite hosts.toml");

        let err = ConfigView::load(test_paths(td.path())).unwrap_err();
        assert!(format!("{err:#}").contains("both local"));
    }

    #[test]
    fn target_triple_uses_builtin_table() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        assert_eq!(
            view.target_triple("demo", &"linux/amd64".parse().unwrap())
                .expect("triple"),
            "x86_64-unknown-linux-gnu"
        );
        assert_eq!(
            view.target_triple("demo", &"darwin/arm64".parse().unwrap())
                .expect("triple"),
            "aarch64-apple-darwin"
        );
    }

    #[test]
    fn arch_alias_falls_back_to_identity() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        assert_eq!(view.arch_alias("demo", "amd64").expect("alias"), "x86_64");
        assert_eq!(view.arch_alias("demo", "arm64").expect("alias"), "arm64");
    }

    #[test]
    fn remote_path_override_and_default() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        let view = ConfigView::load(test_paths(td.path())).expect("load");
        let tool = view.tool("demo").expect("tool").clone();
        let host = view.host("mmini").expect("host").clone();

        assert_eq!(view.remote_path(&tool, &host), "build/demo");

        let mut with_override = tool.clone();
        with_override
            .host_paths
            .insert("mmini".to_string(), "/Users/ci/demo".to_string());
        assert_eq!(view.remote_path(&with_override, &host), "/Users/ci/demo");
    }

    #[test]
    fn missing_config_files_yield_defaults() {
        let td = tempdir().expect("tempdir");
        let view = ConfigView::load(test_paths(td.path())).expect("load empty tree");
        assert!(view.global.downstream_repos.is_empty());
        assert_eq!(view.tool_ids().count(), 0);
    }

    #[test]
    fn naming_pattern_returns_explicit_override_only() {
        let td = tempdir().expect("tempdir");
        write_fixture(td.path());
        fs::write(
            td.path().join(TOOLS_DIR).join("demo.toml"),
            r#"
repo = "doodlestein/demo"
local_path = "/src/demo"
language = "rust"
build_cmd = "cargo build --release"
binary_name = "demo"
targets = ["linux/amd64"]
workflow = "wf.yml"
artifact_naming = "${name}_${version}_${os}_${arch}"

[act_job_map]
"linux/amd64" = "build-linux"
"#,
        )
        .expect("overwrite demo.toml");
        let view = ConfigView::load(test_paths(td.path())).expect("load");

        assert_eq!(
            view.naming_pattern("demo", PatternKind::Versioned).expect("lookup"),
            Some("${name}_${version}_${os}_${arch}")
        );
        assert_eq!(view.naming_pattern("demo", PatternKind::Compat).expect("lookup"), None);
    }
}
