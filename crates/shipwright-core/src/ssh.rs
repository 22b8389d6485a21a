//! Native build driver.
//!
//! Executes a tool's build command on the host a platform maps to
//! (usually over SSH, directly for a local host), then fetches the
//! produced binary into the run's artifact directory by SCP. The remote
//! command is the one composed string in the system: `cd` + environment
//! exports + the configured build command, in POSIX or `cmd` grammar
//! depending on the remote OS.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shipwright_config::ConfigView;
use shipwright_types::{ErrorKind, Host, OsKind, Platform, Tool, Transport};

use crate::logger::Logger;
use crate::process::{self, RunSpec, TIMEOUT_EXIT_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeStatus {
    Success,
    Timeout,
    Failed,
    /// Build succeeded but the artifact could not be fetched.
    ArtifactFailure,
}

/// Structured result of one native build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeResult {
    pub run_id: String,
    pub tool: String,
    pub platform: Platform,
    pub host: String,
    pub status: NativeStatus,
    pub exit_code: i32,
    pub duration_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
}

impl NativeResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            NativeStatus::Success => None,
            NativeStatus::Timeout => Some(ErrorKind::Timeout(format!(
                "native build on {} timed out",
                self.host
            ))),
            NativeStatus::Failed => Some(ErrorKind::BuildFailure(format!(
                "native build on {} exited {}",
                self.host, self.exit_code
            ))),
            NativeStatus::ArtifactFailure => Some(ErrorKind::ArtifactFailure(format!(
                "scp from {} failed",
                self.host
            ))),
        }
    }
}

/// Build `tool` for `platform` on its mapped native host and fetch the
/// artifact into `artifact_dir`.
pub fn run_native(
    config: &ConfigView,
    logger: &Logger,
    tool: &Tool,
    platform: &Platform,
    version: &str,
    run_id: &str,
    artifact_dir: &Path,
) -> Result<NativeResult> {
    let host = config
        .platform_to_host(platform)
        .with_context(|| format!("config_error: tool {} has no native host for {platform}", tool.id))?;
    let log = logger.scoped(Some(&tool.id), Some(&host.id), Some("native"));
    log.info(&format!("building {} {version} for {platform}", tool.id));

    let env_block = build_env(config, tool, platform);
    let timeout = config.global.timeouts.build;
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;

    let out = match &host.transport {
        Transport::Ssh { alias } => {
            let remote_path = config.remote_path(tool, host);
            let command = compose_build_command(
                host.platform.os,
                &remote_path,
                &env_block,
                &tool.build_cmd,
            );
            log.debug(&format!("remote build: {command}"));
            let program = ssh_program();
            process::run(
                &RunSpec::new(program.as_str(), ssh_args(alias, &command)).timeout(timeout),
            )?
        }
        Transport::Local => {
            // The controller is the native host; run the build in place.
            let mut spec = RunSpec::new("sh", ["-c", &tool.build_cmd])
                .cwd(&tool.local_path)
                .timeout(timeout);
            for (k, v) in &env_block {
                spec = spec.env(k, v);
            }
            process::run(&spec)?
        }
    };

    let duration_seconds = out.duration.as_secs();
    let base = NativeResult {
        run_id: run_id.to_string(),
        tool: tool.id.clone(),
        platform: platform.clone(),
        host: host.id.clone(),
        status: NativeStatus::Failed,
        exit_code: out.exit_code,
        duration_seconds,
        artifact_path: None,
    };

    if out.exit_code == TIMEOUT_EXIT_CODE {
        log.error("build timed out");
        return Ok(NativeResult {
            status: NativeStatus::Timeout,
            ..base
        });
    }
    if out.exit_code != 0 {
        log.error(&format!("build exited {}", out.exit_code));
        return Ok(NativeResult {
            status: NativeStatus::Failed,
            ..base
        });
    }

    // Successful build; now collect the artifact.
    let dest = artifact_dir.join(format!(
        "{}{}",
        tool.binary_name,
        host.platform.os.exe_suffix()
    ));
    let fetched = match &host.transport {
        Transport::Ssh { alias } => {
            let remote_path = config.remote_path(tool, host);
            let remote_artifact =
                remote_artifact_path(&tool.language, &remote_path, &tool.binary_name, host.platform.os);
            // Give the remote filesystem a moment to flush the binary.
            std::thread::sleep(settle_delay());
            scp_fetch(alias, &remote_artifact, &dest)
        }
        Transport::Local => {
            let source = local_artifact_path(tool);
            fs::copy(&source, &dest).map(|_| ()).with_context(|| {
                format!("failed to copy artifact from {}", source.display())
            })
        }
    };

    match fetched {
        Ok(()) => {
            log.info(&format!("artifact collected: {}", dest.display()));
            Ok(NativeResult {
                status: NativeStatus::Success,
                artifact_path: Some(dest),
                ..base
            })
        }
        Err(e) => {
            log.error(&format!("artifact fetch failed: {e:#}"));
            Ok(NativeResult {
                status: NativeStatus::ArtifactFailure,
                artifact_path: None,
                ..base
            })
        }
    }
}

/// Global build environment overlaid with the platform's cross-compile
/// block.
fn build_env(config: &ConfigView, tool: &Tool, platform: &Platform) -> BTreeMap<String, String> {
    let mut env = config.global.build_env.clone();
    if let Some(cross) = tool.cross_compile.get(&platform.to_string()) {
        env.extend(cross.clone());
    }
    env
}

/// `<cd> && <env> && <build_cmd>` in the remote OS's grammar.
fn compose_build_command(
    os: OsKind,
    remote_path: &str,
    env: &BTreeMap<String, String>,
    build_cmd: &str,
) -> String {
    match os {
        OsKind::Windows => {
            let mut parts = vec![format!("cd /d {}", remote_path.replace('/', "\\"))];
            for (k, v) in env {
                parts.push(format!("set \"{k}={v}\""));
            }
            parts.push(build_cmd.to_string());
            parts.join(" && ")
        }
        _ => {
            let mut command = format!("cd {}", shell_quote(remote_path));
            if !env.is_empty() {
                let exports: Vec<String> = env
                    .iter()
                    .map(|(k, v)| format!("{k}={}", shell_quote(v)))
                    .collect();
                command.push_str(&format!(" && export {}", exports.join(" ")));
            }
            command.push_str(&format!(" && {build_cmd}"));
            command
        }
    }
}

/// Where the build leaves its binary, by language tag.
fn remote_artifact_path(language: &str, remote_path: &str, binary: &str, os: OsKind) -> String {
    let suffix = os.exe_suffix();
    match language {
        "rust" => format!("{remote_path}/target/release/{binary}{suffix}"),
        _ => format!("{remote_path}/{binary}{suffix}"),
    }
}

fn local_artifact_path(tool: &Tool) -> PathBuf {
    let os = OsKind::Linux;
    match tool.language.as_str() {
        "rust" => tool
            .local_path
            .join("target/release")
            .join(format!("{}{}", tool.binary_name, os.exe_suffix())),
        _ => tool.local_path.join(&tool.binary_name),
    }
}

/// Fetch one file by SCP. The source is passed as a single
/// `host:path` argument with no embedded quotes, so the remote path is
/// never re-interpreted by a shell.
fn scp_fetch(alias: &str, remote_artifact: &str, dest: &Path) -> Result<()> {
    let program = scp_program();
    let out = process::run(
        &RunSpec::new(
            program.as_str(),
            [
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                format!("{alias}:{remote_artifact}"),
                dest.display().to_string(),
            ],
        )
        .timeout(Duration::from_secs(300)),
    )?;
    if !out.success() {
        anyhow::bail!("scp exited {}", out.exit_code);
    }
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn settle_delay() -> Duration {
    env::var("SHIPWRIGHT_SCP_SETTLE_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(2))
}

fn ssh_program() -> String {
    env::var("SHIPWRIGHT_SSH_BIN").unwrap_or_else(|_| "ssh".to_string())
}

fn scp_program() -> String {
    env::var("SHIPWRIGHT_SCP_BIN").unwrap_or_else(|_| "scp".to_string())
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;

    use serial_test::serial;
    use tempfile::tempdir;

    use shipwright_config::{GlobalConfig, Paths};
    use shipwright_types::{ArchiveFormats, NamingOverrides};

    use crate::logger::{LogLevel, Logger};

    use super::*;

    fn executable(path: &Path, script: &str) {
        fs::write(path, script).expect("write script");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    fn demo_tool(local_path: &Path) -> Tool {
        Tool {
            id: "demo".into(),
            repo: "doodlestein/demo".into(),
            local_path: local_path.to_path_buf(),
            language: "rust".into(),
            build_cmd: "cargo build --release".into(),
            binary_name: "demo".into(),
            archive_format: ArchiveFormats::default(),
            targets: vec!["darwin/arm64".parse().unwrap()],
            workflow: None,
            runner_job_map: BTreeMap::new(),
            host_paths: BTreeMap::new(),
            artifact_naming: NamingOverrides::default(),
            install_script_path: None,
            cross_compile: BTreeMap::from([(
                "darwin/arm64".to_string(),
                BTreeMap::from([("MACOSX_DEPLOYMENT_TARGET".to_string(), "11.0".to_string())]),
            )]),
            checks: vec![],
            minisign_pubkey: None,
            target_triples: BTreeMap::new(),
            arch_aliases: BTreeMap::new(),
        }
    }

    fn darwin_view(root: &Path) -> ConfigView {
        let paths = Paths {
            state_root: root.join("state"),
            cache_root: root.join("cache"),
            config_root: root.join("config"),
        };
        let host = Host {
            id: "mmini".into(),
            platform: "darwin/arm64".parse().unwrap(),
            transport: Transport::Ssh {
                alias: "mmini".into(),
            },
            capabilities: BTreeSet::from(["rust".to_string()]),
            concurrency: 1,
            description: None,
        };
        ConfigView::from_parts(
            paths,
            GlobalConfig::default(),
            vec![demo_tool(root)],
            vec![host],
            BTreeMap::new(),
        )
        .expect("config")
    }

    #[test]
    fn unix_command_composes_cd_env_build() {
        let env = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "two words".to_string()),
        ]);
        let cmd = compose_build_command(OsKind::Darwin, "build/demo", &env, "make release");
        assert_eq!(
            cmd,
            "cd 'build/demo' && export A='1' B='two words' && make release"
        );
    }

    #[test]
    fn windows_command_uses_cmd_grammar() {
        let env = BTreeMap::from([("GOOS".to_string(), "windows".to_string())]);
        let cmd = compose_build_command(OsKind::Windows, "build/demo", &env, "make release");
        assert_eq!(
            cmd,
            "cd /d build\\demo && set \"GOOS=windows\" && make release"
        );
    }

    #[test]
    fn artifact_paths_follow_language_and_os() {
        assert_eq!(
            remote_artifact_path("rust", "build/demo", "demo", OsKind::Darwin),
            "build/demo/target/release/demo"
        );
        assert_eq!(
            remote_artifact_path("go", "build/demo", "demo", OsKind::Windows),
            "build/demo/demo.exe"
        );
        assert_eq!(
            remote_artifact_path("zig", "build/demo", "demo", OsKind::Linux),
            "build/demo/demo"
        );
    }

    #[test]
    #[serial]
    fn successful_build_and_scp_yields_artifact() {
        let td = tempdir().expect("tempdir");
        let ssh = td.path().join("fake-ssh");
        executable(&ssh, "#!/bin/sh\nexit 0\n");
        let scp = td.path().join("fake-scp");
        // scp <opts> source dest: emulate the fetch by writing the dest.
        executable(
            &scp,
            "#!/bin/sh\nfor dest in \"$@\"; do :; done\necho binary > \"$dest\"\n",
        );

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_SSH_BIN", Some(ssh.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_BIN", Some(scp.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
            ],
            || {
                let config = darwin_view(td.path());
                let tool = config.tool("demo").expect("tool").clone();
                let logger = Logger::stderr_only(LogLevel::Error);
                let artifact_dir = td.path().join("artifacts");

                let result = run_native(
                    &config,
                    &logger,
                    &tool,
                    &"darwin/arm64".parse().unwrap(),
                    "v1.0.0",
                    "run-1-1",
                    &artifact_dir,
                )
                .expect("run");

                assert_eq!(result.status, NativeStatus::Success);
                let artifact = result.artifact_path.expect("artifact");
                assert_eq!(artifact, artifact_dir.join("demo"));
                assert!(artifact.exists());
            },
        );
    }

    #[test]
    #[serial]
    fn scp_failure_becomes_artifact_failure() {
        let td = tempdir().expect("tempdir");
        let ssh = td.path().join("fake-ssh");
        executable(&ssh, "#!/bin/sh\nexit 0\n");
        let scp = td.path().join("fake-scp");
        executable(&scp, "#!/bin/sh\nexit 1\n");

        temp_env::with_vars(
            [
                ("SHIPWRIGHT_SSH_BIN", Some(ssh.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_BIN", Some(scp.to_str().unwrap())),
                ("SHIPWRIGHT_SCP_SETTLE_MS", Some("0")),
            ],
            || {
                let config = darwin_view(td.path());
                let tool = config.tool("demo").expect("tool").clone();
                let logger = Logger::stderr_only(LogLevel::Error);

                let result = run_native(
                    &config,
                    &logger,
                    &tool,
                    &"darwin/arm64".parse().unwrap(),
                    "v1.0.0",
                    "run-1-1",
                    &td.path().join("artifacts"),
                )
                .expect("run");

                assert_eq!(result.status, NativeStatus::ArtifactFailure);
                assert!(result.artifact_path.is_none());
                let kind = result.error_kind().expect("kind");
                assert!(matches!(kind, ErrorKind::ArtifactFailure(_)));
                assert_eq!(kind.exit_code(), 7);
            },
        );
    }

    #[test]
    #[serial]
    fn failed_remote_build_is_build_failure() {
        let td = tempdir().expect("tempdir");
        let ssh = td.path().join("fake-ssh");
        executable(&ssh, "#!/bin/sh\nexit 2\n");

        temp_env::with_var("SHIPWRIGHT_SSH_BIN", Some(ssh.to_str().unwrap()), || {
            let config = darwin_view(td.path());
            let tool = config.tool("demo").expect("tool").clone();
            let logger = Logger::stderr_only(LogLevel::Error);

            let result = run_native(
                &config,
                &logger,
                &tool,
                &"darwin/arm64".parse().unwrap(),
                "v1.0.0",
                "run-1-1",
                &td.path().join("artifacts"),
            )
            .expect("run");

            assert_eq!(result.status, NativeStatus::Failed);
            assert_eq!(result.exit_code, 2);
            assert_eq!(result.error_kind().expect("kind").exit_code(), 6);
        });
    }

    #[test]
    fn unmapped_platform_is_a_config_error() {
        let td = tempdir().expect("tempdir");
        let config = darwin_view(td.path());
        let tool = config.tool("demo").expect("tool").clone();
        let logger = Logger::stderr_only(LogLevel::Error);

        let err = run_native(
            &config,
            &logger,
            &tool,
            &"windows/amd64".parse().unwrap(),
            "v1.0.0",
            "run-1-1",
            &td.path().join("artifacts"),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("config_error"));
    }

    #[test]
    fn cross_compile_env_overlays_global() {
        let td = tempdir().expect("tempdir");
        let config = darwin_view(td.path());
        let tool = config.tool("demo").expect("tool");

        let env = build_env(&config, tool, &"darwin/arm64".parse().unwrap());
        assert_eq!(env.get("MACOSX_DEPLOYMENT_TARGET").map(String::as_str), Some("11.0"));
        let env = build_env(&config, tool, &"linux/amd64".parse().unwrap());
        assert!(env.is_empty());
    }
}
