//! Release manifest, checksums, signatures, and attestation.
//!
//! The manifest is the sole authoritative description of a release;
//! `SHA256SUMS`, detached signatures, SBOMs, and provenance statements are
//! derived from it. Hashing shells out to the platform's checksum tool
//! (`sha256sum`, falling back to `shasum -a 256`), detected once per
//! process; signing shells out to minisign.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;

use shipwright_config::ConfigView;
use shipwright_types::{
    ArchiveKind, ArtifactRecord, BuildRun, CURRENT_MANIFEST_VERSION, ErrorKind, HostStatus,
    ReleaseManifest, RunStatus, Tool, v_prefixed,
};

use crate::logger::Logger;
use crate::process::{self, RunSpec};
use crate::state::atomic_write_json;

pub const CHECKSUMS_FILE: &str = "SHA256SUMS";
pub const SECRETS_DIR: &str = "secrets";
const HASH_TIMEOUT: Duration = Duration::from_secs(120);
const SIGN_TIMEOUT: Duration = Duration::from_secs(60);

/// The checksum tool available on this system, probed once.
fn sha256_tool() -> Result<&'static [&'static str]> {
    static TOOL: OnceLock<Option<&'static [&'static str]>> = OnceLock::new();
    let detected = *TOOL.get_or_init(|| {
        if which::which("sha256sum").is_ok() {
            Some(&["sha256sum"][..])
        } else if which::which("shasum").is_ok() {
            Some(&["shasum", "-a", "256"][..])
        } else {
            None
        }
    });
    detected.ok_or_else(|| {
        anyhow::Error::new(ErrorKind::DependencyMissing(
            "neither sha256sum nor shasum is available".into(),
        ))
    })
}

/// SHA-256 of a file, in lowercase hex, via the external tool.
pub fn sha256_file(path: &Path) -> Result<String> {
    let argv = sha256_tool()?;
    let mut args: Vec<String> = argv[1..].iter().map(|s| s.to_string()).collect();
    args.push(path.display().to_string());
    let out = process::run(&RunSpec::new(argv[0], args).timeout(HASH_TIMEOUT))?;
    if !out.success() {
        bail!("{} exited {} for {}", argv[0], out.exit_code, path.display());
    }
    out.stdout
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .with_context(|| format!("empty checksum output for {}", path.display()))
}

/// Ensure `<config-root>/secrets/` exists with mode 0700 and return the
/// signing key path, enforcing 0600 on it.
pub fn signing_key_path(config: &ConfigView) -> Result<PathBuf> {
    let key_name = config
        .global
        .signing_key
        .as_deref()
        .context("config_error: field signing_key is not set")?;
    let dir = config.paths.config_root.join(SECRETS_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to chmod {}", dir.display()))?;
    }
    let key = dir.join(key_name);
    if !key.exists() {
        bail!("signing key {} does not exist", key.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = key.metadata()?.permissions().mode() & 0o777;
        if mode != 0o600 {
            fs::set_permissions(&key, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to chmod {}", key.display()))?;
        }
    }
    Ok(key)
}

/// Produce `<artifact>.minisig` beside the artifact.
pub fn sign_artifact(config: &ConfigView, artifact: &Path) -> Result<PathBuf> {
    let bin = minisign_bin();
    which::which(&bin).map_err(|_| {
        anyhow::Error::new(ErrorKind::DependencyMissing(format!(
            "{bin} not found on PATH"
        )))
    })?;
    let key = signing_key_path(config)?;
    let sig_path = sig_path_for(artifact);
    let out = process::run(
        &RunSpec::new(
            bin.as_str(),
            [
                "-S".to_string(),
                "-s".to_string(),
                key.display().to_string(),
                "-m".to_string(),
                artifact.display().to_string(),
                "-x".to_string(),
                sig_path.display().to_string(),
            ],
        )
        .timeout(SIGN_TIMEOUT),
    )?;
    if !out.success() {
        bail!(
            "minisign exited {} signing {}",
            out.exit_code,
            artifact.display()
        );
    }
    Ok(sig_path)
}

/// Verify a detached signature with the paired public key.
pub fn verify_signature(pubkey: &str, artifact: &Path) -> Result<()> {
    let bin = minisign_bin();
    let out = process::run(
        &RunSpec::new(
            bin.as_str(),
            [
                "-V".to_string(),
                "-P".to_string(),
                pubkey.to_string(),
                "-m".to_string(),
                artifact.display().to_string(),
                "-x".to_string(),
                sig_path_for(artifact).display().to_string(),
            ],
        )
        .timeout(SIGN_TIMEOUT),
    )?;
    if !out.success() {
        bail!("signature verification failed for {}", artifact.display());
    }
    Ok(())
}

fn sig_path_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".minisig");
    PathBuf::from(name)
}

/// Assemble the manifest for a finished run. Only successful artifacts
/// appear; a partial run yields a partial manifest.
pub fn build_manifest(
    config: &ConfigView,
    logger: &Logger,
    run: &BuildRun,
    sign: bool,
) -> Result<ReleaseManifest> {
    let log = logger.scoped(Some(&run.tool), None, Some("manifest"));
    let mut artifacts = Vec::new();

    for (host_id, progress) in &run.hosts {
        if progress.status != HostStatus::Completed {
            continue;
        }
        let Some(path) = &progress.artifact_path else {
            continue;
        };
        if !path.exists() {
            log.warn(&format!(
                "host {host_id} reports artifact {} but it is missing",
                path.display()
            ));
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact {} has no file name", path.display()))?
            .to_string();
        let sha256 = sha256_file(path)?;
        let size_bytes = path.metadata()?.len();

        let signature_path = if sign {
            Some(sign_artifact(config, path)?)
        } else {
            None
        };
        let sbom_path = Some(write_sbom(&run.tool, &run.version, path, &sha256)?);
        let provenance_path = Some(write_provenance(run, path, &sha256)?);

        artifacts.push(ArtifactRecord {
            name,
            platform: progress.platform.clone(),
            path: path.clone(),
            sha256,
            size_bytes,
            format: ArchiveKind::detect(&path.to_string_lossy()),
            signature_path,
            sbom_path,
            provenance_path,
        });
    }

    let duration_ms = run
        .updated_at
        .signed_duration_since(run.created_at)
        .num_milliseconds()
        .max(0) as u64;

    Ok(ReleaseManifest {
        manifest_version: CURRENT_MANIFEST_VERSION.to_string(),
        tool: run.tool.clone(),
        version: v_prefixed(&run.version),
        run_id: run.run_id.clone(),
        git_sha: run.git_sha.clone(),
        git_ref: run.git_ref.clone(),
        built_at: Utc::now(),
        duration_ms,
        status: run.status,
        artifacts,
    })
}

/// Persist a manifest next to the run's artifacts.
pub fn write_manifest(manifest: &ReleaseManifest, path: &Path) -> Result<()> {
    atomic_write_json(path, manifest)
}

/// Write `SHA256SUMS` in the portable two-space format.
pub fn write_checksums(manifest: &ReleaseManifest, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(CHECKSUMS_FILE);
    let mut content = String::new();
    for artifact in &manifest.artifacts {
        content.push_str(&format!("{}  {}\n", artifact.sha256, artifact.name));
    }
    fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Re-hash every artifact and compare with the manifest.
pub fn verify_manifest(manifest: &ReleaseManifest) -> Result<()> {
    for artifact in &manifest.artifacts {
        let actual = sha256_file(&artifact.path)?;
        if actual != artifact.sha256 {
            bail!(
                "checksum mismatch for {}: manifest {} vs disk {}",
                artifact.name,
                artifact.sha256,
                actual
            );
        }
    }
    Ok(())
}

/// Minimal CycloneDX SBOM naming the artifact and its digest.
fn write_sbom(tool: &str, version: &str, artifact: &Path, sha256: &str) -> Result<PathBuf> {
    let path = sibling(artifact, ".cdx.json");
    let bom = json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.5",
        "version": 1,
        "metadata": {
            "timestamp": Utc::now().to_rfc3339(),
            "component": {
                "type": "application",
                "name": tool,
                "version": version.trim_start_matches('v'),
            }
        },
        "components": [{
            "type": "file",
            "name": artifact.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            "hashes": [{"alg": "SHA-256", "content": sha256}],
        }],
    });
    atomic_write_json(&path, &bom)?;
    Ok(path)
}

/// SLSA v1 provenance statement for one artifact.
fn write_provenance(run: &BuildRun, artifact: &Path, sha256: &str) -> Result<PathBuf> {
    let path = sibling(artifact, ".provenance.json");
    let statement = json!({
        "_type": "https://in-toto.io/Statement/v1",
        "subject": [{
            "name": artifact.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            "digest": {"sha256": sha256},
        }],
        "predicateType": "https://slsa.dev/provenance/v1",
        "predicate": {
            "buildDefinition": {
                "buildType": "https://github.com/doodlestein/shipwright",
                "externalParameters": {
                    "tool": run.tool,
                    "version": run.version,
                    "gitSha": run.git_sha,
                    "gitRef": run.git_ref,
                },
            },
            "runDetails": {
                "builder": {"id": format!("shipwright/{}", env!("CARGO_PKG_VERSION"))},
                "metadata": {
                    "invocationId": run.run_id,
                    "startedOn": run.created_at.to_rfc3339(),
                },
            },
        },
    });
    atomic_write_json(&path, &statement)?;
    Ok(path)
}

fn sibling(artifact: &Path, suffix: &str) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn minisign_bin() -> String {
    std::env::var("SHIPWRIGHT_MINISIGN_BIN").unwrap_or_else(|_| "minisign".to_string())
}
