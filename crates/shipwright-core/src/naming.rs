//! Artifact name templates.
//!
//! Two patterns per tool: a versioned one for release assets and a
//! version-less compat one that legacy installer scripts hard-code.
//! Patterns are templates over `${name} ${version} ${os} ${arch} ${target}
//! ${target_triple} ${ext}`; foreign dialects (GitHub-Actions
//! interpolation, shell expansion, goreleaser templates) are normalised
//! into that canonical form before use.

use std::fs;

use anyhow::Result;

use shipwright_config::{ConfigView, PatternKind};
use shipwright_types::{OsKind, Platform, Tool};

/// Default versioned pattern.
pub const DEFAULT_VERSIONED: &str = "${name}-${version}-${os}-${arch}";
/// Default compat pattern.
pub const DEFAULT_COMPAT: &str = "${name}-${os}-${arch}";

/// Extensions recognised when deciding whether a rendered name already
/// carries one.
const KNOWN_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz", ".tar.xz", ".tar.bz2", ".zip", ".exe"];

/// Values substituted into a pattern.
#[derive(Debug, Clone, Default)]
pub struct NameVars {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub target: String,
    pub target_triple: String,
    pub ext: String,
}

impl NameVars {
    fn get(&self, var: &str) -> Option<&str> {
        Some(match var {
            "name" => &self.name,
            "version" => &self.version,
            "os" => &self.os,
            "arch" => &self.arch,
            "target" => &self.target,
            "target_triple" => &self.target_triple,
            "ext" => &self.ext,
            _ => return None,
        })
    }
}

/// Build the variable set for one (tool, platform), applying the tool's
/// arch alias table.
pub fn vars_for(
    config: &ConfigView,
    tool: &Tool,
    platform: &Platform,
    version: &str,
) -> Result<NameVars> {
    let arch = config.arch_alias(&tool.id, &platform.arch)?;
    let ext = tool
        .archive_format
        .for_os(platform.os)
        .unwrap_or_else(|| platform.os.default_archive_ext())
        .to_string();
    Ok(NameVars {
        name: tool.id.clone(),
        version: version.trim_start_matches('v').to_string(),
        os: platform.os.to_string(),
        arch,
        target: platform.to_string(),
        target_triple: config.target_triple(&tool.id, platform)?,
        ext,
    })
}

/// Substitute `${var}` placeholders, then append the extension unless the
/// result already ends in a recognised one. Appending is idempotent.
pub fn render(pattern: &str, vars: &NameVars) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match vars.get(var) {
                    Some(value) => out.push_str(value),
                    // Unknown placeholders pass through untouched.
                    None => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(rest);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    if !vars.ext.is_empty() && !has_known_extension(&out) {
        out.push('.');
        out.push_str(vars.ext.trim_start_matches('.'));
    }
    out
}

fn has_known_extension(name: &str) -> bool {
    KNOWN_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Normalise foreign template dialects into `${var}` form. Handles
/// GitHub-Actions `${{ … }}`, goreleaser `{{ .Var }}`, and plain shell
/// `$VAR` / `${VAR}` uppercase expansion.
pub fn normalise_template(raw: &str) -> String {
    let mut out = raw.trim().trim_matches('"').trim_matches('\'').to_string();

    // GitHub-Actions: ${{ matrix.target }}, ${{ env.VERSION }}, ${{ github.ref_name }}.
    while let Some(start) = out.find("${{") {
        let Some(end_rel) = out[start..].find("}}") else {
            break;
        };
        let end = start + end_rel;
        let inner = out[start + 3..end].trim();
        let var = gha_var(inner);
        out.replace_range(start..end + 2, &var);
    }

    // goreleaser: {{ .ProjectName }}, {{ .Version }}, {{ .Os }}, {{ .Arch }}.
    while let Some(start) = out.find("{{") {
        let Some(end_rel) = out[start..].find("}}") else {
            break;
        };
        let end = start + end_rel;
        let inner = out[start + 2..end].trim().trim_start_matches('.');
        let var = match inner.to_ascii_lowercase().as_str() {
            "projectname" | "binary" | "name" => "${name}".to_string(),
            "version" | "tag" => "${version}".to_string(),
            "os" => "${os}".to_string(),
            "arch" => "${arch}".to_string(),
            "target" => "${target}".to_string(),
            other => format!("${{{other}}}"),
        };
        out.replace_range(start..end + 2, &var);
    }

    // Shell: ${VERSION} and bare $VERSION for the known variable set.
    // Longest names first so `$TARGET` never eats `$TARGET_TRIPLE`.
    const SHELL_ORDER: &[&str] = &[
        "target_triple",
        "version",
        "target",
        "name",
        "arch",
        "ext",
        "os",
    ];
    for var in SHELL_ORDER {
        let upper = var.to_ascii_uppercase();
        out = out.replace(&format!("${{{upper}}}"), &format!("${{{var}}}"));
        out = out.replace(&format!("${upper}"), &format!("${{{var}}}"));
    }
    out = out.replace("${TOOL}", "${name}").replace("$TOOL", "${name}");

    out
}

fn gha_var(expr: &str) -> String {
    let leaf = expr.rsplit('.').next().unwrap_or(expr).trim();
    match leaf.to_ascii_lowercase().as_str() {
        "target" => "${target_triple}".to_string(),
        "version" | "ref_name" | "tag" => "${version}".to_string(),
        "os" => "${os}".to_string(),
        "arch" => "${arch}".to_string(),
        "name" | "binary" | "tool" => "${name}".to_string(),
        other => format!("${{{other}}}"),
    }
}

/// Resolve the versioned pattern for a tool. Precedence: explicit config,
/// then a pattern extracted from the workflow file, then one from a
/// release-tool config in the source tree, then the built-in default.
pub fn resolve_versioned(config: &ConfigView, tool: &Tool) -> Result<String> {
    if let Some(explicit) = config.naming_pattern(&tool.id, PatternKind::Versioned)? {
        return Ok(normalise_template(explicit));
    }
    if let Some(pattern) = pattern_from_workflow(tool) {
        return Ok(pattern);
    }
    if let Some(pattern) = pattern_from_release_metadata(tool) {
        return Ok(pattern);
    }
    Ok(DEFAULT_VERSIONED.to_string())
}

/// Resolve the compat pattern. Precedence: explicit config, then the
/// tool's bundled installer script, then the versioned pattern with its
/// version stripped, then the built-in default.
pub fn resolve_compat(config: &ConfigView, tool: &Tool) -> Result<String> {
    if let Some(explicit) = config.naming_pattern(&tool.id, PatternKind::Compat)? {
        return Ok(normalise_template(explicit));
    }
    if let Some(pattern) = pattern_from_installer(tool) {
        return Ok(pattern);
    }
    let versioned = resolve_versioned(config, tool)?;
    if versioned.contains("${version}") {
        return Ok(strip_version(&versioned));
    }
    Ok(DEFAULT_COMPAT.to_string())
}

fn pattern_from_workflow(tool: &Tool) -> Option<String> {
    let workflow = tool.workflow.as_ref()?;
    let content = fs::read_to_string(tool.local_path.join(workflow)).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        for key in ["asset_name:", "artifact_name:", "ASSET_NAME="] {
            if let Some(value) = trimmed.strip_prefix(key) {
                let candidate = normalise_template(value);
                if candidate.contains("${version}") || candidate.contains("${target") {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

fn pattern_from_release_metadata(tool: &Tool) -> Option<String> {
    for file in [".goreleaser.yml", ".goreleaser.yaml"] {
        let Ok(content) = fs::read_to_string(tool.local_path.join(file)) else {
            continue;
        };
        for line in content.lines() {
            if let Some(value) = line.trim().strip_prefix("name_template:") {
                return Some(normalise_template(value));
            }
        }
    }
    None
}

fn pattern_from_installer(tool: &Tool) -> Option<String> {
    let script = tool.install_script_path.as_ref()?;
    let path = if script.is_absolute() {
        script.clone()
    } else {
        tool.local_path.join(script)
    };
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        // Installer scripts assign the download name to a variable, e.g.
        //   ARCHIVE="$TOOL-$OS-$ARCH.tar.gz"
        let Some((_, rhs)) = trimmed.split_once('=') else {
            continue;
        };
        let has_os = trimmed.contains("$OS") || trimmed.contains("${OS}");
        let has_arch = trimmed.contains("$ARCH") || trimmed.contains("${ARCH}");
        if has_os && has_arch {
            return Some(normalise_template(rhs));
        }
    }
    None
}

/// Remove `${version}` plus one adjacent separator from a pattern.
pub fn strip_version(pattern: &str) -> String {
    for sep in ['-', '_', '.'] {
        let needle = format!("{sep}${{version}}");
        if pattern.contains(&needle) {
            return pattern.replace(&needle, "");
        }
        let needle = format!("${{version}}{sep}");
        if pattern.contains(&needle) {
            return pattern.replace(&needle, "");
        }
    }
    pattern.replace("${version}", "")
}

/// Render the release asset name for one (tool, platform, version).
pub fn versioned_name(
    config: &ConfigView,
    tool: &Tool,
    platform: &Platform,
    version: &str,
) -> Result<String> {
    let pattern = resolve_versioned(config, tool)?;
    let vars = vars_for(config, tool, platform, version)?;
    Ok(render(&pattern, &vars))
}

/// Render the legacy installer-compatible name.
pub fn compat_name(
    config: &ConfigView,
    tool: &Tool,
    platform: &Platform,
    version: &str,
) -> Result<String> {
    let pattern = resolve_compat(config, tool)?;
    let vars = vars_for(config, tool, platform, version)?;
    Ok(render(&pattern, &vars))
}

/// Inverse of [`versioned_name`]: recover (tool, version, os, arch) from a
/// rendered filename by matching it against every configured tool's
/// pattern. The arch comes back aliased, exactly as rendered.
pub fn parse_versioned(
    config: &ConfigView,
    filename: &str,
) -> Result<Option<(String, String, OsKind, String)>> {
    for tool_id in config.tool_ids() {
        let tool = config.tool(tool_id)?;
        let pattern = resolve_versioned(config, tool)?;
        for platform in &tool.targets {
            let mut vars = vars_for(config, tool, platform, "\u{0}")?;
            vars.version = "\u{0}".to_string();
            let probe = render(&pattern, &vars);
            let Some((prefix, suffix)) = probe.split_once('\u{0}') else {
                continue;
            };
            if let Some(rest) = filename.strip_prefix(prefix)
                && let Some(version) = rest.strip_suffix(suffix)
                && !version.is_empty()
                && !version.contains('/')
            {
                return Ok(Some((
                    tool.id.clone(),
                    version.to_string(),
                    platform.os,
                    vars.arch.clone(),
                )));
            }
        }
    }
    Ok(None)
}

/// A human-actionable naming reconciliation warning.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NamingWarning {
    pub tool: String,
    pub message: String,
}

/// Compare the resolved versioned and compat patterns and report the
/// mismatches that break installers in practice.
pub fn validate_naming(config: &ConfigView, tool: &Tool) -> Result<Vec<NamingWarning>> {
    let versioned = resolve_versioned(config, tool)?;
    let compat = resolve_compat(config, tool)?;
    let mut warnings = Vec::new();

    if compat.contains("${version}") {
        warnings.push(NamingWarning {
            tool: tool.id.clone(),
            message: format!(
                "compat pattern {compat:?} still contains ${{version}}; legacy installers expect a version-less name"
            ),
        });
    }

    if let (Some(vs), Some(cs)) = (primary_separator(&versioned), primary_separator(&compat))
        && vs != cs
    {
        warnings.push(NamingWarning {
            tool: tool.id.clone(),
            message: format!(
                "separator mismatch: versioned pattern uses {vs:?} but compat uses {cs:?}; installers will resolve the wrong name"
            ),
        });
    }

    if versioned.contains("${version}")
        && config
            .naming_pattern(&tool.id, PatternKind::Versioned)?
            .is_some()
        && pattern_from_installer(tool)
            .map(|p| !p.contains("${version}") && strip_version(&versioned) != p)
            .unwrap_or(false)
    {
        warnings.push(NamingWarning {
            tool: tool.id.clone(),
            message: format!(
                "configured versioned pattern {versioned:?} does not reduce to the installer's expected name; check the install script"
            ),
        });
    }

    Ok(warnings)
}

/// The separator between the `${name}` placeholder and whatever follows.
fn primary_separator(pattern: &str) -> Option<char> {
    let rest = pattern.strip_prefix("${name}")?;
    rest.chars().next().filter(|c| !c.is_alphanumeric())
}
