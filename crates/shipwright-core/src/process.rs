//! Subprocess execution with deadlines.
//!
//! Every external program the engine touches goes through here: argv
//! arrays only, never shell strings composed from variables. The one
//! exception, the composed remote command the SSH driver hands to the
//! remote shell, is still a single argv element on our side.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Exit code conventionally reported for a timed-out command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSpec<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: Option<&'a Path>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl<'a> RunSpec<'a> {
    pub fn new(program: &'a str, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn cwd(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Run a command to completion, killing it at the deadline. A timed-out
/// command reports exit code 124 with `timed_out` set.
pub fn run(spec: &RunSpec<'_>) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(spec.program);
    command.args(&spec.args);
    if let Some(dir) = spec.cwd {
        command.current_dir(dir);
    }
    for (k, v) in &spec.env {
        command.env(k, v);
    }

    let Some(timeout) = spec.timeout else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute {}", spec.program))?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => {
                let (stdout, stderr) = drain(&mut child);
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let (stdout, mut stderr) = drain(&mut child);
                    stderr.push_str(&format!(
                        "\ncommand timed out after {}",
                        humantime::format_duration(timeout)
                    ));
                    return Ok(CommandOutput {
                        exit_code: TIMEOUT_EXIT_CODE,
                        stdout,
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn drain(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Extract the last well-formed top-level `{…}` block from mixed output.
///
/// Drivers print a JSON result as their final line, but runner emulators
/// and build tools interleave log text on the same stream. Scanning
/// backwards for a balanced object keeps the contract robust.
pub fn extract_last_json(output: &str) -> Option<serde_json::Value> {
    let bytes = output.as_bytes();
    let mut end = bytes.len();
    while let Some(close) = output[..end].rfind('}') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut start = None;
        for (i, &b) in bytes[..=close].iter().enumerate().rev() {
            let c = b as char;
            if in_string {
                // Walking backwards: a quote ends the string unless the
                // preceding byte escapes it.
                if c == '"' && !(i > 0 && bytes[i - 1] == b'\\') {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '}' => depth += 1,
                '{' => {
                    if depth == 1 {
                        start = Some(i);
                        break;
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
        }
        if let Some(s) = start
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(&output[s..=close])
        {
            return Some(value);
        }
        end = close;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_and_captures_output() {
        let out = run(&RunSpec::new("echo", ["hello"])).expect("run echo");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn reports_exit_code() {
        let out = run(&RunSpec::new("sh", ["-c", "exit 3"])).expect("run sh");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[test]
    fn kills_at_deadline_with_124() {
        let spec = RunSpec::new("sleep", ["5"]).timeout(Duration::from_millis(200));
        let out = run(&spec).expect("run sleep");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.stderr.contains("timed out"));
        assert!(out.duration < Duration::from_secs(4));
    }

    #[test]
    fn passes_env_and_cwd() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = RunSpec::new("sh", ["-c", "echo $SW_PROBE; pwd"])
            .cwd(td.path())
            .env("SW_PROBE", "probe-value");
        let out = run(&spec).expect("run sh");
        assert!(out.stdout.contains("probe-value"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run(&RunSpec::new("definitely-not-a-real-binary-xyz", Vec::<String>::new()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to execute"));
    }

    #[test]
    fn extracts_trailing_json() {
        let mixed = "log line one\nstill building...\n{\"status\": \"success\", \"exit_code\": 0}";
        let value = extract_last_json(mixed).expect("json");
        assert_eq!(value["status"], "success");
    }

    #[test]
    fn extracts_last_of_several_blocks() {
        let mixed = "{\"status\": \"first\"}\nnoise\n{\"status\": \"second\"}";
        let value = extract_last_json(mixed).expect("json");
        assert_eq!(value["status"], "second");
    }

    #[test]
    fn skips_malformed_trailing_block() {
        let mixed = "{\"status\": \"good\"}\nerror: unexpected token near }";
        let value = extract_last_json(mixed).expect("json");
        assert_eq!(value["status"], "good");
    }

    #[test]
    fn handles_nested_objects_and_braces_in_strings() {
        let mixed = "note: use {braces} carefully\n{\"outer\": {\"inner\": \"has } brace\"}}";
        let value = extract_last_json(mixed).expect("json");
        assert_eq!(value["outer"]["inner"], "has } brace");
    }

    #[test]
    fn no_json_yields_none() {
        assert!(extract_last_json("plain text only").is_none());
        assert!(extract_last_json("").is_none());
    }
}
