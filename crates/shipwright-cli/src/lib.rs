//! CLI adapter for shipwright.
//!
//! The binary forwards to [`run`], which parses arguments, loads the
//! immutable config view, and drives the core engine. Output contract:
//! structured data (one JSON envelope per invocation) on stdout when
//! `--json` is set; human text always on stderr. Exit codes are the
//! closed set 0–8.

use std::io::IsTerminal;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use console::style;
use serde::Serialize;

use shipwright_config::{ConfigView, Paths};
use shipwright_core::dispatch::Dispatcher;
use shipwright_core::github::GitHubClient;
use shipwright_core::health::{HealthChecker, HealthStatus};
use shipwright_core::logger::{LogLevel, Logger};
use shipwright_core::orchestrator::{OrchestrateOptions, OrchestrationReport, Orchestrator};
use shipwright_core::{manifest, naming, orchestrator};
use shipwright_types::{ErrorKind, Platform, RunStatus};

#[derive(Parser, Debug)]
#[command(name = "shipwright", version, long_version = long_version())]
#[command(about = "Hybrid multi-platform release orchestration for a fleet of developer tools")]
struct Cli {
    /// Emit a single machine-readable JSON envelope on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// More logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Less logging (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build all targets, produce a signed manifest, and notify
    /// downstream repositories.
    Release {
        tool: String,
        version: String,
        /// Restrict to specific targets (comma-separated os/arch pairs).
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        /// Plan only; no lock, no state, no builds.
        #[arg(long)]
        dry_run: bool,
        /// Re-try only the unfinished targets of the latest run.
        #[arg(long)]
        resume: bool,
        /// Skip minisign signatures.
        #[arg(long)]
        no_sign: bool,
    },
    /// Build all targets and produce a manifest, without downstream
    /// notification.
    Build {
        tool: String,
        version: String,
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        resume: bool,
    },
    /// Probe configured hosts and report their health.
    Health {
        /// Check a single host.
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the release manifest of a run.
    Manifest {
        tool: String,
        version: String,
        /// Run id; the latest run when omitted.
        #[arg(long, default_value = "latest")]
        run: String,
        /// Also persist the manifest to this absolute path.
        #[arg(long)]
        out: Option<String>,
    },
    /// Downstream fan-out commands.
    #[command(subcommand)]
    Dispatch(DispatchCommands),
    /// Validate artifact naming patterns for one tool.
    CheckNaming { tool: String },
    /// Generate shell completions.
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand, Debug)]
enum DispatchCommands {
    /// Re-send the release event (and checksum sync) for a finished run.
    Release {
        tool: String,
        version: String,
        /// Restrict to specific downstream repositories.
        #[arg(long, value_delimiter = ',')]
        repos: Vec<String>,
    },
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    status: String,
    exit_code: i32,
    #[serde(flatten)]
    data: T,
}

/// Programmatic entrypoint; returns the process exit code.
pub fn run() -> i32 {
    // Usage errors map into the closed exit-code set (4), not clap's
    // default of 2, which is reserved for lock conflicts.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind as ClapError;
            let code = match e.kind() {
                ClapError::DisplayHelp | ClapError::DisplayVersion => 0,
                _ => 4,
            };
            let _ = e.print();
            return code;
        }
    };
    let level = LogLevel::from_env_or(LogLevel::from_flags(cli.verbose, cli.quiet));

    match dispatch_command(&cli, level) {
        Ok(code) => code,
        Err(e) => {
            let kind = e
                .downcast_ref::<ErrorKind>()
                .cloned()
                .unwrap_or_else(|| classify_anyhow(&e));
            let code = kind.exit_code();
            eprintln!("{} {e:#}", error_tag());
            if cli.json {
                let envelope = Envelope {
                    status: kind.ident().to_string(),
                    exit_code: code,
                    data: serde_json::json!({ "error": format!("{e:#}") }),
                };
                println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
            }
            code
        }
    }
}

fn dispatch_command(cli: &Cli, level: LogLevel) -> Result<i32> {
    // Completions need no config at all.
    if let Commands::Completions { shell } = &cli.cmd {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "shipwright", &mut std::io::stdout());
        return Ok(0);
    }

    let paths = Paths::from_env()?;
    let config = ConfigView::load(paths)?;
    let logger = Logger::new(&config.paths.state_root, "", level);

    match &cli.cmd {
        Commands::Release {
            tool,
            version,
            targets,
            dry_run,
            resume,
            no_sign,
        } => {
            if !dry_run
                && !shipwright_core::guardrails::confirm(
                    &format!("release {tool} {version}?"),
                    true,
                )?
            {
                eprintln!("aborted");
                return Ok(0);
            }
            // Signing needs a configured key; without one, release still
            // works but produces unsigned artifacts.
            let sign = !*no_sign && config.global.signing_key.is_some();
            let opts = orchestrate_opts(targets, *dry_run, *resume, sign)?;
            let report = orchestrate(&config, &logger, tool, version, &opts)?;
            let mut code = report.exit_code;
            if !report.dry_run
                && matches!(report.status, RunStatus::Completed | RunStatus::Partial)
            {
                if let Err(e) = fan_out(&config, &logger, &report) {
                    logger.error(&format!("downstream dispatch failed: {e:#}"));
                    code = code.max(1);
                }
            }
            render_report(cli, &report, code);
            Ok(code)
        }
        Commands::Build {
            tool,
            version,
            targets,
            dry_run,
            resume,
        } => {
            let opts = orchestrate_opts(targets, *dry_run, *resume, false)?;
            let report = orchestrate(&config, &logger, tool, version, &opts)?;
            render_report(cli, &report, report.exit_code);
            Ok(report.exit_code)
        }
        Commands::Health { host } => {
            let checker = HealthChecker::new(&config, &logger);
            let reports = match host {
                Some(id) => vec![checker.check(config.host(id)?)?],
                None => checker.check_all()?,
            };
            let unhealthy = reports.iter().any(|h| h.status == HealthStatus::Error);
            let code = if unhealthy { 3 } else { 0 };
            if cli.json {
                let envelope = Envelope {
                    status: if unhealthy { "unhealthy" } else { "ok" }.to_string(),
                    exit_code: code,
                    data: serde_json::json!({ "hosts": reports }),
                };
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                for report in &reports {
                    eprintln!("{}: {:?}", report.host, report.status);
                    for probe in &report.probes {
                        eprintln!(
                            "  {:<20} {:?} {}",
                            probe.name,
                            probe.status,
                            probe.detail.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            Ok(code)
        }
        Commands::Manifest {
            tool,
            version,
            run,
            out,
        } => {
            let record = orchestrator::load_manifest(
                &config,
                &logger,
                tool,
                &shipwright_types::v_prefixed(version),
                run,
            )?;
            if let Some(out) = out {
                let path = shipwright_core::guardrails::resolve_path(out, false)?;
                manifest::write_manifest(&record, &path)?;
            }
            // The manifest IS the data product; it goes to stdout in both
            // modes.
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(0)
        }
        Commands::Dispatch(DispatchCommands::Release {
            tool,
            version,
            repos,
        }) => {
            let version = shipwright_types::v_prefixed(version);
            let manifest =
                orchestrator::load_manifest(&config, &logger, tool, &version, "latest")?;
            let client = github_client(&config)?;
            let dispatcher = Dispatcher::new(&config, client, &logger);
            let repos = (!repos.is_empty()).then_some(repos.as_slice());
            let outcomes = dispatcher.dispatch_release(
                tool,
                &version,
                manifest.git_sha.as_deref(),
                &manifest.run_id,
                repos,
            )?;
            let failed = outcomes.iter().any(|o| !o.dispatched);
            let code = if failed { 1 } else { 0 };
            if cli.json {
                let envelope = Envelope {
                    status: if failed { "partial" } else { "success" }.to_string(),
                    exit_code: code,
                    data: serde_json::json!({ "dispatches": outcomes }),
                };
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                for outcome in &outcomes {
                    eprintln!(
                        "{}: {} (attempts: {})",
                        outcome.repo,
                        if outcome.dispatched { "dispatched" } else { "failed" },
                        outcome.attempts
                    );
                }
            }
            Ok(code)
        }
        Commands::CheckNaming { tool } => {
            let tool = config.tool(tool)?;
            let warnings = naming::validate_naming(&config, tool)?;
            if cli.json {
                let envelope = Envelope {
                    status: if warnings.is_empty() { "ok" } else { "warnings" }.to_string(),
                    exit_code: 0,
                    data: serde_json::json!({ "warnings": warnings }),
                };
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else if warnings.is_empty() {
                eprintln!("naming patterns for {} reconcile cleanly", tool.id);
            } else {
                for warning in &warnings {
                    eprintln!("{} {}", warn_tag(), warning.message);
                }
            }
            Ok(0)
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}

fn orchestrate(
    config: &ConfigView,
    logger: &Logger,
    tool: &str,
    version: &str,
    opts: &OrchestrateOptions,
) -> Result<OrchestrationReport> {
    let orch = Orchestrator::new(config, logger.clone());
    let cancel = orch.cancel_flag();
    // Best-effort: a second ctrl-c falls through to the default handler.
    let _ = ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    });
    orch.orchestrate(tool, version, opts)
}

fn orchestrate_opts(
    targets: &[String],
    dry_run: bool,
    resume: bool,
    sign: bool,
) -> Result<OrchestrateOptions> {
    let explicit = if targets.is_empty() {
        None
    } else {
        let mut parsed = Vec::new();
        for raw in targets {
            let platform: Platform = raw
                .parse()
                .map_err(|e| anyhow::Error::new(ErrorKind::InvalidArgs(format!("{e:#}"))))?;
            parsed.push(platform);
        }
        Some(parsed)
    };
    Ok(OrchestrateOptions {
        explicit_targets: explicit,
        dry_run,
        resume,
        sign,
    })
}

fn fan_out(config: &ConfigView, logger: &Logger, report: &OrchestrationReport) -> Result<()> {
    let Some(manifest_record) = &report.manifest else {
        return Ok(());
    };
    if config.global.downstream_repos.is_empty() {
        return Ok(());
    }
    let client = github_client(config)?;
    let dispatcher = Dispatcher::new(config, client, logger);
    dispatcher.dispatch_release(
        &report.tool,
        &report.version,
        manifest_record.git_sha.as_deref(),
        &report.run_id,
        None,
    )?;

    let store = shipwright_core::state::StateStore::new(&config.paths.state_root);
    let artifacts_dir = store.artifacts_dir(&report.tool, &report.version, &report.run_id);
    let checksums = artifacts_dir.join(manifest::CHECKSUMS_FILE);
    let manifest_path = artifacts_dir.join(orchestrator::MANIFEST_FILE);
    if checksums.exists() && manifest_path.exists() {
        dispatcher.sync_checksums(manifest_record, &checksums, &manifest_path, None)?;
    }
    Ok(())
}

fn github_client(config: &ConfigView) -> Result<GitHubClient> {
    let token = std::env::var("SHIPWRIGHT_GITHUB_TOKEN")
        .or_else(|_| std::env::var("GITHUB_TOKEN"))
        .ok();
    let api_base = std::env::var("SHIPWRIGHT_API_BASE")
        .unwrap_or_else(|_| "https://api.github.com".to_string());
    GitHubClient::new(&api_base, token, config.paths.cache_root.join("api"))
}

/// The two-section human summary: per-target lines, then the aggregate.
fn render_report(cli: &Cli, report: &OrchestrationReport, exit_code: i32) {
    if cli.json {
        // The report already carries status and exit_code fields; rewrite
        // them in place so the envelope has exactly one of each.
        match serde_json::to_value(report) {
            Ok(mut value) => {
                value["status"] = status_word(report.status).into();
                value["exit_code"] = exit_code.into();
                match serde_json::to_string_pretty(&value) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("{} failed to serialize report: {e}", error_tag()),
                }
            }
            Err(e) => eprintln!("{} failed to serialize report: {e}", error_tag()),
        }
        return;
    }

    for target in &report.targets {
        let mark = match target.status {
            shipwright_types::HostStatus::Completed => ok_mark(),
            shipwright_types::HostStatus::Skipped => "-".to_string(),
            _ => fail_mark(),
        };
        let detail = target
            .artifact
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| target.error.clone())
            .unwrap_or_default();
        eprintln!(
            "{mark} {:<16} {:<8} attempts={} {}",
            target.platform.to_string(),
            target.host,
            target.attempts,
            detail
        );
    }
    eprintln!();
    let word = status_word(report.status);
    if report.dry_run {
        eprintln!("dry-run: {} target(s) planned for {} {}", report.targets.len(), report.tool, report.version);
    } else {
        eprintln!(
            "{} {} {} ({} target(s), run {})",
            word,
            report.tool,
            report.version,
            report.targets.len(),
            report.run_id
        );
    }
}

fn status_word(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "success",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Created => "planned",
        RunStatus::Running => "running",
    }
}

/// Anything that escaped without a typed kind: config errors read as
/// invalid_args, the rest is internal.
fn classify_anyhow(e: &anyhow::Error) -> ErrorKind {
    let text = format!("{e:#}");
    if text.contains("config_error") {
        ErrorKind::InvalidArgs(text)
    } else {
        ErrorKind::Internal(text)
    }
}

fn color() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
}

fn error_tag() -> String {
    if color() {
        style("error:").red().bold().to_string()
    } else {
        "error:".to_string()
    }
}

fn warn_tag() -> String {
    if color() {
        style("warning:").yellow().to_string()
    } else {
        "warning:".to_string()
    }
}

fn ok_mark() -> String {
    if color() {
        style("ok").green().to_string()
    } else {
        "ok".to_string()
    }
}

fn fail_mark() -> String {
    if color() {
        style("fail").red().to_string()
    } else {
        "fail".to_string()
    }
}

fn long_version() -> &'static str {
    Box::leak(
        format!(
            "{} (git {}, {} profile, {})",
            env!("CARGO_PKG_VERSION"),
            env!("SHIPWRIGHT_BUILD_GIT_SHA"),
            env!("SHIPWRIGHT_BUILD_PROFILE"),
            env!("SHIPWRIGHT_BUILD_RUSTC"),
        )
        .into_boxed_str(),
    )
}
