//! Patch custody command line interface
//!
//! Runs the governance workflow against a local workspace.
//!
//! # Usage
//!
//! ```bash
//! # Show what a patch touches
//! custody_cli preview --file change.diff
//!
//! # Score a patch against the workspace policy and history
//! cat change.diff | custody_cli evaluate -o json
//!
//! # Apply with terminal approvals, then run the tests
//! custody_cli apply --file change.diff --validate "cargo test"
//!
//! # Check the custody chain
//! custody_cli verify
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use patch_custody::custody::CustodyLedger;
use patch_custody::patch::{ApplySelection, ParsedPatch};
use patch_custody::policy::default_policy_template_json;
use patch_custody::ports::{
    ApprovalChannel, ApprovalPrompt, FileSecretStore, LocalWorkspaceFs, WorkspaceFs,
};
use patch_custody::settings::GovernanceSettings;
use patch_custody::workflow::{AttemptOutcome, GovernanceWorkflow};

#[derive(Parser)]
#[command(name = "custody_cli")]
#[command(version = "0.1.0")]
#[command(about = "Governed patch apply with a signed custody ledger")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root
    #[arg(long, short = 'w', global = true, default_value = ".")]
    workspace: PathBuf,

    /// Directory holding the ledger signing key
    #[arg(long, global = true, env = "CUSTODY_SECRETS_DIR")]
    secrets_dir: Option<PathBuf>,

    /// Policy profile (overrides CUSTODY_PROFILE)
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Output format: json, text, or pretty (default)
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files and hunks a patch touches
    Preview {
        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Evaluate a patch against policy and history without applying it
    Evaluate {
        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Apply a patch through the governance workflow
    Apply {
        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Only these hunks (`path#index`, see `preview`)
        #[arg(long = "hunk")]
        hunks: Vec<String>,

        /// Only these files
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Shell command run after a successful apply; recorded in the ledger
        #[arg(long)]
        validate: Option<String>,

        /// Do not offer an immediate undo
        #[arg(long)]
        no_undo: bool,
    },

    /// Verify the custody chain from genesis
    Verify,

    /// Per-domain governance history
    Stats,

    /// Write a starter policy file
    InitPolicy {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command, &cli.workspace, cli.secrets_dir, cli.profile, cli.format).await {
        Ok(code) => code,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(
    command: Commands,
    workspace: &Path,
    secrets_dir: Option<PathBuf>,
    profile: Option<String>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let mut settings = GovernanceSettings::from_env();
    if let Some(profile) = profile {
        settings.profile = profile;
    }
    let settings = settings.clamped();

    let fs: Arc<dyn WorkspaceFs> = Arc::new(LocalWorkspaceFs::new(workspace));
    let secrets = FileSecretStore::new(secrets_dir.unwrap_or_else(|| workspace.join(".custody")));
    let workflow = GovernanceWorkflow::open(
        Arc::clone(&fs),
        &secrets,
        Arc::new(TerminalApproval),
        settings,
    )
    .await
    .context("opening custody ledger")?;

    match command {
        Commands::Preview { file } => cmd_preview(file, format),
        Commands::Evaluate { file } => cmd_evaluate(&workflow, file, format).await,
        Commands::Apply {
            file,
            hunks,
            paths,
            validate,
            no_undo,
        } => cmd_apply(&workflow, workspace, file, hunks, paths, validate, no_undo, format).await,
        Commands::Verify => cmd_verify(workflow.ledger(), format).await,
        Commands::Stats => cmd_stats(&workflow, format).await,
        Commands::InitPolicy { force } => cmd_init_policy(fs.as_ref(), &workflow, force, format).await,
    }
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn cmd_preview(file: Option<PathBuf>, format: OutputFormat) -> Result<ExitCode> {
    let source = read_input(file)?;
    let Some(patch) = ParsedPatch::parse(&source) else {
        bail!("no unified diff or file block found in input");
    };
    let preview = patch.preview();
    let lines = patch.changed_lines();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "preview": preview,
            "changedLines": lines,
        }))?,
        OutputFormat::Text | OutputFormat::Pretty => {
            println!("{} patch, {} file(s)", preview.kind, preview.parsed_files);
            for path in &preview.files {
                println!("  {path} ({} changed lines)", lines.get(path).copied().unwrap_or(0));
            }
            for hunk in &preview.hunks {
                println!("    {}  {}", hunk.id, hunk.header);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_evaluate(
    workflow: &GovernanceWorkflow,
    file: Option<PathBuf>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let source = read_input(file)?;
    let Some(patch) = ParsedPatch::parse(&source) else {
        bail!("no unified diff or file block found in input");
    };
    let eval = workflow.evaluate(&patch).await?;

    match format {
        OutputFormat::Json => print_json(&eval)?,
        OutputFormat::Text | OutputFormat::Pretty => {
            let v = &eval.verdict;
            let decision = if v.blocked {
                "BLOCKED"
            } else if eval.needs_override() && !v.override_allowed {
                "BLOCKED (override disabled by domain)"
            } else if eval.needs_override() {
                "OVERRIDE REQUIRED"
            } else if eval.low_trust {
                "TRUST CONFIRMATION REQUIRED"
            } else {
                "AUTO-APPROVED"
            };
            println!("{decision}");
            println!("  risk {}/{}", v.risk_score, eval.effective_threshold);
            println!("  domains [{}]", v.matched_domains.join(", "));
            println!("  min trust {}/100", eval.min_trust_score);
            for code in v.block_codes() {
                println!("  blocked by {code}");
            }
            for reason in &v.reasons {
                println!("  - {reason}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_apply(
    workflow: &GovernanceWorkflow,
    workspace: &Path,
    file: Option<PathBuf>,
    hunks: Vec<String>,
    paths: Vec<String>,
    validate: Option<String>,
    no_undo: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let source = read_input(file)?;
    let selection = if !hunks.is_empty() {
        ApplySelection::from_hunk_ids(hunks.iter().map(String::as_str))
    } else if !paths.is_empty() {
        ApplySelection::with_paths(paths)
    } else {
        ApplySelection::all()
    };

    let outcome = workflow.attempt(&source, &selection).await?;
    report_outcome(&outcome, format)?;

    let mut ctx = match outcome {
        AttemptOutcome::Applied { ctx, .. } => ctx,
        AttemptOutcome::Blocked { .. } | AttemptOutcome::Canceled { .. } => {
            return Ok(ExitCode::from(2))
        }
        AttemptOutcome::Fallback | AttemptOutcome::NothingSelected => return Ok(ExitCode::FAILURE),
        AttemptOutcome::Noop { .. } => return Ok(ExitCode::SUCCESS),
    };

    let mut validation_ok = true;
    if let Some(command) = validate {
        let started = Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(workspace)
            .output()
            .await
            .with_context(|| format!("running validation command {command:?}"))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        validation_ok = output.status.success();
        workflow
            .record_validation(&ctx.chain_id, validation_ok, started.elapsed(), &text)
            .await?;
        if format != OutputFormat::Json {
            println!(
                "validation {} in {}ms",
                if validation_ok { "passed" } else { "failed" },
                started.elapsed().as_millis()
            );
        }
    }

    if !no_undo && format != OutputFormat::Json {
        let prompt = if validation_ok {
            "Undo apply? [y/N]"
        } else {
            "Validation failed. Undo apply? [y/N]"
        };
        if prompt_line(prompt).await.is_some_and(|a| is_yes(&a)) {
            let report = workflow.rollback(&mut ctx).await?;
            println!(
                "rolled back {} file(s), {} failed",
                report.restored.len(),
                report.failures.len()
            );
        }
    }

    Ok(if validation_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(3)
    })
}

async fn cmd_verify(ledger: &CustodyLedger, format: OutputFormat) -> Result<ExitCode> {
    let verification = ledger.verify().await?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "ledger": ledger.path(),
            "signed": ledger.is_signing(),
            "ok": verification.is_ok(),
            "verification": verification,
        }))?,
        OutputFormat::Text | OutputFormat::Pretty => {
            let status = if verification.is_ok() { "OK" } else { "TAMPERED" };
            println!("{status}: {verification}");
            if !ledger.is_signing() {
                println!("  (signing disabled, entries were counted, not verified)");
            }
        }
    }
    Ok(if verification.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_stats(workflow: &GovernanceWorkflow, format: OutputFormat) -> Result<ExitCode> {
    let stats = workflow.stats().await?;
    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Text | OutputFormat::Pretty => {
            println!(
                "{} applied chain(s), {} rolled back ({:.0}%)",
                stats.applied_chains,
                stats.rolled_back_chains,
                stats.global_rollback_rate_pct()
            );
            if stats.heatmap.is_empty() {
                println!("no domain history");
            }
            for row in &stats.heatmap {
                println!(
                    "  {:<20} attempts {:>4}  block {:>3}%  override {:>3}%  rollback {:>3}%  validate {:>3}%  top {}",
                    row.domain,
                    row.attempts,
                    row.block_rate_pct,
                    row.override_rate_pct,
                    row.rollback_rate_pct,
                    row.validate_rate_pct,
                    row.top_block_cause.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_init_policy(
    fs: &dyn WorkspaceFs,
    workflow: &GovernanceWorkflow,
    force: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let path = &workflow.settings().policy_file;
    if !force && fs.exists(path).await? {
        bail!("{path} already exists (use --force to overwrite)");
    }
    fs.write(path, &default_policy_template_json()).await?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "written": path }))?,
        OutputFormat::Text | OutputFormat::Pretty => println!("wrote {path}"),
    }
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// HELPERS
// =============================================================================

fn report_outcome(outcome: &AttemptOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        let ctx = outcome.context();
        let (conflicts, failures) = match outcome {
            AttemptOutcome::Applied { report, .. } | AttemptOutcome::Noop { report, .. } => {
                (report.conflicts.clone(), report.failures.clone())
            }
            _ => (Vec::new(), Vec::new()),
        };
        let cancel_reason = match outcome {
            AttemptOutcome::Canceled { reason, .. } => Some(reason.as_str()),
            _ => None,
        };
        return print_json(&serde_json::json!({
            "outcome": outcome.label(),
            "chainId": ctx.map(|c| c.chain_id.as_str()),
            "sourceHash": ctx.map(|c| c.source_hash.as_str()),
            "decision": ctx.map(|c| &c.decision),
            "verdict": outcome.verdict(),
            "appliedFiles": outcome.applied_files(),
            "conflicts": conflicts,
            "failures": failures,
            "cancelReason": cancel_reason,
        }));
    }

    match outcome {
        AttemptOutcome::Fallback => println!("no unified diff or file block found in input"),
        AttemptOutcome::NothingSelected => println!("selection left nothing to apply"),
        AttemptOutcome::Blocked { ctx, verdict } => {
            println!(
                "apply blocked by policy. risk {}/{}",
                ctx.decision.risk, ctx.decision.threshold
            );
            for reason in &verdict.reasons {
                println!("  - {reason}");
            }
        }
        AttemptOutcome::Canceled { reason, .. } => println!("apply canceled: {reason}"),
        AttemptOutcome::Applied { ctx, report, .. } => {
            println!(
                "applied {} file(s) [chain {}]",
                report.applied_count(),
                ctx.chain_id
            );
            for path in &report.conflicts {
                println!("  conflict: {path}");
            }
            for failure in &report.failures {
                println!("  failed: {} ({})", failure.path, failure.error);
            }
        }
        AttemptOutcome::Noop { report, .. } => {
            println!("nothing applied; every file conflicted or failed");
            for path in &report.conflicts {
                println!("  conflict: {path}");
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("JSON serialization failed")?
    );
    Ok(())
}

fn read_input(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("reading stdin")?;
            Ok(buffer)
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// One line from the terminal. `None` on EOF.
async fn prompt_line(prompt: &str) -> Option<String> {
    eprint!("{prompt} ");
    io::stderr().flush().ok();
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Approvals answered on the controlling terminal.
struct TerminalApproval;

#[async_trait]
impl ApprovalChannel for TerminalApproval {
    async fn confirm(&self, prompt: &ApprovalPrompt) -> bool {
        prompt_line(&format!("{prompt} [y/N]"))
            .await
            .is_some_and(|a| is_yes(&a))
    }

    async fn input(&self, prompt: &ApprovalPrompt) -> Option<String> {
        prompt_line(&format!("{prompt}:")).await
    }
}
