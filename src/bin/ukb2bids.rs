use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ukb_bids::app::{
    App, ConversionReport, ConvertRequest, HistoryReport, ProgressSinkKind, RunOptions,
    ValidationReport,
};
use ukb_bids::config::{ConfigLoader, ResolvedConfig, TransferMode};
use ukb_bids::domain::SourceKey;
use ukb_bids::error::BidsError;
use ukb_bids::executor::{Action, CancelToken};
use ukb_bids::output::{JsonOutput, OutputMode};
use ukb_bids::transfer::{FsTransfer, TimedTransfer};
use ukb_bids::tui::Tui;
use ukb_bids::validation::Severity;

type FsApp = App<TimedTransfer<FsTransfer>>;

const FATAL_EXIT_CODE: u8 = 1;

#[derive(Parser)]
#[command(name = "ukb2bids")]
#[command(about = "Convert UK Biobank bulk imaging downloads into a BIDS dataset")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Convert a download directory into a BIDS tree")]
    Convert(ConvertArgs),
    #[command(about = "Show what convert would do, without writing anything")]
    Plan(ConvertArgs),
    #[command(about = "Check a BIDS tree against its manifest")]
    Validate(ValidateArgs),
    #[command(about = "Show manifest records for a destination")]
    History(HistoryArgs),
}

#[derive(Args, Clone)]
struct ConvertArgs {
    source: Utf8PathBuf,

    destination: Utf8PathBuf,

    /// TSV mapping subjects and instances to session labels.
    #[arg(long)]
    participants: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    transfer: Option<TransferMode>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_subjects: Option<usize>,

    #[arg(long)]
    skip_existing: bool,

    #[arg(long)]
    no_participants_file: bool,

    #[arg(long)]
    dry_run: bool,

    /// Re-convert entries whose source changed since the last run.
    #[arg(long)]
    force: bool,

    /// Do not ask before applying `--force`.
    #[arg(long)]
    yes: bool,
}

#[derive(Args)]
struct ValidateArgs {
    destination: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct HistoryArgs {
    destination: Utf8PathBuf,

    /// Source key, e.g. `1000001:2:20227:0:zip`.
    key: Option<String>,

    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Convert(args) => run_convert(args, output_mode, false),
        Commands::Plan(args) => run_convert(args, output_mode, true),
        Commands::Validate(args) => run_validate(args, output_mode),
        Commands::History(args) => run_history(args, output_mode),
    }
}

fn build_app(config: ResolvedConfig) -> FsApp {
    let transfer = TimedTransfer::new(FsTransfer::new(config.transfer), config.timeout);
    App::new(config, transfer)
}

fn run_convert(
    args: ConvertArgs,
    output_mode: OutputMode,
    plan_only: bool,
) -> miette::Result<u8> {
    let mut config = ConfigLoader::resolve(args.config.as_deref())
        .and_then(|config| config.with_workers(args.workers))?;
    if let Some(transfer) = args.transfer {
        config.transfer = transfer;
    }
    if !args.source.as_std_path().exists() {
        return Err(BidsError::SourceNotFound(args.source).into());
    }
    if !args.source.as_std_path().is_dir() {
        return Err(BidsError::SourceNotDirectory(args.source).into());
    }

    let request = ConvertRequest {
        participants: args.participants.clone(),
        max_subjects: args.max_subjects,
        skip_existing: args.skip_existing,
        write_participants: !args.no_participants_file,
        ..ConvertRequest::new(args.source.clone(), args.destination.clone())
    };
    let dry_run = plan_only || args.dry_run;
    let app = Arc::new(build_app(config));
    let cancel = CancelToken::new();

    let report = match output_mode {
        OutputMode::NonInteractive => {
            let prepared = app.prepare(&request, &JsonOutput)?;
            let apply_drift = args.force && args.yes;
            if prepared.drift_count() > 0 && args.force && !args.yes {
                tracing::warn!(
                    drift = prepared.drift_count(),
                    "--force needs --yes when running non-interactively; drift left as is"
                );
            }
            let options = RunOptions {
                dry_run,
                apply_drift,
            };
            let report = app.execute(prepared, options, &cancel, &JsonOutput)?;
            JsonOutput::print_conversion(&report).into_diagnostic()?;
            report
        }
        OutputMode::Interactive => {
            let kind = if dry_run {
                ProgressSinkKind::Plan
            } else {
                ProgressSinkKind::Convert
            };
            let mut tui = Tui::new(kind, format!("{} -> {}", args.source, args.destination));

            let prepare_app = app.clone();
            let prepared = tui.run(&cancel, move |sink| prepare_app.prepare(&request, sink))?;

            let drift = prepared.drift_count();
            let apply_drift = !dry_run
                && args.force
                && drift > 0
                && (args.yes || tui.confirm_drift(drift)?);
            let options = RunOptions {
                dry_run,
                apply_drift,
            };

            let execute_app = app.clone();
            let execute_cancel = cancel.clone();
            let report = tui.run(&cancel, move |sink| {
                execute_app.execute(prepared, options, &execute_cancel, sink)
            })?;
            print_conversion_summary(&report);
            report
        }
    };

    Ok(report.exit_code())
}

fn run_validate(args: ValidateArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let app = Arc::new(build_app(ConfigLoader::resolve(args.config.as_deref())?));
    let report = match output_mode {
        OutputMode::NonInteractive => {
            let report = app.validate(&args.destination, &JsonOutput)?;
            JsonOutput::print_validation(&report).into_diagnostic()?;
            report
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Validate, args.destination.to_string());
            let destination = args.destination.clone();
            let report = tui.run(&CancelToken::new(), move |sink| {
                app.validate(&destination, sink)
            })?;
            print_validation_summary(&report);
            report
        }
    };
    Ok(if report.errors() > 0 { 2 } else { 0 })
}

fn run_history(args: HistoryArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let app = build_app(ConfigLoader::resolve(args.config.as_deref())?);
    let key = args
        .key
        .as_deref()
        .map(str::parse::<SourceKey>)
        .transpose()?;
    let report = app.history(&args.destination, key.as_ref(), &JsonOutput)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_history(&report).into_diagnostic()?,
        OutputMode::Interactive => print_history(&report),
    }
    Ok(0)
}

fn print_conversion_summary(report: &ConversionReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let title = if report.dry_run {
        "UKB2BIDS plan"
    } else {
        "UKB2BIDS summary"
    };
    println!("{cyan}{title}{reset}");
    println!("{cyan}   {} -> {}{reset}", report.source, report.destination);

    let counts = &report.counts;
    println!(
        "{green}Planned: {} new, {} unchanged{reset}",
        counts.planned.new, counts.planned.unchanged
    );
    if counts.planned.conflict > 0 || counts.planned.drift > 0 {
        println!(
            "{yellow}Unresolved: {} conflict, {} drift{reset}",
            counts.planned.conflict, counts.planned.drift
        );
    }
    if !report.dry_run {
        println!(
            "{green}Transferred: {}  re-committed: {}  restored: {}  amended: {}{reset}",
            counts.transferred, counts.recommitted, counts.restored, counts.amended
        );
    }
    if counts.failed > 0 {
        println!("{red}Failed: {}{reset}", counts.failed);
    }
    if counts.issues > 0 {
        println!("{yellow}Skipped source files: {}{reset}", counts.issues);
    }
    if report.cancelled {
        println!(
            "{yellow}Cancelled: {} entries not started{reset}",
            counts.cancelled
        );
    }

    for issue in &report.issues {
        println!("{yellow}   {} ({:?}): {}{reset}", issue.source, issue.stage, issue.message);
    }
    if let Some(execution) = &report.execution {
        for outcome in execution.failures() {
            println!(
                "{red}   {} -> {}: {}{reset}",
                outcome.source,
                outcome.destination,
                outcome.message.as_deref().unwrap_or("failed")
            );
        }
        for outcome in execution
            .outcomes
            .iter()
            .filter(|outcome| outcome.action == Action::Skipped && !outcome.status.is_settled())
        {
            println!(
                "{yellow}   {} -> {} ({}){reset}",
                outcome.source, outcome.destination, outcome.status
            );
        }
    } else {
        for entry in report.plan.entries.iter().filter(|entry| !entry.status.is_settled()) {
            println!(
                "{yellow}   {} -> {} ({}){reset}",
                entry.source, entry.destination, entry.status
            );
        }
    }

    for finding in &report.validation {
        let color = match finding.severity {
            Severity::Error => red,
            Severity::Warning => yellow,
        };
        println!("{color}   {:?} {}: {}{reset}", finding.kind, finding.path, finding.detail);
    }
}

fn print_validation_summary(report: &ValidationReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    if report.findings.is_empty() {
        println!("{green}{} is a valid BIDS tree{reset}", report.destination);
        return;
    }
    println!(
        "{red}{} errors{reset}, {yellow}{} warnings{reset} in {}",
        report.errors(),
        report.findings.len() - report.errors(),
        report.destination
    );
    for finding in &report.findings {
        let color = match finding.severity {
            Severity::Error => red,
            Severity::Warning => yellow,
        };
        println!("{color}   {:?} {}: {}{reset}", finding.kind, finding.path, finding.detail);
    }
}

fn print_history(report: &HistoryReport) {
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}{}{reset}", report.manifest);
    for record in &report.records {
        println!(
            "v{} {} {} -> {} ({}, {})",
            record.version,
            record.converted_at,
            record.key,
            record.destination,
            record.fingerprint,
            record.tool
        );
    }
}
