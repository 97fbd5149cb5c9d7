mod inputs;
mod progress;

use divergent_core::archive::{BugArchiver, DirectoryArchiver};
use divergent_core::config::{DEFAULT_CONFIG_FILE, DivergentConfig};
use divergent_core::executor::{CancellationToken, CommandExecutor, Executor, ProgramSpec};
use divergent_core::ids::IdGenerator;
use divergent_core::input::{DataSource, IN_MEMORY_SENTINEL, TrialInput};
use divergent_core::oracle::{DifferentialOracle, Oracle};
use divergent_core::runner::{DifferentialRunner, TrialError};
use divergent_core::session::SessionAggregator;
use divergent_core::snapshot::StateSnapshotter;

use clap::Parser;
use inputs::{LoadedStatement, load_statements};
use progress::ProgressPresenter;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Differential tester for SQL engines", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Trusted program, as `label=path`.
    #[clap(long, value_parser = parse_program)]
    reference: Option<ProgramSpec>,
    /// Program under test, as `label=path`. Repeatable; replaces configured targets.
    #[clap(long = "target", value_parser = parse_program)]
    targets: Vec<ProgramSpec>,
    /// Base database file, or `:memory:`.
    #[clap(long, default_value = IN_MEMORY_SENTINEL)]
    database: String,
    /// `.sql` files or directories of them, one statement per file.
    #[clap(short, long = "input", required = true)]
    inputs: Vec<PathBuf>,
    #[clap(short, long)]
    trials: Option<u64>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Run the targets of each trial concurrently.
    #[clap(long)]
    parallel: bool,
    #[clap(long)]
    bugs_dir: Option<PathBuf>,
    #[clap(long)]
    seed: Option<u64>,
    /// Leave the scratch directory with all snapshots in place.
    #[clap(long)]
    keep_scratch: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn parse_program(arg: &str) -> Result<ProgramSpec, String> {
    let (label, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected label=path, got '{arg}'"))?;
    let (label, path) = (label.trim(), path.trim());
    if label.is_empty() || path.is_empty() {
        return Err(format!("expected label=path, got '{arg}'"));
    }
    Ok(ProgramSpec::from_path(label, path))
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<DivergentConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!(path = %config_path.display(), "loading configuration");
            DivergentConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = %default_config_path.display(), "loading default configuration");
                DivergentConfig::load_from_file(&default_config_path)?
            } else {
                DivergentConfig::default()
            }
        }
    };

    if let Some(reference) = &cli.reference {
        config.reference = Some(reference.clone());
    }
    if !cli.targets.is_empty() {
        config.targets = cli.targets.clone();
    }
    if let Some(trials) = cli.trials {
        config.session.trials = Some(trials);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if cli.parallel {
        config.session.parallel_targets = true;
    }
    if let Some(bugs_dir) = &cli.bugs_dir {
        config.archive.output_dir = bugs_dir.clone();
    }
    if let Some(seed) = cli.seed {
        config.session.seed = Some(seed);
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let statements = load_statements(&cli.inputs)?;
    if statements.is_empty() {
        anyhow::bail!("No statements found in {:?}", cli.inputs);
    }
    let base = DataSource::from_arg(&cli.database);
    if let DataSource::File(path) = &base {
        if !path.exists() {
            warn!(path = %path.display(), "base database does not exist, programs will run without one");
        }
    }

    let total_trials = config
        .session
        .trials
        .map_or(statements.len() as u64, |cap| cap.min(statements.len() as u64));
    let seed = config.session.seed;

    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel)?;
    let executor =
        CommandExecutor::new(config.command_executor_config()).with_cancellation(cancel.clone());
    let snapshotter = StateSnapshotter::with_ids(
        &config.session.scratch_prefix,
        IdGenerator::from_optional_seed(seed),
    )?;
    let mut archiver = DirectoryArchiver::with_ids(
        &config.archive.output_dir,
        IdGenerator::from_optional_seed(seed.map(|s| s.wrapping_add(1))),
    )?;

    let reference = config
        .reference
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No reference program configured"))?;
    let mut runner = DifferentialRunner::new(
        reference,
        config.targets.clone(),
        executor,
        DifferentialOracle::new(config.normalizer()),
        snapshotter,
        config.runner_settings(),
    )?
    .with_cancellation(cancel);

    info!(
        reference = %runner.reference().label,
        targets = ?runner.target_labels(),
        database = %base,
        scratch = %runner.scratch_dir().display(),
        bugs_dir = %archiver.output_dir().display(),
        "starting differential session"
    );

    let mut session = SessionAggregator::new(runner.target_labels(), config.session.history_capacity);
    let presenter = ProgressPresenter::for_total(total_trials);
    session.begin(total_trials);

    let mut stdout = std::io::stdout().lock();
    let end = drive_session(
        &mut runner,
        &mut session,
        &mut archiver,
        &statements[..total_trials as usize],
        &base,
        &presenter,
        &mut stdout,
    )?;
    drop(stdout);

    println!("\n{}", ProgressPresenter::summary(&session));

    let snapshotter = runner.into_snapshotter();
    if cli.keep_scratch {
        let kept = snapshotter.keep();
        println!("Snapshots kept in {}", kept.display());
    } else if let Err(e) = snapshotter.close() {
        warn!(error = %e, "failed to remove scratch directory");
    }

    if session.total_bugs() > 0 {
        println!("Reproducers written to {}", archiver.output_dir().display());
        Ok(ExitCode::from(1))
    } else if end == SessionEnd::Cancelled {
        Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Exit status when the session was interrupted before finishing, shell style.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Completed,
    Cancelled,
}

/// SIGINT and SIGTERM cancel the session: in-flight programs are killed and
/// the loop stops, so the scratch directory is still torn down.
fn install_interrupt_handler(cancel: &CancellationToken) -> Result<(), anyhow::Error> {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .map_err(|e| anyhow::anyhow!("Failed to install interrupt handler: {}", e))
}

/// Runs each statement as one trial, printing bug and progress lines to `out`.
fn drive_session<E: Executor, O: Oracle>(
    runner: &mut DifferentialRunner<E, O>,
    session: &mut SessionAggregator,
    archiver: &mut dyn BugArchiver,
    statements: &[LoadedStatement],
    base: &DataSource,
    presenter: &ProgressPresenter,
    out: &mut dyn Write,
) -> Result<SessionEnd, anyhow::Error> {
    for loaded in statements {
        let input = TrialInput::new(loaded.statement.as_str(), base.clone());
        match runner.run(&input) {
            Ok(trial) => {
                let mut results = trial.into_results();
                session.record(&mut results, archiver);
                for result in results.iter().filter(|r| r.outcome.is_bug()) {
                    writeln!(
                        out,
                        "{}  [{}]",
                        ProgressPresenter::bug_line(result),
                        loaded.origin.display()
                    )?;
                }
            }
            Err(TrialError::Cancelled) => {
                warn!("session cancelled");
                return Ok(SessionEnd::Cancelled);
            }
            Err(e) => {
                warn!(input = %loaded.origin.display(), error = %e, "trial aborted");
                session.note_failed_trial();
            }
        }

        let view = session.progress();
        if presenter.should_report(&view) {
            writeln!(out, "{}", ProgressPresenter::progress_line(&view))?;
        }
    }
    Ok(SessionEnd::Completed)
}


#[cfg(all(test, unix))]
mod session_tests {
    use super::*;
    use divergent_core::runner::RunnerSettings;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sh(label: &str, script: &str) -> ProgramSpec {
        ProgramSpec::new(
            label,
            vec!["/bin/sh".into(), "-c".into(), script.into(), "sh".into()],
        )
    }

    fn crashing_runner(cancel: CancellationToken) -> DifferentialRunner<CommandExecutor, DifferentialOracle> {
        DifferentialRunner::new(
            sh("reference", "echo 1"),
            vec![sh("a", "exit 139"), sh("b", "exit 139"), sh("c", "exit 139")],
            CommandExecutor::default().with_cancellation(cancel.clone()),
            DifferentialOracle::default(),
            StateSnapshotter::new("cli_session_").unwrap(),
            RunnerSettings {
                timeout: Duration::from_secs(5),
                parallel_targets: false,
            },
        )
        .unwrap()
        .with_cancellation(cancel)
    }

    fn statement() -> Vec<LoadedStatement> {
        vec![LoadedStatement {
            origin: PathBuf::from("crash.sql"),
            statement: "SELECT 1;".to_string(),
        }]
    }

    #[test]
    fn every_bug_is_reported_even_with_a_tiny_history() {
        let bugs_dir = tempdir().unwrap();
        let mut runner = crashing_runner(CancellationToken::new());
        let mut session = SessionAggregator::new(runner.target_labels(), 1);
        let mut archiver = DirectoryArchiver::new(bugs_dir.path()).unwrap();
        session.begin(1);

        let mut out = Vec::new();
        let end = drive_session(
            &mut runner,
            &mut session,
            &mut archiver,
            &statement(),
            &DataSource::InMemory,
            &ProgressPresenter::for_total(1),
            &mut out,
        )
        .unwrap();
        runner.into_snapshotter().close().unwrap();

        assert_eq!(end, SessionEnd::Completed);
        let out = String::from_utf8(out).unwrap();
        let bug_lines: Vec<&str> = out.lines().filter(|l| l.starts_with("CRASH in")).collect();
        assert_eq!(bug_lines.len(), 3, "{out}");
        for (line, label) in bug_lines.iter().zip(["a", "b", "c"]) {
            assert!(line.contains(&format!("'{label}'")), "{line}");
            assert!(line.contains("saved to"), "{line}");
        }
        assert_eq!(session.total_bugs(), 3);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn cancelled_session_stops_before_running_anything() {
        let bugs_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut runner = crashing_runner(cancel.clone());
        let scratch = runner.scratch_dir().to_path_buf();
        let mut session = SessionAggregator::new(runner.target_labels(), 4);
        let mut archiver = DirectoryArchiver::new(bugs_dir.path()).unwrap();
        session.begin(1);
        cancel.cancel();

        let mut out = Vec::new();
        let end = drive_session(
            &mut runner,
            &mut session,
            &mut archiver,
            &statement(),
            &DataSource::InMemory,
            &ProgressPresenter::for_total(1),
            &mut out,
        )
        .unwrap();

        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(session.current_trial(), 0);
        assert!(out.is_empty());
        runner.into_snapshotter().close().unwrap();
        assert!(!scratch.exists());
    }
}
