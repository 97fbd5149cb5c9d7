use crate::archive::ArchiveState;
use crate::executor::{CancellationToken, ExecutionResult, Executor, ProcessExit, ProgramSpec};
use crate::input::TrialInput;
use crate::oracle::{Oracle, Outcome};
use crate::snapshot::{SnapshotError, StateSnapshotter};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors detected while assembling a runner.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunnerError {
    #[error("At least one target program is required")]
    NoTargets,
    #[error("Program '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("Label '{0}' is used by more than one program")]
    DuplicateLabel(String),
}

/// Errors that abort a single trial. The session can carry on with the next one.
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Could not isolate database state: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Trial cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub timeout: Duration,
    /// Run the targets of one trial concurrently. The reference always runs first.
    pub parallel_targets: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            parallel_targets: false,
        }
    }
}

/// Snapshot paths involved in one target's comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialSnapshots {
    /// Never handed to any program; kept for reproducers.
    pub pristine: Option<PathBuf>,
    pub reference: Option<PathBuf>,
    pub target: Option<PathBuf>,
}

/// Result of comparing one target against the reference for one input.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: Outcome,
    pub input: Arc<TrialInput>,
    pub target: String,
    pub target_execution: ExecutionResult,
    pub reference: String,
    pub reference_execution: Arc<ExecutionResult>,
    pub snapshots: TrialSnapshots,
    archive: ArchiveState,
}

impl RunResult {
    pub fn new(
        outcome: Outcome,
        input: Arc<TrialInput>,
        target: impl Into<String>,
        target_execution: ExecutionResult,
        reference: impl Into<String>,
        reference_execution: Arc<ExecutionResult>,
        snapshots: TrialSnapshots,
    ) -> Self {
        let archive = if outcome.is_bug() {
            ArchiveState::Pending
        } else {
            ArchiveState::NotRequired
        };
        Self {
            outcome,
            input,
            target: target.into(),
            target_execution,
            reference: reference.into(),
            reference_execution,
            snapshots,
            archive,
        }
    }

    pub fn archive(&self) -> &ArchiveState {
        &self.archive
    }

    pub fn archive_location(&self) -> Option<&Path> {
        self.archive.location()
    }

    /// Settles a pending archive state. Returns `false` (and changes nothing)
    /// if the state was already settled or no archive was needed.
    pub fn settle_archive(&mut self, outcome: Result<PathBuf, String>) -> bool {
        if self.archive != ArchiveState::Pending {
            return false;
        }
        self.archive = match outcome {
            Ok(path) => ArchiveState::Archived(path),
            Err(reason) => ArchiveState::Failed(reason),
        };
        true
    }
}

/// Everything produced by one trial.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub reference_execution: Arc<ExecutionResult>,
    /// One entry per target, keyed by label.
    pub results: BTreeMap<String, RunResult>,
}

impl TrialOutcome {
    pub fn into_results(self) -> Vec<RunResult> {
        self.results.into_values().collect()
    }

    pub fn bugs(&self) -> impl Iterator<Item = &RunResult> {
        self.results.values().filter(|r| r.outcome.is_bug())
    }
}

/// Runs one input against the reference and every target, each on its own
/// copy of the database state, and classifies every target.
///
/// The reference runs exactly once per trial and all targets are compared
/// against that single result, so the reference must be deterministic.
pub struct DifferentialRunner<E: Executor, O: Oracle> {
    reference: ProgramSpec,
    targets: Vec<ProgramSpec>,
    executor: E,
    oracle: O,
    snapshotter: StateSnapshotter,
    settings: RunnerSettings,
    cancel: CancellationToken,
    trials_run: u64,
}

impl<E: Executor, O: Oracle> DifferentialRunner<E, O> {
    pub fn new(
        reference: ProgramSpec,
        targets: Vec<ProgramSpec>,
        executor: E,
        oracle: O,
        snapshotter: StateSnapshotter,
        settings: RunnerSettings,
    ) -> Result<Self, RunnerError> {
        validate_programs(&reference, &targets)?;
        Ok(Self {
            reference,
            targets,
            executor,
            oracle,
            snapshotter,
            settings,
            cancel: CancellationToken::new(),
            trials_run: 0,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reference(&self) -> &ProgramSpec {
        &self.reference
    }

    pub fn targets(&self) -> &[ProgramSpec] {
        &self.targets
    }

    pub fn target_labels(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.label.clone()).collect()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn scratch_dir(&self) -> &Path {
        self.snapshotter.scratch_dir()
    }

    pub fn trials_run(&self) -> u64 {
        self.trials_run
    }

    /// Gives back the snapshotter so the caller can close or keep the scratch directory.
    pub fn into_snapshotter(self) -> StateSnapshotter {
        self.snapshotter
    }

    pub fn run(&mut self, input: &TrialInput) -> Result<TrialOutcome, TrialError> {
        self.trials_run += 1;
        let span = info_span!("trial", trial = self.trials_run);
        let _guard = span.enter();

        if self.cancel.is_cancelled() {
            return Err(TrialError::Cancelled);
        }

        // All copies come from the same base state and exist before anything runs.
        let pristine = self.snapshotter.snapshot(input.base())?;
        let reference_snapshot = self.snapshotter.snapshot(input.base())?;
        let target_snapshots = (0..self.targets.len())
            .map(|_| self.snapshotter.snapshot(input.base()))
            .collect::<Result<Vec<_>, _>>()?;

        let statement = input.statement();
        let timeout = self.settings.timeout;

        let reference_execution = Arc::new(self.executor.execute(
            &self.reference,
            statement,
            reference_snapshot.as_deref(),
            timeout,
        ));
        debug!(reference = %self.reference.label, exit = %reference_execution.exit, "reference finished");
        if self.cancel.is_cancelled() || reference_execution.exit == ProcessExit::Cancelled {
            return Err(TrialError::Cancelled);
        }

        let target_executions = if self.settings.parallel_targets && self.targets.len() > 1 {
            self.execute_targets_parallel(statement, &target_snapshots)
        } else {
            self.targets
                .iter()
                .zip(&target_snapshots)
                .map(|(program, snapshot)| {
                    self.executor
                        .execute(program, statement, snapshot.as_deref(), timeout)
                })
                .collect()
        };
        if self.cancel.is_cancelled()
            || target_executions
                .iter()
                .any(|execution| execution.exit == ProcessExit::Cancelled)
        {
            return Err(TrialError::Cancelled);
        }

        let shared_input = Arc::new(input.clone());
        let mut results = BTreeMap::new();
        for ((program, snapshot), execution) in self
            .targets
            .iter()
            .zip(target_snapshots)
            .zip(target_executions)
        {
            let outcome = self
                .oracle
                .classify(statement, &reference_execution, &execution);
            if outcome.is_bug() {
                warn!(label = %program.label, %outcome, exit = %execution.exit, "divergence");
            } else {
                debug!(label = %program.label, %outcome, "classified");
            }
            let snapshots = TrialSnapshots {
                pristine: pristine.clone(),
                reference: reference_snapshot.clone(),
                target: snapshot,
            };
            results.insert(
                program.label.clone(),
                RunResult::new(
                    outcome,
                    Arc::clone(&shared_input),
                    program.label.clone(),
                    execution,
                    self.reference.label.clone(),
                    Arc::clone(&reference_execution),
                    snapshots,
                ),
            );
        }

        Ok(TrialOutcome {
            reference_execution,
            results,
        })
    }

    fn execute_targets_parallel(
        &self,
        statement: &str,
        snapshots: &[Option<PathBuf>],
    ) -> Vec<ExecutionResult> {
        let executor = &self.executor;
        let timeout = self.settings.timeout;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .targets
                .iter()
                .zip(snapshots)
                .map(|(program, snapshot)| {
                    scope.spawn(move || {
                        executor.execute(program, statement, snapshot.as_deref(), timeout)
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(&self.targets)
                .map(|(handle, program)| {
                    handle.join().unwrap_or_else(|_| {
                        ExecutionResult::launch_failure(format!(
                            "Executor thread for '{}' panicked",
                            program.label
                        ))
                    })
                })
                .collect()
        })
    }
}

fn validate_programs(reference: &ProgramSpec, targets: &[ProgramSpec]) -> Result<(), RunnerError> {
    if targets.is_empty() {
        return Err(RunnerError::NoTargets);
    }
    let mut seen = HashSet::new();
    for program in std::iter::once(reference).chain(targets) {
        if program.command.is_empty() {
            return Err(RunnerError::EmptyCommand(program.label.clone()));
        }
        if !seen.insert(program.label.as_str()) {
            return Err(RunnerError::DuplicateLabel(program.label.clone()));
        }
    }
    info!(
        reference = %reference.label,
        targets = targets.len(),
        "differential runner ready"
    );
    Ok(())
}
