use crate::executor::ExecutionResult;
use crate::ids::IdGenerator;
use crate::input::DataSource;
use crate::oracle::Outcome;
use crate::runner::RunResult;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BUGS_DIR: &str = "bug_reproducers";

/// Attempts at finding an unused reproducer directory name before giving up.
const MAX_NAME_ATTEMPTS: usize = 16;

const NO_OUTPUT: &str = "No output available";
const NO_ERROR: &str = "No error message available";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create archive directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize reproducer metadata: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("No unused reproducer name under {0:?} after {MAX_NAME_ATTEMPTS} attempts")]
    NameExhausted(PathBuf),
}

/// Archiving status of a [`RunResult`].
///
/// Leaves `Pending` exactly once; every bug outcome ends up `Archived` or
/// `Failed`, never silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveState {
    NotRequired,
    Pending,
    Archived(PathBuf),
    Failed(String),
}

impl ArchiveState {
    pub fn location(&self) -> Option<&Path> {
        match self {
            ArchiveState::Archived(path) => Some(path),
            _ => None,
        }
    }
}

/// Everything needed to replay one non-PASS outcome.
#[derive(Debug, Clone, Copy)]
pub struct Reproducer<'a> {
    pub outcome: Outcome,
    pub statement: &'a str,
    pub base: &'a DataSource,
    /// The target's snapshot after the program ran against it.
    pub mutated_data_path: Option<&'a Path>,
    /// Untouched copy of the base state taken before any execution.
    pub pristine_snapshot: Option<&'a Path>,
    pub target_label: &'a str,
    pub target_execution: &'a ExecutionResult,
    pub reference_label: &'a str,
    pub reference_execution: &'a ExecutionResult,
}

impl<'a> Reproducer<'a> {
    pub fn from_run(result: &'a RunResult) -> Self {
        Self {
            outcome: result.outcome,
            statement: result.input.statement(),
            base: result.input.base(),
            mutated_data_path: result.snapshots.target.as_deref(),
            pristine_snapshot: result.snapshots.pristine.as_deref(),
            target_label: &result.target,
            target_execution: &result.target_execution,
            reference_label: &result.reference,
            reference_execution: &result.reference_execution,
        }
    }
}

/// Persists reproducers for bug outcomes.
pub trait BugArchiver {
    /// Stores one reproducer and returns where it went. Each call must use
    /// a fresh location.
    fn save_reproducer(&mut self, reproducer: &Reproducer<'_>) -> Result<PathBuf, ArchiveError>;
}

#[derive(Serialize)]
struct ProgramRecord<'a> {
    label: &'a str,
    execution: &'a ExecutionResult,
}

#[derive(Serialize)]
struct ReproducerMetadata<'a> {
    outcome: Outcome,
    statement: &'a str,
    statement_md5: String,
    base: String,
    archived_at_unix: u64,
    target: ProgramRecord<'a>,
    reference: ProgramRecord<'a>,
}

/// Writes each reproducer into its own directory:
///
/// ```text
/// <output>/<outcome>_<id>/
///     original_test.sql   statement as executed
///     reduced_test.sql    same statement (no reducer yet)
///     test.db             pre-execution state, or missing_db.txt
///     mutated.db          target's state after the run, when there is one
///     version.txt         label of the program the bug is attributed to
///     README.md           expected vs actual behavior
///     result.json         both executions and metadata
/// ```
#[derive(Debug)]
pub struct DirectoryArchiver {
    output_dir: PathBuf,
    ids: IdGenerator,
    saved: usize,
}

impl DirectoryArchiver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        Self::with_ids(output_dir, IdGenerator::from_entropy())
    }

    pub fn with_ids(output_dir: impl Into<PathBuf>, ids: IdGenerator) -> Result<Self, ArchiveError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|source| ArchiveError::CreateDir {
            path: output_dir.clone(),
            source,
        })?;
        Ok(Self {
            output_dir,
            ids,
            saved: 0,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    fn create_bug_dir(&mut self, outcome: Outcome) -> Result<PathBuf, ArchiveError> {
        let prefix = outcome.as_str().to_ascii_lowercase();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let candidate = self
                .output_dir
                .join(format!("{prefix}_{}", self.ids.next_id()));
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(ArchiveError::CreateDir {
                        path: candidate,
                        source,
                    });
                }
            }
        }
        Err(ArchiveError::NameExhausted(self.output_dir.clone()))
    }
}

fn write_file(path: PathBuf, contents: impl AsRef<[u8]>) -> Result<(), ArchiveError> {
    fs::write(&path, contents).map_err(|source| ArchiveError::Write { path, source })
}

fn copy_file(from: &Path, to: PathBuf) -> Result<(), ArchiveError> {
    fs::copy(from, &to)
        .map(|_| ())
        .map_err(|source| ArchiveError::Write { path: to, source })
}

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.is_empty() { placeholder } else { text }
}

fn fenced(out: &mut String, lang: &str, body: &str) {
    let _ = writeln!(out, "```{lang}");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("```\n\n");
}

fn render_readme(r: &Reproducer<'_>, archived_at_unix: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", r.outcome);
    let _ = writeln!(
        out,
        "Found by divergent at unix time {archived_at_unix}: target `{}` against reference `{}`.\n",
        r.target_label, r.reference_label
    );
    out.push_str("## SQL Query\n\n");
    fenced(&mut out, "sql", r.statement);
    out.push_str("## Expected vs. Actual Behavior\n\n");

    let target_stdout = or_placeholder(&r.target_execution.stdout, NO_OUTPUT);
    let target_stderr = or_placeholder(&r.target_execution.stderr, NO_ERROR);
    let reference_stdout = or_placeholder(&r.reference_execution.stdout, NO_OUTPUT);
    let reference_stderr = or_placeholder(&r.reference_execution.stderr, NO_ERROR);

    match r.outcome {
        Outcome::Crash => {
            out.push_str("### Expected Behavior\n\n");
            out.push_str("The statement should execute without the program failing.\n\n");
            out.push_str("### Actual Behavior\n\n");
            let _ = writeln!(
                out,
                "The target {} with the following error:\n",
                r.target_execution.exit
            );
            fenced(&mut out, "", target_stderr);
        }
        Outcome::LogicBug => {
            let _ = writeln!(
                out,
                "### Expected Behavior (reference: {})\n",
                r.reference_label
            );
            fenced(&mut out, "", reference_stdout);
            let _ = writeln!(out, "### Actual Behavior (target: {})\n", r.target_label);
            fenced(&mut out, "", target_stdout);
        }
        Outcome::ReferenceError => {
            let _ = writeln!(out, "### Target Behavior (target: {})\n", r.target_label);
            out.push_str("The target executed the statement successfully:\n\n");
            fenced(&mut out, "", target_stdout);
            let _ = writeln!(
                out,
                "### Reference Error (reference: {})\n",
                r.reference_label
            );
            let _ = writeln!(
                out,
                "The reference {} with the following error:\n",
                r.reference_execution.exit
            );
            fenced(&mut out, "", reference_stderr);
        }
        Outcome::Pass | Outcome::InvalidQuery => {
            out.push_str("Both programs agreed on failure or success; kept for reference.\n\n");
        }
    }

    out.push_str("## Steps to Reproduce\n\n");
    out.push_str("1. Copy `test.db` to a scratch location\n");
    out.push_str("2. Run the statement in `reduced_test.sql` against that copy\n");
    out.push_str("3. Compare the output of both programs\n\n");
    out.push_str("## Notes\n\n");
    out.push_str("- `original_test.sql` is the statement that triggered the divergence\n");
    out.push_str("- `reduced_test.sql` is the statement to replay (currently identical)\n");
    out.push_str("- `test.db` is the database state before any program ran\n");
    out.push_str("- `version.txt` names the program the divergence is attributed to\n");
    out.push_str("- `result.json` holds exit status and both output streams of each program\n");
    out
}

impl BugArchiver for DirectoryArchiver {
    fn save_reproducer(&mut self, r: &Reproducer<'_>) -> Result<PathBuf, ArchiveError> {
        let bug_dir = self.create_bug_dir(r.outcome)?;
        if let Err(e) = write_reproducer(&bug_dir, r) {
            // Never leave a partial reproducer behind.
            if let Err(cleanup) = fs::remove_dir_all(&bug_dir) {
                warn!(dir = %bug_dir.display(), error = %cleanup, "failed to remove incomplete reproducer");
            }
            return Err(e);
        }

        self.saved += 1;
        debug!(outcome = %r.outcome, label = r.target_label, dir = %bug_dir.display(), "reproducer files written");
        Ok(bug_dir)
    }
}

fn write_reproducer(bug_dir: &Path, r: &Reproducer<'_>) -> Result<(), ArchiveError> {
    let archived_at_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    write_file(bug_dir.join("original_test.sql"), r.statement)?;
    write_file(bug_dir.join("reduced_test.sql"), r.statement)?;

    let fallback = r.base.path().filter(|path| path.exists());
    match r.pristine_snapshot.filter(|path| path.exists()).or(fallback) {
        Some(state) => copy_file(state, bug_dir.join("test.db"))?,
        None => write_file(
            bug_dir.join("missing_db.txt"),
            format!(
                "No database file available for this bug reproducer.\nOriginal database path was: {}\n",
                r.base
            ),
        )?,
    }
    if let Some(mutated) = r.mutated_data_path.filter(|path| path.exists()) {
        copy_file(mutated, bug_dir.join("mutated.db"))?;
    }

    let attributed_to = match r.outcome {
        Outcome::ReferenceError => r.reference_label,
        _ => r.target_label,
    };
    write_file(bug_dir.join("version.txt"), attributed_to)?;
    write_file(bug_dir.join("README.md"), render_readme(r, archived_at_unix))?;

    let metadata = ReproducerMetadata {
        outcome: r.outcome,
        statement: r.statement,
        statement_md5: format!("{:x}", md5::compute(r.statement.as_bytes())),
        base: r.base.to_string(),
        archived_at_unix,
        target: ProgramRecord {
            label: r.target_label,
            execution: r.target_execution,
        },
        reference: ProgramRecord {
            label: r.reference_label,
            execution: r.reference_execution,
        },
    };
    write_file(
        bug_dir.join("result.json"),
        serde_json::to_vec_pretty(&metadata)?,
    )
}
