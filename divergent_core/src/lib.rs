pub mod archive;
pub mod config;
pub mod executor;
pub mod ids;
pub mod input;
pub mod normalize;
pub mod oracle;
pub mod runner;
pub mod session;
pub mod snapshot;

pub use archive::{ArchiveError, ArchiveState, BugArchiver, DirectoryArchiver, Reproducer};
pub use config::DivergentConfig;
pub use executor::{
    CancellationToken, CommandExecutor, CommandExecutorConfig, ExecutionResult, Executor,
    ProcessExit, ProgramSpec,
};
pub use ids::IdGenerator;
pub use input::{DataSource, TrialInput};
pub use normalize::{OutputNormalizer, RowOrder};
pub use oracle::{DifferentialOracle, Oracle, Outcome};
pub use runner::{DifferentialRunner, RunResult, RunnerError, RunnerSettings, TrialError, TrialOutcome};
pub use session::{OutcomeCounts, ProgressView, RecordSummary, SessionAggregator, SessionStats};
pub use snapshot::{SnapshotError, StateSnapshotter};
