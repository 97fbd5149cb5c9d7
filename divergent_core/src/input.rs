use std::fmt;
use std::path::{Path, PathBuf};

/// Literal accepted on the command line and in config files for "no backing file".
pub const IN_MEMORY_SENTINEL: &str = ":memory:";

/// Where a trial's database state comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// No persistent backing store; programs run against a fresh in-memory database.
    InMemory,
    /// A database file that is snapshotted before every execution.
    File(PathBuf),
}

impl DataSource {
    pub fn from_arg(arg: &str) -> Self {
        if arg == IN_MEMORY_SENTINEL {
            DataSource::InMemory
        } else {
            DataSource::File(PathBuf::from(arg))
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            DataSource::InMemory => None,
            DataSource::File(path) => Some(path.as_path()),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::InMemory => f.write_str(IN_MEMORY_SENTINEL),
            DataSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One input to the harness: a statement plus the state it runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialInput {
    statement: String,
    base: DataSource,
}

impl TrialInput {
    pub fn new(statement: impl Into<String>, base: DataSource) -> Self {
        Self {
            statement: statement.into(),
            base,
        }
    }

    pub fn in_memory(statement: impl Into<String>) -> Self {
        Self::new(statement, DataSource::InMemory)
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn base(&self) -> &DataSource {
        &self.base
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.statement.as_bytes()
    }

    /// Hex MD5 of the statement, used to group reproducers of the same input.
    pub fn statement_digest(&self) -> String {
        format!("{:x}", md5::compute(self.as_bytes()))
    }
}
