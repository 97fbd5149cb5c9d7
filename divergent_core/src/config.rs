use crate::archive::DEFAULT_BUGS_DIR;
use crate::executor::{CommandExecutorConfig, ProgramSpec};
use crate::normalize::{DEFAULT_FIELD_DELIMITER, DEFAULT_FLOAT_PRECISION, OutputNormalizer, RowOrder};
use crate::runner::RunnerSettings;
use crate::session::DEFAULT_HISTORY_CAPACITY;
use crate::snapshot::DEFAULT_SCRATCH_PREFIX;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "divergent.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Upper bound on trials; `None` runs every input once.
    #[serde(default)]
    pub trials: Option<u64>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub parallel_targets: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_scratch_prefix")]
    pub scratch_prefix: String,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_scratch_prefix() -> String {
    DEFAULT_SCRATCH_PREFIX.to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            trials: None,
            history_capacity: default_history_capacity(),
            parallel_targets: false,
            seed: None,
            scratch_prefix: default_scratch_prefix(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct NormalizerSettings {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_float_precision")]
    pub float_precision: usize,
    #[serde(default)]
    pub sort_unordered_rows: bool,
}

fn default_delimiter() -> char {
    DEFAULT_FIELD_DELIMITER
}

fn default_float_precision() -> usize {
    DEFAULT_FLOAT_PRECISION
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            float_precision: default_float_precision(),
            sort_unordered_rows: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ArchiveSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BUGS_DIR)
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DivergentConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub reference: Option<ProgramSpec>,
    #[serde(default)]
    pub targets: Vec<ProgramSpec>,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub normalizer: NormalizerSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
}

impl DivergentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Checks that the config describes a runnable comparison.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let reference = self
            .reference
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No reference program configured"))?;
        if self.targets.is_empty() {
            anyhow::bail!("No target programs configured");
        }

        let mut labels = HashSet::new();
        for program in std::iter::once(reference).chain(&self.targets) {
            if program.label.trim().is_empty() {
                anyhow::bail!("Program {:?} has an empty label", program.command);
            }
            if program.command.is_empty() || program.command[0].trim().is_empty() {
                anyhow::bail!("Program '{}' has no command", program.label);
            }
            if !labels.insert(program.label.as_str()) {
                anyhow::bail!("Label '{}' is used by more than one program", program.label);
            }
        }

        if self.executor.timeout_ms == 0 {
            anyhow::bail!("executor.timeout-ms must be greater than zero");
        }
        let delimiter = self.normalizer.delimiter;
        if delimiter.is_whitespace() || delimiter == '.' {
            anyhow::bail!("normalizer.delimiter {delimiter:?} would be stripped or mistaken for a decimal point");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.executor.timeout_ms)
    }

    pub fn command_executor_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            working_dir: self.executor.working_dir.clone(),
            envs: self.executor.env.clone(),
            ..CommandExecutorConfig::default()
        }
    }

    pub fn normalizer(&self) -> OutputNormalizer {
        let row_order = if self.normalizer.sort_unordered_rows {
            RowOrder::SortUnlessOrdered
        } else {
            RowOrder::Preserve
        };
        OutputNormalizer::new(self.normalizer.delimiter, self.normalizer.float_precision)
            .with_row_order(row_order)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            timeout: self.timeout(),
            parallel_targets: self.session.parallel_targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const FULL: &str = r#"
[session]
trials = 500
history-capacity = 20
parallel-targets = true
seed = 42
scratch-prefix = "dt_"

[reference]
label = "sqlite-3.45"
command = ["/opt/sqlite-3.45/sqlite3"]

[[targets]]
label = "sqlite-trunk"
command = ["/opt/trunk/sqlite3", "-batch"]

[[targets]]
label = "sqlite-asan"
command = ["/opt/asan/sqlite3"]

[executor]
timeout-ms = 2500
working-dir = "/tmp"
env = { ASAN_OPTIONS = "detect_leaks=0" }

[normalizer]
delimiter = ","
float-precision = 6
sort-unordered-rows = true

[archive]
output-dir = "found"
"#;

    #[test]
    fn full_config_parses() {
        let config = DivergentConfig::from_toml(FULL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.session.trials, Some(500));
        assert_eq!(config.session.history_capacity, 20);
        assert!(config.session.parallel_targets);
        assert_eq!(config.session.seed, Some(42));
        assert_eq!(config.session.scratch_prefix, "dt_");
        assert_eq!(config.reference.as_ref().unwrap().label, "sqlite-3.45");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].command, ["/opt/trunk/sqlite3", "-batch"]);
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.archive.output_dir, PathBuf::from("found"));

        let exec = config.command_executor_config();
        assert_eq!(exec.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(exec.envs["ASAN_OPTIONS"], "detect_leaks=0");

        let normalizer = config.normalizer();
        assert_eq!(normalizer.delimiter(), ',');
        assert_eq!(normalizer.float_precision(), 6);
        assert_eq!(normalizer.row_order(), RowOrder::SortUnlessOrdered);

        let settings = config.runner_settings();
        assert!(settings.parallel_targets);
        assert_eq!(settings.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = DivergentConfig::from_toml("").unwrap();
        assert_eq!(config, DivergentConfig::default());
        assert_eq!(config.session.history_capacity, 12);
        assert_eq!(config.session.scratch_prefix, "divergent_");
        assert_eq!(config.executor.timeout_ms, 1000);
        assert_eq!(config.normalizer.delimiter, '|');
        assert_eq!(config.normalizer.float_precision, 10);
        assert_eq!(config.archive.output_dir, PathBuf::from("bug_reproducers"));
        assert_eq!(config.normalizer().row_order(), RowOrder::Preserve);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DivergentConfig::from_toml("[session]\niterations = 5\n").is_err());
        assert!(DivergentConfig::from_toml("[[targets]]\nlabel = \"a\"\ncommand = [\"x\"]\npath = \"y\"\n").is_err());
    }

    #[test]
    fn validation_catches_unrunnable_setups() {
        let base = DivergentConfig::from_toml(FULL).unwrap();

        let mut no_reference = base.clone();
        no_reference.reference = None;
        assert!(no_reference.validate().is_err());

        let mut no_targets = base.clone();
        no_targets.targets.clear();
        assert!(no_targets.validate().is_err());

        let mut duplicate = base.clone();
        duplicate.targets[1].label = "sqlite-3.45".to_string();
        let err = duplicate.validate().unwrap_err().to_string();
        assert!(err.contains("sqlite-3.45"), "{err}");

        let mut empty_command = base.clone();
        empty_command.targets[0].command.clear();
        assert!(empty_command.validate().is_err());

        let mut zero_timeout = base.clone();
        zero_timeout.executor.timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());

        let mut bad_delimiter = base;
        bad_delimiter.normalizer.delimiter = ' ';
        assert!(bad_delimiter.validate().is_err());
    }

    #[test]
    fn load_from_file_reports_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, FULL).unwrap();
        assert!(DivergentConfig::load_from_file(&path).is_ok());

        fs::write(&path, "[session\n").unwrap();
        let err = DivergentConfig::load_from_file(&path).unwrap_err().to_string();
        assert!(err.contains(DEFAULT_CONFIG_FILE), "{err}");

        let missing = dir.path().join("absent.toml");
        assert!(DivergentConfig::load_from_file(&missing).is_err());
    }
}
