use crate::archive::{BugArchiver, Reproducer};
use crate::oracle::Outcome;
use crate::runner::RunResult;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const DEFAULT_HISTORY_CAPACITY: usize = 12;

/// Per-outcome counters for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    counts: [u64; Outcome::ALL.len()],
}

impl OutcomeCounts {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts[outcome.index()]
    }

    pub fn increment(&mut self, outcome: Outcome) {
        self.counts[outcome.index()] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn bugs(&self) -> u64 {
        Outcome::ALL
            .into_iter()
            .filter(Outcome::is_bug)
            .map(|outcome| self.get(outcome))
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Outcome, u64)> + '_ {
        Outcome::ALL.into_iter().map(|outcome| (outcome, self.get(outcome)))
    }
}

pub type SessionStats = BTreeMap<String, OutcomeCounts>;

/// What one call to [`SessionAggregator::record`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub recorded: usize,
    pub bugs: usize,
    pub archived: Vec<PathBuf>,
    pub archive_failures: Vec<String>,
}

/// Snapshot of session progress. Plain numbers; presentation is up to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub current_trial: u64,
    pub total_trials: u64,
    pub failed_trials: u64,
    pub total_bugs: u64,
    pub elapsed: Duration,
    /// Trials per second, zero until the first trial completes.
    pub rate: f64,
    /// `None` while the rate is unknown.
    pub eta: Option<Duration>,
}

impl ProgressView {
    pub fn percent(&self) -> f64 {
        if self.total_trials == 0 {
            return 0.0;
        }
        self.current_trial as f64 * 100.0 / self.total_trials as f64
    }
}

/// Owns all per-session state: counters, the recent-results history and the
/// trial clock. Results flow in through [`record`](Self::record) only.
#[derive(Debug)]
pub struct SessionAggregator {
    labels: Vec<String>,
    stats: SessionStats,
    history: VecDeque<RunResult>,
    history_capacity: usize,
    current_trial: u64,
    total_trials: u64,
    failed_trials: u64,
    started: Option<Instant>,
}

impl SessionAggregator {
    pub fn new(target_labels: impl IntoIterator<Item = impl Into<String>>, history_capacity: usize) -> Self {
        let labels: Vec<String> = target_labels.into_iter().map(Into::into).collect();
        let mut aggregator = Self {
            labels,
            stats: SessionStats::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            current_trial: 0,
            total_trials: 0,
            failed_trials: 0,
            started: None,
        };
        aggregator.reset_stats();
        aggregator
    }

    fn reset_stats(&mut self) {
        self.stats = self
            .labels
            .iter()
            .map(|label| (label.clone(), OutcomeCounts::default()))
            .collect();
    }

    /// Zeroes every counter and clears the history.
    pub fn reset(&mut self) {
        self.reset_stats();
        self.history.clear();
        self.current_trial = 0;
        self.failed_trials = 0;
    }

    /// Starts a new session: resets all state and restarts the clock.
    pub fn begin(&mut self, total_trials: u64) {
        self.reset();
        self.total_trials = total_trials;
        self.started = Some(Instant::now());
        info!(total_trials, targets = self.labels.len(), "session started");
    }

    /// Records the results of one trial, archiving every bug outcome.
    ///
    /// The archive state is settled on the caller's results; the history only
    /// keeps copies. Archive failures are stored on the result and never propagated.
    pub fn record(&mut self, results: &mut [RunResult], archiver: &mut dyn BugArchiver) -> RecordSummary {
        self.current_trial += 1;
        let mut summary = RecordSummary::default();

        for result in results.iter_mut() {
            self.stats
                .entry(result.target.clone())
                .or_default()
                .increment(result.outcome);
            summary.recorded += 1;

            if result.outcome.is_bug() {
                summary.bugs += 1;
                let saved = archiver
                    .save_reproducer(&Reproducer::from_run(result))
                    .map_err(|e| e.to_string());
                match &saved {
                    Ok(path) => {
                        info!(label = %result.target, outcome = %result.outcome, path = %path.display(), "reproducer saved");
                        summary.archived.push(path.clone());
                    }
                    Err(reason) => {
                        error!(label = %result.target, outcome = %result.outcome, %reason, "failed to save reproducer");
                        summary.archive_failures.push(reason.clone());
                    }
                }
                result.settle_archive(saved);
            }

            self.push_history(result.clone());
        }
        summary
    }

    /// Counts a trial that was aborted before producing results.
    pub fn note_failed_trial(&mut self) {
        self.current_trial += 1;
        self.failed_trials += 1;
    }

    fn push_history(&mut self, result: RunResult) {
        if self.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(result);
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn counts(&self, label: &str) -> Option<&OutcomeCounts> {
        self.stats.get(label)
    }

    /// Most recent results, oldest first.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &RunResult> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub fn current_trial(&self) -> u64 {
        self.current_trial
    }

    pub fn total_trials(&self) -> u64 {
        self.total_trials
    }

    pub fn failed_trials(&self) -> u64 {
        self.failed_trials
    }

    pub fn total_bugs(&self) -> u64 {
        self.stats.values().map(OutcomeCounts::bugs).sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn progress(&self) -> ProgressView {
        self.progress_with_elapsed(self.elapsed())
    }

    pub fn progress_with_elapsed(&self, elapsed: Duration) -> ProgressView {
        let secs = elapsed.as_secs_f64();
        let rate = if self.current_trial > 0 && secs > 0.0 {
            self.current_trial as f64 / secs
        } else {
            0.0
        };
        let eta = (rate > 0.0).then(|| {
            let remaining = self.total_trials.saturating_sub(self.current_trial);
            Duration::from_secs_f64(remaining as f64 / rate)
        });
        ProgressView {
            current_trial: self.current_trial,
            total_trials: self.total_trials,
            failed_trials: self.failed_trials,
            total_bugs: self.total_bugs(),
            elapsed,
            rate,
            eta,
        }
    }
}
