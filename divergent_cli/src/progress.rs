use divergent_core::archive::ArchiveState;
use divergent_core::oracle::Outcome;
use divergent_core::runner::RunResult;
use divergent_core::session::{ProgressView, SessionAggregator};
use std::fmt::Write as _;
use std::time::Duration;

/// Line-oriented presenter for a running session. Everything it prints is
/// derived from the aggregator; it keeps no counters of its own.
#[derive(Debug, Clone)]
pub struct ProgressPresenter {
    every: u64,
}

impl ProgressPresenter {
    /// Reports roughly twenty times per session, and at least every trial for short ones.
    pub fn for_total(total_trials: u64) -> Self {
        Self {
            every: (total_trials / 20).max(1),
        }
    }

    pub fn should_report(&self, view: &ProgressView) -> bool {
        view.current_trial > 0
            && (view.current_trial % self.every == 0 || view.current_trial == view.total_trials)
    }

    pub fn progress_line(view: &ProgressView) -> String {
        let eta = view
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "--".to_string());
        format!(
            "[{}/{} {:.1}%] bugs: {}, failed trials: {}, {:.2} trials/s, elapsed {}, eta {}",
            view.current_trial,
            view.total_trials,
            view.percent(),
            view.total_bugs,
            view.failed_trials,
            view.rate,
            format_duration(view.elapsed),
            eta
        )
    }

    pub fn bug_line(result: &RunResult) -> String {
        let location = match result.archive() {
            ArchiveState::Archived(path) => format!("saved to {}", path.display()),
            ArchiveState::Failed(reason) => format!("NOT saved: {reason}"),
            ArchiveState::Pending | ArchiveState::NotRequired => "not archived".to_string(),
        };
        format!(
            "{} in '{}' vs '{}' ({}): {}",
            result.outcome,
            result.target,
            result.reference,
            first_line(result.input.statement()),
            location
        )
    }

    /// Per-target outcome table followed by the most recent results.
    pub fn summary(session: &SessionAggregator) -> String {
        let mut out = String::new();
        let width = session
            .stats()
            .keys()
            .map(String::len)
            .chain(std::iter::once("target".len()))
            .max()
            .unwrap_or(0);

        let _ = write!(out, "{:<width$}", "target");
        for outcome in Outcome::ALL {
            let _ = write!(out, " {:>15}", outcome.as_str());
        }
        out.push('\n');
        for (label, counts) in session.stats() {
            let _ = write!(out, "{label:<width$}");
            for (_, count) in counts.iter() {
                let _ = write!(out, " {count:>15}");
            }
            out.push('\n');
        }

        let _ = writeln!(
            out,
            "\n{} trials ({} failed) in {}, {} bugs",
            session.current_trial(),
            session.failed_trials(),
            format_duration(session.elapsed()),
            session.total_bugs()
        );

        let recent: Vec<&RunResult> = session.history().filter(|r| r.outcome != Outcome::Pass).collect();
        if !recent.is_empty() {
            let _ = writeln!(out, "\nRecent findings:");
            for result in recent {
                let _ = writeln!(out, "  {}", Self::bug_line(result));
            }
        }
        out
    }
}

fn first_line(statement: &str) -> String {
    const MAX: usize = 60;
    let line = statement.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() > MAX {
        let cut: String = line.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
