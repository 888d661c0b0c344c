use crate::value_objects::symbol::SymbolDescriptor;
use crate::value_objects::timeframe::Timeframe;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Fetching,
    Backoff,
    Success,
    Skipped,
    Failed,
}

/// One unit of crawl work: a (symbol, timeframe, date range) partition.
/// Rate-limit waits and transient retries keep independent counters so a
/// provider-wide rate limit does not exhaust the transient budget.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub descriptor: SymbolDescriptor,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: JobStatus,
    pub transient_retries: u32,
    pub rate_limit_waits: u32,
}

impl CrawlJob {
    pub fn new(
        descriptor: SymbolDescriptor,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            descriptor,
            timeframe,
            start,
            end,
            status: JobStatus::Pending,
            transient_retries: 0,
            rate_limit_waits: 0,
        }
    }

    pub fn partition_label(&self) -> String {
        format!("{}/{}", self.descriptor.symbol, self.timeframe.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success {
        symbol: String,
        timeframe: Timeframe,
        rows: usize,
    },
    Skipped {
        symbol: String,
        timeframe: Timeframe,
        reason: String,
    },
    Failed {
        symbol: String,
        timeframe: Timeframe,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Per-run record of every job's terminal outcome. Skipped jobs (unknown
/// symbols) count toward neither success nor failure.
#[derive(Debug, Default)]
pub struct RunSummary {
    outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: JobOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    pub fn successes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Success { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Failed { .. }))
            .count()
    }

    pub fn success_ratio(&self) -> f64 {
        let decided = self.outcomes.len() - self.skipped();
        if decided == 0 {
            return 1.0;
        }
        self.successes() as f64 / decided as f64
    }

    pub fn status(&self, min_success_ratio: f64) -> RunStatus {
        if self.success_ratio() >= min_success_ratio {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        }
    }
}
