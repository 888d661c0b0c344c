pub mod backoff;
pub mod pacer;

use crate::orchestrator::backoff::Backoff;
use crate::orchestrator::pacer::ProviderPacer;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_domain::entities::job::{CrawlJob, JobOutcome, JobStatus, RunSummary};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::repositories::source::{CrawlControl, FetchError, FetchRequest, SourceAdapter};
use tidemark_domain::services::enrich::finalize_window;
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::symbol::SymbolDescriptor;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub max_transient_retries: u32,
    pub max_rate_limit_waits: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_transient_retries: 3,
            max_rate_limit_waits: 10,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

/// Run-level cancellation: stops new job scheduling, lets in-flight fetches
/// finish their current page.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }
}

impl CrawlControl for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Control handed to adapters during a run: cancellation from the shared
/// flag, throttling from the provider's pacer. Every outbound request an
/// adapter makes reserves its own pacer slot through this.
struct PacedControl<'a> {
    cancel: &'a CancelFlag,
    pacer: Option<&'a ProviderPacer>,
}

impl CrawlControl for PacedControl<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn throttle(&self) {
        if let Some(pacer) = self.pacer {
            pacer.wait();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub symbol: Option<String>,
    pub max_priority: Option<i32>,
    pub limit: Option<usize>,
    pub override_years: Option<u32>,
}

/// Cross product of registry entries and their timeframes, ascending by
/// priority. One job per (symbol, timeframe) partition, which is what makes
/// sink writes single-writer-per-partition.
pub fn build_jobs(
    descriptors: &[SymbolDescriptor],
    filter: &JobFilter,
    now: DateTime<Utc>,
) -> Vec<CrawlJob> {
    let mut selected: Vec<&SymbolDescriptor> = descriptors
        .iter()
        .filter(|d| match &filter.symbol {
            Some(symbol) => d.symbol.eq_ignore_ascii_case(symbol),
            None => true,
        })
        .filter(|d| match filter.max_priority {
            Some(max) => d.priority <= max,
            None => true,
        })
        .collect();
    selected.sort_by_key(|d| d.priority);
    if let Some(limit) = filter.limit {
        selected.truncate(limit);
    }

    let mut jobs = Vec::new();
    for descriptor in selected {
        let years = filter.override_years.unwrap_or(descriptor.years).max(1);
        let start = now - ChronoDuration::days(i64::from(years) * 365);
        for timeframe in &descriptor.timeframes {
            jobs.push(CrawlJob::new(descriptor.clone(), *timeframe, start, now));
        }
    }
    jobs
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    adapters: HashMap<AssetClass, Arc<dyn SourceAdapter>>,
    pacers: HashMap<String, Arc<ProviderPacer>>,
    backoff: Backoff,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        );
        Self {
            config,
            adapters: HashMap::new(),
            pacers: HashMap::new(),
            backoff,
        }
    }

    /// Registers `adapter` for the given asset classes and installs a shared
    /// pacer for its provider if one was not registered yet.
    pub fn register_adapter(
        &mut self,
        classes: &[AssetClass],
        adapter: Arc<dyn SourceAdapter>,
        min_request_interval: Duration,
    ) {
        self.pacers
            .entry(adapter.provider().to_string())
            .or_insert_with(|| Arc::new(ProviderPacer::new(min_request_interval)));
        for class in classes {
            self.adapters.insert(*class, Arc::clone(&adapter));
        }
    }

    /// Drains the job list through a bounded worker pool, feeding finalized
    /// records to every sink. Always runs every job to a terminal state
    /// unless cancelled; the caller decides pass/fail from the summary.
    pub fn run(
        &self,
        mut jobs: Vec<CrawlJob>,
        sinks: &[Arc<dyn RecordSink>],
        cancel: &CancelFlag,
    ) -> RunSummary {
        jobs.sort_by_key(|j| j.descriptor.priority);
        let queue = Mutex::new(VecDeque::from(jobs));
        let summary = Mutex::new(RunSummary::new());

        std::thread::scope(|scope| {
            for _ in 0..self.config.workers.max(1) {
                scope.spawn(|| self.worker(&queue, sinks, cancel, &summary));
            }
        });

        summary
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn worker(
        &self,
        queue: &Mutex<VecDeque<CrawlJob>>,
        sinks: &[Arc<dyn RecordSink>],
        cancel: &CancelFlag,
        summary: &Mutex<RunSummary>,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let job = {
                let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
                queue.pop_front()
            };
            let Some(mut job) = job else {
                return;
            };

            let outcome = self.execute(&mut job, sinks, cancel);
            match &outcome {
                JobOutcome::Success { rows, .. } => {
                    tracing::info!(partition = %job.partition_label(), rows, "job succeeded");
                }
                JobOutcome::Skipped { reason, .. } => {
                    tracing::warn!(partition = %job.partition_label(), reason = %reason, "job skipped");
                }
                JobOutcome::Failed { reason, .. } => {
                    tracing::error!(partition = %job.partition_label(), reason = %reason, "job failed");
                }
            }
            summary
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record(outcome);
        }
    }

    fn execute(
        &self,
        job: &mut CrawlJob,
        sinks: &[Arc<dyn RecordSink>],
        cancel: &CancelFlag,
    ) -> JobOutcome {
        let symbol = job.descriptor.symbol.clone();
        let timeframe = job.timeframe;
        let Some(adapter) = self.adapters.get(&job.descriptor.asset_class) else {
            job.status = JobStatus::Failed;
            return JobOutcome::Failed {
                symbol,
                timeframe,
                reason: format!(
                    "no adapter registered for asset class {}",
                    job.descriptor.asset_class
                ),
            };
        };
        let ctrl = PacedControl {
            cancel,
            pacer: self.pacers.get(adapter.provider()).map(Arc::as_ref),
        };
        let request = FetchRequest {
            descriptor: job.descriptor.clone(),
            timeframe,
            start: job.start,
            end: job.end,
        };

        loop {
            if cancel.is_cancelled() {
                job.status = JobStatus::Failed;
                return JobOutcome::Failed {
                    symbol,
                    timeframe,
                    reason: "run cancelled".to_string(),
                };
            }

            job.status = JobStatus::Fetching;
            match adapter.fetch(&request, &ctrl) {
                Ok(records) => {
                    let records = finalize_window(records);
                    metrics::counter!("tidemark.crawl.records_fetched_total")
                        .increment(records.len() as u64);
                    for sink in sinks {
                        if let Err(err) = sink.write(&records) {
                            job.status = JobStatus::Failed;
                            return JobOutcome::Failed {
                                symbol,
                                timeframe,
                                reason: format!("sink {}: {}", sink.name(), err),
                            };
                        }
                    }
                    job.status = JobStatus::Success;
                    return JobOutcome::Success {
                        symbol,
                        timeframe,
                        rows: records.len(),
                    };
                }
                Err(FetchError::RateLimited(msg)) => {
                    job.rate_limit_waits += 1;
                    if job.rate_limit_waits > self.config.max_rate_limit_waits {
                        job.status = JobStatus::Failed;
                        return JobOutcome::Failed {
                            symbol,
                            timeframe,
                            reason: format!("rate limit persisted after backoff: {msg}"),
                        };
                    }
                    let delay = self.backoff.delay(job.rate_limit_waits);
                    tracing::warn!(
                        partition = %job.partition_label(),
                        wait = job.rate_limit_waits,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    metrics::counter!("tidemark.crawl.rate_limited_total").increment(1);
                    job.status = JobStatus::Backoff;
                    std::thread::sleep(delay);
                }
                Err(FetchError::TransientNetwork(msg)) => {
                    job.transient_retries += 1;
                    if job.transient_retries > self.config.max_transient_retries {
                        job.status = JobStatus::Failed;
                        return JobOutcome::Failed {
                            symbol,
                            timeframe,
                            reason: format!("transient retries exhausted: {msg}"),
                        };
                    }
                    let delay = self.backoff.delay(job.transient_retries);
                    tracing::warn!(
                        partition = %job.partition_label(),
                        retry = job.transient_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "transient error, retrying"
                    );
                    job.status = JobStatus::Backoff;
                    std::thread::sleep(delay);
                }
                Err(FetchError::SymbolNotFound(msg)) => {
                    job.status = JobStatus::Skipped;
                    return JobOutcome::Skipped {
                        symbol,
                        timeframe,
                        reason: msg,
                    };
                }
                Err(err @ FetchError::Authentication(_)) => {
                    // A bad credential fails every remaining job the same
                    // way; stop scheduling new ones.
                    cancel.cancel();
                    job.status = JobStatus::Failed;
                    return JobOutcome::Failed {
                        symbol,
                        timeframe,
                        reason: err.to_string(),
                    };
                }
                Err(err @ FetchError::MalformedResponse(_)) => {
                    job.status = JobStatus::Failed;
                    return JobOutcome::Failed {
                        symbol,
                        timeframe,
                        reason: err.to_string(),
                    };
                }
            }
        }
    }
}
