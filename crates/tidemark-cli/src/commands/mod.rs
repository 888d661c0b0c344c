use crate::config::{load_config, Config};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidemark_application::loader::{DedupLoader, LoadMode, LoaderConfig, LoaderSink};
use tidemark_application::orchestrator::{
    build_jobs, CancelFlag, JobFilter, Orchestrator, OrchestratorConfig,
};
use tidemark_application::verifier::{verify, VerifySource};
use tidemark_domain::entities::job::{RunStatus, RunSummary};
use tidemark_domain::repositories::sink::RecordSink;
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_infrastructure::persistence::questdb::QuestdbBarStore;
use tidemark_infrastructure::providers::binance::BinanceAdapter;
use tidemark_infrastructure::providers::fmp::FmpAdapter;
use tidemark_infrastructure::providers::build_client;
use tidemark_infrastructure::registry::load_registry;
use tidemark_infrastructure::sink::csv::CsvSink;
use tidemark_infrastructure::sink::parquet::ParquetSink;
use tidemark_domain::value_objects::timeframe::Timeframe;

#[derive(Debug, Default)]
pub struct CrawlOptions {
    pub symbol: Option<String>,
    pub priority: Option<i32>,
    pub limit: Option<usize>,
    pub years: Option<u32>,
    pub mode: Option<String>,
}

pub enum Command {
    Crawl {
        config: PathBuf,
        options: CrawlOptions,
    },
    Load {
        config: PathBuf,
        mode: Option<String>,
        symbol: Option<String>,
    },
    Verify {
        config: PathBuf,
        symbol: Option<String>,
    },
    Run {
        config: PathBuf,
        options: CrawlOptions,
    },
    InitDb {
        config: PathBuf,
    },
}

/// How a crawl or run behaves end to end. Test mode is incremental with the
/// job list capped, for smoke-testing credentials and connectivity cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Full,
    Incremental,
    Test,
}

impl RunMode {
    fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "test" => Ok(Self::Test),
            other => Err(format!(
                "unsupported mode '{other}' (expected full, incremental or test)"
            )),
        }
    }

    fn load_mode(self) -> LoadMode {
        match self {
            Self::Full => LoadMode::Full,
            Self::Incremental | Self::Test => LoadMode::Incremental,
        }
    }
}

pub fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Crawl { config, options } => run_crawl(config, options),
        Command::Load {
            config,
            mode,
            symbol,
        } => run_load(config, mode, symbol),
        Command::Verify { config, symbol } => run_verify(config, symbol),
        Command::Run { config, options } => run_pipeline(config, options),
        Command::InitDb { config } => run_init_db(config),
    }
}

fn setup(config_path: &PathBuf) -> Result<Config, String> {
    let config = load_config(config_path)?;
    crate::obs::init_tracing(&config.log.level, &config.log.format)?;
    Ok(config)
}

fn resolve_mode(config: &Config, requested: Option<&str>) -> Result<RunMode, String> {
    match requested {
        Some(value) => RunMode::parse(value),
        None => RunMode::parse(&config.run.mode),
    }
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator, String> {
    let mut orchestrator = Orchestrator::new(OrchestratorConfig {
        workers: config.run.workers,
        max_transient_retries: config.run.max_transient_retries,
        max_rate_limit_waits: config.run.max_rate_limit_waits,
        backoff_base_ms: config.run.backoff_base_ms,
        backoff_cap_ms: config.run.backoff_cap_ms,
    });

    let fmp = &config.providers.fmp;
    let api_key = std::env::var(&fmp.api_key_env)
        .map_err(|_| format!("environment variable {} is not set", fmp.api_key_env))?;
    let fmp_client = build_client(fmp.timeout_secs)?;
    orchestrator.register_adapter(
        &[AssetClass::Equity, AssetClass::Etf, AssetClass::Commodity],
        Arc::new(FmpAdapter::new(fmp_client, fmp.base_url.clone(), api_key)),
        Duration::from_millis(fmp.min_interval_ms),
    );

    let binance = &config.providers.binance;
    let binance_client = build_client(binance.timeout_secs)?;
    orchestrator.register_adapter(
        &[AssetClass::Crypto],
        Arc::new(BinanceAdapter::new(binance_client, binance.base_url.clone())),
        Duration::from_millis(binance.min_interval_ms),
    );

    Ok(orchestrator)
}

fn build_store(config: &Config) -> Result<Arc<QuestdbBarStore>, String> {
    Ok(Arc::new(QuestdbBarStore::new(
        config.store.db_url.clone(),
        config.store.table.clone(),
        config.store.pool_max_size,
    )?))
}

fn build_loader(config: &Config) -> Result<Arc<DedupLoader>, String> {
    let store = build_store(config)?;
    Ok(Arc::new(DedupLoader::new(
        store,
        LoaderConfig {
            write_retries: config.store.write_retries,
            fallback_to_full: config.store.fallback_to_full,
        },
    )))
}

fn job_filter(options: &CrawlOptions, mode: RunMode) -> JobFilter {
    let mut filter = JobFilter {
        symbol: options.symbol.clone(),
        max_priority: options.priority,
        limit: options.limit,
        override_years: options.years,
    };
    if mode == RunMode::Test {
        filter.limit = Some(filter.limit.unwrap_or(2).min(2));
        filter.override_years = Some(filter.override_years.unwrap_or(1).min(1));
    }
    filter
}

fn execute_crawl(
    config: &Config,
    options: &CrawlOptions,
    mode: RunMode,
    extra_sinks: Vec<Arc<dyn RecordSink>>,
) -> Result<RunSummary, String> {
    let registry_path = PathBuf::from(&config.registry.path);
    let descriptors = load_registry(&registry_path)?;
    let jobs = build_jobs(&descriptors, &job_filter(options, mode), Utc::now());
    if jobs.is_empty() {
        return Err("no jobs selected (check --symbol / --priority filters)".to_string());
    }
    println!(
        "tidemark: crawling {} jobs with {} workers (mode={:?})",
        jobs.len(),
        config.run.workers,
        mode
    );

    let orchestrator = build_orchestrator(config)?;
    let mut sinks: Vec<Arc<dyn RecordSink>> = vec![
        Arc::new(CsvSink::new(&config.paths.data_dir)),
        Arc::new(ParquetSink::new(&config.paths.data_dir)?),
    ];
    sinks.extend(extra_sinks);

    let summary = orchestrator.run(jobs, &sinks, &CancelFlag::new());
    print_summary(&summary);
    Ok(summary)
}

fn check_status(config: &Config, summary: &RunSummary) -> Result<(), String> {
    match summary.status(config.run.min_success_ratio) {
        RunStatus::Passed => Ok(()),
        RunStatus::Failed => Err(format!(
            "run failed: success ratio {:.2} below minimum {:.2}",
            summary.success_ratio(),
            config.run.min_success_ratio
        )),
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "summary: succeeded={} skipped={} failed={} ratio={:.2}",
        summary.successes(),
        summary.skipped(),
        summary.failed(),
        summary.success_ratio()
    );
    for outcome in summary.outcomes() {
        if let tidemark_domain::entities::job::JobOutcome::Failed {
            symbol,
            timeframe,
            reason,
        } = outcome
        {
            println!("  failed {}/{}: {}", symbol, timeframe.label(), reason);
        }
    }
}

fn run_crawl(config_path: PathBuf, options: CrawlOptions) -> Result<(), String> {
    let config = setup(&config_path)?;
    let mode = resolve_mode(&config, options.mode.as_deref())?;
    let summary = execute_crawl(&config, &options, mode, Vec::new())?;
    check_status(&config, &summary)
}

fn run_load(
    config_path: PathBuf,
    mode: Option<String>,
    symbol: Option<String>,
) -> Result<(), String> {
    let config = setup(&config_path)?;
    let mode = resolve_mode(&config, mode.as_deref())?;
    let loader = build_loader(&config)?;
    let csv = CsvSink::new(&config.paths.data_dir);

    let partitions: Vec<(String, Timeframe)> = csv
        .partitions()?
        .into_iter()
        .filter(|(s, _)| match &symbol {
            Some(wanted) => s.eq_ignore_ascii_case(wanted),
            None => true,
        })
        .collect();
    if partitions.is_empty() {
        return Err(format!(
            "no CSV partitions found under {}",
            config.paths.data_dir
        ));
    }

    let mut inserted = 0u64;
    let mut skipped = 0u64;
    for (partition_symbol, timeframe) in &partitions {
        let records = csv.read_partition(partition_symbol, *timeframe)?;
        let report = loader
            .load(mode.load_mode(), &records)
            .map_err(|err| format!("{partition_symbol}/{timeframe}: {err}"))?;
        inserted += report.inserted;
        skipped += report.skipped;
    }
    println!(
        "tidemark: loaded {} partitions (inserted={} skipped={})",
        partitions.len(),
        inserted,
        skipped
    );
    Ok(())
}

fn run_verify(config_path: PathBuf, symbol: Option<String>) -> Result<(), String> {
    let config = setup(&config_path)?;
    run_verify_with(&config, symbol)
}

fn run_pipeline(config_path: PathBuf, options: CrawlOptions) -> Result<(), String> {
    let config = setup(&config_path)?;
    let mode = resolve_mode(&config, options.mode.as_deref())?;
    let loader = build_loader(&config)?;
    let loader_sink: Arc<dyn RecordSink> = Arc::new(LoaderSink::new(loader, mode.load_mode()));

    let summary = execute_crawl(&config, &options, mode, vec![loader_sink])?;
    check_status(&config, &summary)?;

    // Crawl passed; audit that all three surfaces agree on what landed.
    run_verify_with(&config, options.symbol.clone())
}

fn run_verify_with(config: &Config, symbol: Option<String>) -> Result<(), String> {
    let csv = Arc::new(CsvSink::new(&config.paths.data_dir));
    let parquet = Arc::new(ParquetSink::new(&config.paths.data_dir)?);
    let store = build_store(config)?;

    // Audit the union of both file trees: a partition present in only one of
    // them is itself a divergence worth reporting.
    let mut partitions = csv.partitions()?;
    for partition in parquet.partitions()? {
        if !partitions.contains(&partition) {
            partitions.push(partition);
        }
    }
    partitions.retain(|(s, _)| match &symbol {
        Some(wanted) => s.eq_ignore_ascii_case(wanted),
        None => true,
    });
    partitions.sort();
    if partitions.is_empty() {
        return Err("no partitions to verify".to_string());
    }
    let sources = [
        VerifySource::new("csv", csv),
        VerifySource::new("parquet", parquet),
        VerifySource::new("database", store),
    ];
    let report = verify(&partitions, &sources, config.run.verify_tolerance_rows)
        .map_err(|err| err.to_string())?;
    println!(
        "tidemark: verified {} partitions, {} divergences",
        report.partitions_checked,
        report.divergences.len()
    );
    for divergence in &report.divergences {
        println!("  {divergence}");
    }
    if report.is_consistent() {
        Ok(())
    } else {
        Err(format!(
            "verification found {} divergences",
            report.divergences.len()
        ))
    }
}

fn run_init_db(config_path: PathBuf) -> Result<(), String> {
    let config = setup(&config_path)?;
    let store = build_store(&config)?;
    store.install_schema()?;
    println!("tidemark: schema installed into {}", config.store.table);
    Ok(())
}
