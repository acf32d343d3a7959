use anyhow::bail;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use inquire::{Confirm, CustomType, Select, Text};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use weather_pipeline_core::{
    Batch, Config, Mode, PipelineError, PipelineRunner, RunOutcome, SchemaVariant,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-pipeline", version, about = "Hourly weather feature pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the observation and forecast batches once and upsert them.
    Run {
        /// Run date (YYYY-MM-DD); today in UTC when absent.
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Build and print the batches without writing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Trigger a run now and then once per period until interrupted.
    Schedule {
        /// Hours between runs, at most one year.
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..=8760))]
        period_hours: u64,
    },

    /// Interactively edit the configuration file.
    Configure,

    /// Print the effective configuration and where it is stored.
    ShowConfig,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Run { today, dry_run } => {
                let runner = PipelineRunner::from_config(&Config::load()?)?;
                let today = today.unwrap_or_else(|| chrono::Utc::now().date_naive());

                if dry_run {
                    dry_run_once(&runner, today).await
                } else {
                    run_once(&runner, today).await
                }
            }
            Command::Schedule { period_hours } => {
                let runner = PipelineRunner::from_config(&Config::load()?)?;
                schedule(&runner, Duration::from_secs(period_hours * 3600)).await
            }
            Command::Configure => configure(),
            Command::ShowConfig => {
                let path = Config::config_file_path()?;
                let config = Config::load()?;
                println!("# {}", path.display());
                println!("# store: {}", config.resolved_store_dir()?.display());
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }
}

async fn run_once(runner: &PipelineRunner, today: NaiveDate) -> anyhow::Result<()> {
    let outcome = runner.run_for(today).await;
    print_outcome(&outcome);

    let rejected = outcome.failures().len();
    let failed = rejected + drain(outcome).await;

    if failed > 0 {
        bail!("{failed} of 2 batches were not written for {today}");
    }
    Ok(())
}

async fn dry_run_once(runner: &PipelineRunner, today: NaiveDate) -> anyhow::Result<()> {
    let (observations, forecast) = runner.assemble_for(today).await;
    let mut failed = 0;

    for (mode, result) in [(Mode::Observation, observations), (Mode::Forecast, forecast)] {
        match result {
            Ok(batch) => print_batch(mode, &batch, None),
            Err(e) => {
                failed += 1;
                print_failure(mode, &e);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of 2 batches could not be built for {today}");
    }
    Ok(())
}

/// Trigger runs on a fixed period. A failed run is reported and the next
/// tick is its retry.
async fn schedule(runner: &PipelineRunner, period: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        period_secs = period.as_secs(),
        cities = runner.cities().len(),
        variant = %runner.variant(),
        observation_days_ago = runner.offsets().observation_days_ago,
        forecast_days_ahead = runner.offsets().forecast_days_ahead,
        "Scheduler started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = runner.run().await;
                print_outcome(&outcome);
                let today = outcome.today;
                let rejected = outcome.failures().len();
                let failed = rejected + drain(outcome).await;
                if failed > 0 {
                    tracing::warn!(%today, failed, "Run incomplete, waiting for next trigger");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping scheduler");
                return Ok(());
            }
        }
    }
}

/// Wait for submitted insert jobs so the process does not exit under them.
/// Returns how many of them failed.
async fn drain(outcome: RunOutcome) -> usize {
    let mut failed = 0;
    for (mode, job) in outcome.into_jobs() {
        let id = job.id();
        match job.wait().await {
            Ok(total) => tracing::debug!(job_id = id, %mode, total_rows = total, "Insert job drained"),
            Err(e) => {
                failed += 1;
                tracing::warn!(job_id = id, %mode, error = %e, "Insert job failed");
                println!("  {mode:<11} FAILED (store): insert job {id}: {e}");
            }
        }
    }
    failed
}

fn print_outcome(outcome: &RunOutcome) {
    println!("Run for {}:", outcome.today);
    for (mode, result) in [
        (Mode::Observation, &outcome.observations),
        (Mode::Forecast, &outcome.forecast),
    ] {
        match result {
            Ok(submitted) => print_batch(mode, &submitted.batch, Some(submitted.job.id())),
            Err(e) => print_failure(mode, e),
        }
    }
}

fn print_batch(mode: Mode, batch: &Batch, job: Option<u64>) {
    let window = batch
        .range()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "provider default".to_string());
    let job = job.map(|id| format!(", insert job {id}")).unwrap_or_default();

    println!(
        "  {mode:<11} {window}: {} rows from {} cities, {} columns{job}",
        batch.len(),
        batch.cities().len(),
        batch.columns().len(),
    );
}

fn print_failure(mode: Mode, err: &PipelineError) {
    println!("  {mode:<11} FAILED ({}): {err}", err.kind());
}

fn configure() -> anyhow::Result<()> {
    let mut config = Config::load()?;

    let variants = SchemaVariant::all().to_vec();
    let cursor = variants
        .iter()
        .position(|v| *v == config.variant)
        .unwrap_or_default();
    config.variant = Select::new("Schema variant:", variants)
        .with_starting_cursor(cursor)
        .prompt()?;

    let cities = Text::new("Cities, comma separated (use _ for spaces):")
        .with_default(&config.cities.join(","))
        .prompt()?;
    config.cities = parse_cities(&cities);

    let name = Text::new("Feature group name:")
        .with_default(&config.feature_group.name)
        .prompt()?;
    config.feature_group.name = name;
    config.feature_group.version = CustomType::<u32>::new("Feature group version:")
        .with_default(config.feature_group.version)
        .prompt()?;

    config.concurrent_fetch = Confirm::new("Fetch cities concurrently?")
        .with_default(config.concurrent_fetch)
        .prompt()?;

    config.validate()?;
    config.save()?;

    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

fn parse_cities(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| c.replace(' ', "_"))
        .collect()
}
