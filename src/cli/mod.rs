//! Command-line interface for Tally.
//!
//! Runs an accumulator against a synthetic producer load, logging every
//! closed snapshot, until the duration expires or Ctrl-C is pressed.

use crate::accumulator::{Accumulator, FlushListener, LoggingSink};
use crate::core::{AccumulatorConfig, ConfigBuilder, Result, TallyError};
use crate::metrics::{now_millis, AggregationKind, MetricId, RawTrace};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Sharded interval metrics accumulator
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (YAML)
    #[arg(short, long, env = "TALLY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of shards (default: half the available CPUs)
    #[arg(long)]
    pub shards: Option<usize>,

    /// Flush period in milliseconds, 0 for manual flushing only
    #[arg(long = "flush-period", value_name = "MS")]
    pub flush_period_ms: Option<u64>,

    /// Number of synthetic producer tasks
    #[arg(long, default_value = "4")]
    pub producers: usize,

    /// Number of distinct synthetic metrics
    #[arg(long, default_value = "16")]
    pub metrics: usize,

    /// Traces each producer submits per 10ms tick
    #[arg(long, default_value = "10")]
    pub rate: usize,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, env = "TALLY_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<AccumulatorConfig> {
        let mut builder = ConfigBuilder::new();

        if let Some(path) = &self.config {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                TallyError::config(format!("Failed to read config file {:?}: {}", path, e))
            })?;
            builder = builder.from_yaml(&content)?;
            info!("Loaded configuration from: {:?}", path);
        }

        builder = builder.from_env()?;
        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<AccumulatorConfig> {
        if let Some(shards) = self.shards {
            builder = builder.shard_count(shards);
        }
        if let Some(millis) = self.flush_period_ms {
            builder = builder.flush_period_millis(millis);
        }
        builder.build()
    }

    /// Initialize logging based on configuration.
    pub fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level =
            std::env::var("TALLY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_level = if self.debug {
            "debug"
        } else {
            env_log_level.as_str()
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(self.debug)
            .with_thread_names(true)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TallyError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Logs drop notifications so overload is visible
struct DropReporter;

impl FlushListener for DropReporter {
    fn on_flush_start(&self, _serial: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_flush_end(&self, _serial: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_submission_drops(&self, serial: u64, drops: u64) -> anyhow::Result<()> {
        warn!(serial, drops, "Traces dropped during interval");
        Ok(())
    }
}

/// Execute the Tally command.
pub async fn execute(cli: Cli) -> Result<()> {
    cli.init_logging()?;

    let config = cli.load_config().await?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  Shards: {}", config.shard_count);
        println!("  Queue size: {}", config.queue_size);
        println!("  Batch size: {}", config.batch_size);
        println!("  Flush period: {:?}", config.flush_period);
        println!("  Rejection policy: {}", config.rejection_policy.as_str());
        return Ok(());
    }

    run_synthetic_load(&cli, config).await
}

/// Value for a synthetic trace, shaped for the metric's kind
fn synthetic_trace(id: &Arc<MetricId>) -> Result<RawTrace> {
    const MESSAGES: [&str; 4] = ["ok", "degraded", "retrying", "recovered"];
    let builder = RawTrace::builder(Arc::clone(id)).urgent(fastrand::u8(..) == 0);
    let builder = match id.kind() {
        AggregationKind::LastValue | AggregationKind::Messages => {
            builder.value(MESSAGES[fastrand::usize(..MESSAGES.len())])
        },
        AggregationKind::IntervalCount => builder.value(1),
        AggregationKind::MinMaxAvg | AggregationKind::StickyMinMaxAvg => {
            builder.value(fastrand::f64() * 100.0)
        },
        AggregationKind::Delta | AggregationKind::StickyDelta | AggregationKind::Timestamp => {
            builder.value(now_millis()).temporal(true)
        },
    };
    builder.build()
}

async fn run_synthetic_load(cli: &Cli, config: AccumulatorConfig) -> Result<()> {
    let manual = !config.is_periodic();
    let acc = Arc::new(Accumulator::new(config, Arc::new(LoggingSink::new(false)))?);
    acc.register_flush_listener(Arc::new(DropReporter));
    acc.start()?;

    let ids = (0..cli.metrics.max(1))
        .map(|i| {
            let kind = AggregationKind::ALL[i % AggregationKind::ALL.len()];
            acc.resolve("localhost", "tally", &["synthetic"], &format!("metric{}", i), kind)
        })
        .collect::<Result<Vec<_>>>()?;
    let ids: Arc<[Arc<MetricId>]> = ids.into();

    let producers: Vec<_> = (0..cli.producers)
        .map(|_| {
            let acc = Arc::clone(&acc);
            let ids = Arc::clone(&ids);
            let rate = cli.rate;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(10));
                loop {
                    tick.tick().await;
                    for _ in 0..rate {
                        let id = &ids[fastrand::usize(..ids.len())];
                        match synthetic_trace(id) {
                            Ok(trace) => {
                                acc.submit(trace);
                            },
                            Err(e) => warn!(error = %e, "Synthetic trace rejected"),
                        }
                    }
                }
            })
        })
        .collect();

    info!(
        producers = cli.producers,
        metrics = ids.len(),
        "Synthetic load running, press Ctrl-C to stop"
    );

    let limit = cli.duration.map(Duration::from_secs);
    let until = async move {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping...");
        }
        _ = until => {
            info!("Duration elapsed, stopping...");
        }
    }

    for producer in producers {
        producer.abort();
    }

    let stats = tokio::task::spawn_blocking(move || {
        if manual {
            if let Err(e) = acc.flush() {
                warn!(error = %e, "Final flush failed");
            }
        }
        acc.stop();
        acc.stats()
    })
    .await
    .map_err(|e| TallyError::Io(std::io::Error::other(e)))?;

    println!("{}", serde_yaml::to_string(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["tally"]).unwrap();

        assert_eq!(cli.producers, 4);
        assert_eq!(cli.metrics, 16);
        assert!(cli.shards.is_none());
        assert!(cli.duration.is_none());
        assert!(!cli.check_config);
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli =
            Cli::try_parse_from(["tally", "--shards", "3", "--flush-period", "0"]).unwrap();
        let config = cli.build_config_from_args(ConfigBuilder::new()).unwrap();

        assert_eq!(config.shard_count, 3);
        assert!(!config.is_periodic());
    }

    #[test]
    fn test_cli_rejects_zero_shards() {
        let cli = Cli::try_parse_from(["tally", "--shards", "0"]).unwrap();
        assert!(cli.build_config_from_args(ConfigBuilder::new()).is_err());
    }

    #[test]
    fn test_synthetic_trace_matches_kind() {
        let registry = crate::metrics::MetricRegistry::new(1);
        for kind in AggregationKind::ALL {
            let id = registry
                .resolve("h", "a", &["synthetic"], kind.as_str(), kind)
                .unwrap();
            let trace = synthetic_trace(&id).unwrap();
            assert!(kind.accepts(trace.value()), "{} rejected its own value", kind);
        }
    }
}
