//! reconciled: demo daemon driving a controller from a channel source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use reconcile_rs::config::{Config, ControllerConfig};
use reconcile_rs::source::Channel;
use reconcile_rs::telemetry::{TelemetryConfig, init_telemetry};
use reconcile_rs::{Context, Controller, Options, ReconcileError, ReconcileResult, Reconciler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "reconciled", about = "Run a demo reconciliation controller")]
struct Cli {
    /// Controller config (TOML). Flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Controller name
    #[arg(long, default_value = "demo")]
    name: String,
    /// Number of concurrent workers
    #[arg(long)]
    concurrency: Option<usize>,
    /// Number of distinct work items to cycle through
    #[arg(long, default_value_t = 16)]
    items: u32,
    /// Interval between synthetic change notifications (ms)
    #[arg(long, default_value_t = 250)]
    interval_ms: u64,
}

/// Toy reconciler: item numbers divisible by 5 fail once before succeeding,
/// multiples of 7 ask to be looked at again later, 13 is unrecoverable.
struct Demo {
    seen: std::sync::Mutex<std::collections::HashSet<u32>>,
}

#[async_trait]
impl Reconciler<u32> for Demo {
    async fn reconcile(
        &self,
        ctx: Context,
        item: u32,
    ) -> Result<ReconcileResult, ReconcileError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first_time = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(item);

        info!(item, reconcile_id = ?ctx.reconcile_id(), "reconciling");
        match item {
            13 => Err(ReconcileError::terminal(format!("item {item} is unrecoverable"))),
            n if n % 5 == 0 && first_time => Err(ReconcileError::new(format!(
                "item {n} failed on first attempt"
            ))),
            n if n % 7 == 0 => Ok(ReconcileResult::requeue_after(Duration::from_secs(2))),
            _ => Ok(ReconcileResult::done()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reconciled".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut controller_config = match &cli.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::named(&cli.name),
    };
    if let Some(n) = cli.concurrency {
        controller_config.max_concurrent_reconciles = n;
    }
    controller_config.validate()?;

    let reconciler: Arc<dyn Reconciler<u32>> = Arc::new(Demo {
        seen: Default::default(),
    });
    let controller = Controller::new(Options::from_config(&controller_config, reconciler))?;

    let (tx, rx) = mpsc::channel(64);
    controller.watch(Channel::new("ticker", rx)).await?;

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            ctx.cancel();
        });
    }
    {
        let ctx = ctx.clone();
        let items = cli.items.max(1);
        let interval = Duration::from_millis(cli.interval_ms);
        tokio::spawn(async move {
            let mut next = 0u32;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if tx.send(next % items).await.is_err() {
                            break;
                        }
                        next = next.wrapping_add(1);
                    }
                }
            }
        });
    }

    info!(controller = controller.name(), "running until interrupted");
    controller.start(ctx).await?;
    Ok(())
}
