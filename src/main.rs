use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wordfreq_cluster::broker::client::HttpTransport;
use wordfreq_cluster::broker::handlers::serve;
use wordfreq_cluster::broker::queue::Broker;
use wordfreq_cluster::broker::transport::Transport;
use wordfreq_cluster::cli::{Cli, Command};
use wordfreq_cluster::config::PipelineConfig;
use wordfreq_cluster::pipeline::aggregator::run_aggregator;
use wordfreq_cluster::pipeline::dispatcher::{DispatchReport, run_dispatcher};
use wordfreq_cluster::pipeline::local::run_local;
use wordfreq_cluster::pipeline::worker::run_worker_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging.level, cli.verbose);

    match cli.command {
        Command::Broker { .. } => {
            let bind: SocketAddr = config.broker.bind.parse()?;
            let broker = open_broker(&config).await?;
            serve(bind, broker).await?;
        }
        Command::Worker { .. } => {
            let transport = remote_transport(&config).await?;
            run_worker_pool(transport, &config).await?;
        }
        Command::Aggregator => {
            let transport = remote_transport(&config).await?;
            run_aggregator(transport, &config).await?;
        }
        Command::Dispatch(args) => {
            let transport = remote_transport(&config).await?;
            let report = run_dispatcher(transport, &config, &args.source).await?;
            print_report(&report);
        }
        Command::Run { dispatch, .. } => {
            let broker = open_broker(&config).await?;
            let report = run_local(broker, &config, &dispatch.source).await?;
            print_report(&report);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level, `--verbose` wins over both.
fn init_tracing(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_broker(config: &PipelineConfig) -> anyhow::Result<Arc<Broker>> {
    let broker = match &config.broker.data_dir {
        Some(dir) => Broker::open(dir, config.lease()).await?,
        None => Broker::new(config.lease()),
    };
    Ok(Arc::new(broker))
}

async fn remote_transport(config: &PipelineConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let client = HttpTransport::new(&config.broker.url);
    let health = client.health().await?;
    tracing::info!(
        "Connected to broker at {} ({} queues)",
        client.base_url(),
        health.queues.len()
    );
    Ok(Arc::new(client))
}

fn print_report(report: &DispatchReport) {
    println!(
        "\"{}\": {} units, {} distinct words, {} occurrences",
        report.title,
        report.units,
        report.histogram.len(),
        report.histogram.total_words()
    );
    println!(
        "Wrote {} bytes to {}",
        report.bytes_written,
        report.output_path.display()
    );
}
