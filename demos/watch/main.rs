use clap::Parser;
use srvwatch::health::{self, Health};
use srvwatch::registry::Registry;
use srvwatch::sources::dns::{DnsSource, DnsSourceConfig};
use srvwatch::target::Target;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::format::FmtSpan;

/// Watches the endpoints behind one DNS SRV name, printing each change.
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Symbolic service name, e.g. "grpc"
    pub service: String,

    /// Transport protocol, e.g. "tcp"
    pub protocol: String,

    /// Domain the service lives under
    pub dns_name: String,

    /// DNS servers to query. Defaults to the system configuration.
    #[clap(long = "name-server")]
    pub name_servers: Vec<SocketAddr>,

    #[clap(long, default_value_t = 1000)]
    pub poll_period_ms: u64,

    /// Log at DEBUG rather than INFO
    #[clap(long, short = 'v')]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (events, max_level) = if args.verbose {
        (FmtSpan::ENTER, tracing::Level::DEBUG)
    } else {
        (FmtSpan::NONE, tracing::Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_span_events(events)
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();

    let source = Arc::new(DnsSource::new(DnsSourceConfig {
        name_servers: args.name_servers,
        poll_period: Duration::from_millis(args.poll_period_ms),
        ..Default::default()
    })?);
    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new(source, shutdown.clone()).unwrap_or_else(|err| {
        eprintln!("{err}; continuing without probes");
        err.into_inner()
    }));

    let health = Health::new();
    health.set_serving(health::SERVICE_NAME);

    tokio::task::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    let target = Target::srv(&args.service, &args.protocol, &args.dns_name);
    let (mut sink, mut snapshots) = mpsc::channel(1);
    let watch = tokio::task::spawn({
        let registry = registry.clone();
        async move { registry.watch(&target, &mut sink).await }
    });

    while let Some(snapshot) = snapshots.recv().await {
        println!("--- {} endpoint(s)", snapshot.len());
        for endpoint in &snapshot {
            println!("{endpoint}");
        }
    }

    let reason = watch.await?;
    health.set_not_serving(health::SERVICE_NAME);
    registry.terminate().await;
    eprintln!("Stopped watching: {reason} ({:?})", reason.code());
    Ok(())
}
