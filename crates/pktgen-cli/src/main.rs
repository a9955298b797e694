//! pktgen
//!
//! Saturates one NIC queue with identical UDP frames over an AF_XDP socket.

mod config;

use clap::Parser;
use std::path::PathBuf;

use config::Config;

/// pktgen - AF_XDP UDP packet generator
#[derive(Parser, Debug)]
#[command(name = "pktgen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Destination host (IP address or name)
    #[arg(required = true)]
    host: String,

    /// Destination UDP port
    #[arg(short, long, required = true)]
    port: u16,

    /// Print throughput once per second
    #[arg(short, long)]
    verbose: bool,

    /// Fill the payload with random bytes
    #[arg(short, long)]
    random_buffer: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NIC queue to transmit on (overrides the config file)
    #[arg(short, long)]
    queue: Option<u32>,
}

/// Initialize logging; `RUST_LOG` wins over the CLI and config levels.
fn init_tracing(verbose: bool, config: &Config) {
    use tracing_subscriber::EnvFilter;

    let fallback = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;
    init_tracing(cli.verbose, &config);

    run(cli, config).await
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    let _ = Cli::parse();
    anyhow::bail!("pktgen requires Linux AF_XDP sockets")
}

/// Resolve the path to `dest` and serialize the frame every slot will carry.
///
/// Nothing is serialized unless resolution succeeds.
#[cfg(target_os = "linux")]
fn prepare<T, P>(
    resolver: &pktgen_core::Resolver<T, P>,
    dest: std::net::IpAddr,
    port: u16,
    payload_size: usize,
    mode: pktgen_core::PayloadMode,
) -> anyhow::Result<(pktgen_core::Resolution, pktgen_core::FrameTemplate)>
where
    T: pktgen_transport::RouteTables,
    P: pktgen_transport::PortAllocator,
{
    use anyhow::Context;
    use pktgen_core::frame::ETHERNET_HEADER_LEN;
    use pktgen_core::{FrameTemplate, Payload};

    let resolution = resolver
        .resolve(dest, port)
        .context("route resolution failed")?;
    tracing::info!(
        interface = %resolution.interface,
        ifindex = resolution.ifindex,
        next_hop = %resolution.next_hop,
        "Resolved {}",
        resolution.addresses
    );

    let payload = Payload::new(payload_size, mode).context("payload construction failed")?;
    let frame = FrameTemplate::build(
        &resolution.addresses,
        resolution.addresses.ip_version(),
        payload.as_bytes(),
    )
    .context("frame serialization failed")?;

    if let Some(mtu) = resolution.mtu {
        let l3 = frame.len() - ETHERNET_HEADER_LEN;
        if l3 > mtu as usize {
            tracing::warn!(
                mtu,
                packet = l3,
                "Frames exceed the interface MTU and may be dropped"
            );
        }
    }

    Ok((resolution, frame))
}

#[cfg(target_os = "linux")]
async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    use anyhow::Context;
    use pktgen_core::resolver::lookup_host;
    use pktgen_core::{PayloadMode, Resolver, Shutdown, ThroughputReporter, TransmitEngine};
    use pktgen_transport::{AfXdpRing, EphemeralPorts, NetlinkTables, TxRing};

    let dest = lookup_host(&cli.host).context("host lookup failed")?;

    let tables = NetlinkTables::open().context("failed to open routing netlink socket")?;
    let mode = if cli.random_buffer {
        PayloadMode::Random
    } else {
        PayloadMode::Timestamped
    };
    let resolver = Resolver::new(tables, EphemeralPorts);
    let (resolution, frame) = prepare(&resolver, dest, cli.port, config.payload.size, mode)?;

    let queue_id = cli.queue.unwrap_or(config.ring.queue_id);
    let ring_config = config.ring_config()?;
    let ring = AfXdpRing::open(resolution.ifindex, queue_id, &ring_config)
        .context("failed to open AF_XDP ring")?;
    tracing::info!(
        interface = %resolution.interface,
        queue_id,
        bind_mode = %ring_config.bind_mode,
        frame_len = frame.len(),
        "Transmitting; press Ctrl+C to stop"
    );

    let shutdown = Shutdown::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let reporter = cli.verbose.then(|| {
        let reporter = ThroughputReporter::new(ring.stats_source(), frame.len());
        let task = reporter.run(shutdown.clone(), |sample| println!("{}", sample.rate));
        tokio::spawn(task)
    });

    let engine = TransmitEngine::new(ring, frame, shutdown.clone());
    let outcome = tokio::task::spawn_blocking(move || engine.run())
        .await
        .context("transmit engine panicked")?;

    // Engine errors end the run; stop the companions either way
    shutdown.cancel();
    signals.abort();
    if let Some(reporter) = reporter {
        match reporter.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Throughput reporter ended early"),
            Err(e) => tracing::warn!(error = %e, "Throughput reporter task failed"),
        }
    }

    let report = outcome.context("transmission failed")?;
    tracing::info!(
        frames_submitted = report.frames_submitted,
        frames_completed = report.frames_completed,
        batches = report.batches,
        "Stopped"
    );
    Ok(())
}

/// Signal that ended the run
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Terminate,
}

/// Wait for whichever of SIGINT or SIGTERM arrives first.
///
/// A SIGINT listener that fails to register stays pending, so SIGTERM can
/// still end the run.
#[cfg(target_os = "linux")]
async fn first_signal<I, T>(sigint: I, sigterm: T) -> StopSignal
where
    I: std::future::Future<Output = std::io::Result<()>>,
    T: std::future::Future<Output = ()>,
{
    let sigint = async {
        if let Err(e) = sigint.await {
            tracing::warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = sigint => StopSignal::Interrupt,
        () = sigterm => StopSignal::Terminate,
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
#[cfg(target_os = "linux")]
async fn wait_for_signal(shutdown: pktgen_core::Shutdown) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            None
        }
    };

    let sigterm = async {
        match term.as_mut() {
            Some(term) => {
                term.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    match first_signal(tokio::signal::ctrl_c(), sigterm).await {
        StopSignal::Interrupt => tracing::info!("Interrupted"),
        StopSignal::Terminate => tracing::info!("Terminated"),
    }
    shutdown.cancel();
}
