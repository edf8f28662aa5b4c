//! lab: Simulated peer-to-peer cluster driver.
//!
//! Streams the cluster graph to stdout as JSON lines and reads user commands
//! from stdin. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lab::{Session, SimulationChanged, UserEvent};
use sim_core::{ClusterConfig, Line, Random, Ring, Topology};

#[derive(Parser, Debug)]
#[command(name = "lab")]
#[command(about = "Simulation and visualisation for peer-exchange research")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a simulated cluster
    Start(StartArgs),
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Number of peers to spawn before reading commands
    #[arg(short, long, default_value_t = 0)]
    nodes: usize,

    /// How the initial peers connect to each other
    #[arg(short, long, value_enum, default_value_t = TopologyKind::Ring)]
    topology: TopologyKind,

    /// Neighbors per peer for the random topology
    #[arg(short, long, default_value_t = 3)]
    degree: usize,

    /// Seed for the random topology
    #[arg(long)]
    seed: Option<u64>,

    /// Events buffered per subscription (overrides LAB_BUS_CAPACITY)
    #[arg(long)]
    bus_capacity: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TopologyKind {
    Ring,
    Line,
    Random,
}

impl StartArgs {
    fn topology(&self) -> Box<dyn Topology> {
        match self.topology {
            TopologyKind::Ring => Box::new(Ring),
            TopologyKind::Line => Box::new(Line),
            TopologyKind::Random => match self.seed {
                Some(seed) => Box::new(Random::seeded(self.degree, seed)),
                None => Box::new(Random::new(self.degree)),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,lab=debug,sim_core=debug"
    } else {
        "info,lab=info,sim_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Start(args) => start(args).await,
    }
}

async fn start(args: StartArgs) -> Result<()> {
    let mut config = ClusterConfig::from_env()?;
    if let Some(capacity) = args.bus_capacity {
        config = config.with_bus_capacity(capacity);
    }
    config.validate()?;

    let mut session = Session::new(config).context("Failed to start cluster")?;
    info!("Session {} started", session.id());

    let topology = args.topology();
    let dials = session.populate(args.nodes, topology.as_ref()).await?;
    info!(
        "Spawned {} peers ({:?} topology, {} dials)",
        session.stats().spawned,
        args.topology,
        dials
    );

    let (initial, mut steps) = session.watch().await?;

    // Steps are forwarded on their own task so a slow command never stalls
    // the graph model.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        write_line(&mut stdout, &initial).await?;
        while let Some(step) = steps.recv().await {
            write_line(&mut stdout, &SimulationChanged::step(step)).await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Reading commands from stdin. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match UserEvent::from_line(&line) {
                        Ok(Some(event)) => {
                            debug!("Got user event: {:?}", event);
                            session.apply(event).await;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Skipping input line: {}", e),
                    },
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    let closed = session.close().await;

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to write output: {}", e),
        Err(e) => error!("Output task failed: {}", e),
    }

    let stats = closed?;
    info!(
        "Done: {} spawned, {} killed, {} failures",
        stats.spawned, stats.killed, stats.failures
    );
    Ok(())
}

async fn write_line(out: &mut tokio::io::Stdout, message: &SimulationChanged) -> Result<()> {
    let mut line = message.to_line()?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
