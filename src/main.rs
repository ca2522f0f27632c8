use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use icn_mesh_config::{init_logging, MeshConfig};
use icn_mesh_core::sim::Sim;
use icn_mesh_core::{SendStatus, TunnelOptions, TunnelState};

#[derive(Parser)]
#[clap(name = "icn-mesh-sim", about = "Run ICN mesh services over a simulated network")]
struct Cli {
    #[clap(short, long, help = "Verbose output")]
    verbose: bool,

    #[clap(short, long, help = "YAML configuration file; the environment is used otherwise")]
    config: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[clap(about = "Stream messages through a tunnel across a line of peers")]
    Transfer {
        #[clap(short, long, help = "Number of peers in the line", default_value = "4")]
        peers: usize,

        #[clap(short, long, help = "Messages to send", default_value = "100")]
        messages: u32,

        #[clap(short, long, help = "Fraction of payload messages lost per hop", default_value = "0.0")]
        loss: f64,

        #[clap(short, long, help = "Use a reliable tunnel")]
        reliable: bool,

        #[clap(long, help = "Random seed", default_value = "1")]
        seed: u64,

        #[clap(long, help = "Per-link latency in milliseconds", default_value = "10")]
        latency_ms: u64,

        #[clap(long, help = "Payload size in bytes", default_value = "512")]
        payload_size: usize,

        #[clap(long, help = "Give up after this much simulated time, in seconds", default_value = "600")]
        timeout: u64,

        #[clap(long, help = "Print the sender's metrics when done")]
        metrics: bool,
    },

    #[clap(about = "Print the effective configuration")]
    ShowConfig,
}

struct Transfer {
    peers: usize,
    messages: u32,
    loss: f64,
    reliable: bool,
    seed: u64,
    latency: Duration,
    payload_size: usize,
    timeout: Duration,
    metrics: bool,
}

const PORT: u32 = 1;
const STEP: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MeshConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => MeshConfig::from_env().context("reading configuration from the environment")?,
    };
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    init_logging(level)?;

    match cli.command {
        Commands::Transfer { peers, messages, loss, reliable, seed, latency_ms, payload_size, timeout, metrics } => {
            let transfer = Transfer {
                peers,
                messages,
                loss,
                reliable,
                seed,
                latency: Duration::from_millis(latency_ms),
                payload_size,
                timeout: Duration::from_secs(timeout),
                metrics,
            };
            run_transfer(config, transfer)
        }
        Commands::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn run_transfer(config: MeshConfig, transfer: Transfer) -> Result<()> {
    if transfer.peers < 2 {
        bail!("a transfer needs at least two peers, got {}", transfer.peers);
    }
    if !(0.0..1.0).contains(&transfer.loss) {
        bail!("loss must be in [0, 1), got {}", transfer.loss);
    }

    let mut sim = Sim::new(transfer.seed);
    for _ in 0..transfer.peers {
        sim.add_node(config.clone())?;
    }
    for i in 1..transfer.peers {
        sim.link(i - 1, i, transfer.latency);
    }
    let last = transfer.peers - 1;
    let relays: Vec<usize> = (1..last).collect();
    sim.script_lookup(0, last, &relays);
    sim.set_loss(transfer.loss);

    let sender = sim.connect_client(0, &[], false)?;
    let receiver = sim.connect_client(last, &[PORT], true)?;
    let options = TunnelOptions { reliable: transfer.reliable, no_buffer: false };
    let tid = sim.create_tunnel(0, sender, last, PORT, options)?;
    info!("Tunnel {} from {} to {} over {} hops", tid, sim.identity(0), sim.identity(last), last);

    while sim.service(0).tunnel(tid).map(|t| t.state()) != Some(TunnelState::Ready) {
        if sim.elapsed() > transfer.timeout {
            bail!("tunnel {} not ready after {:?}", tid, transfer.timeout);
        }
        sim.run_for(STEP);
    }
    let started = sim.elapsed();

    let mut refused = 0u64;
    for n in 0..transfer.messages {
        let mut payload = vec![0u8; transfer.payload_size.max(4)];
        payload[..4].copy_from_slice(&n.to_be_bytes());
        while sim.send(0, sender, tid, payload.clone())? == SendStatus::Dropped {
            refused += 1;
            if sim.elapsed() > transfer.timeout {
                bail!("sender stalled at message {} after {:?}", n, transfer.timeout);
            }
            sim.run_for(STEP);
        }
        debug!("Sent message {}", n);
    }

    let expected = transfer.messages as usize;
    while sim.delivered(last, receiver).len() < expected && sim.elapsed() <= transfer.timeout {
        sim.run_for(STEP);
    }
    let delivered = sim.delivered(last, receiver);
    let in_order = delivered
        .iter()
        .enumerate()
        .all(|(i, payload)| payload.get(..4) == Some(&(i as u32).to_be_bytes()[..]));
    if delivered.len() < expected {
        warn!("Only {} of {} messages arrived", delivered.len(), expected);
    }

    let elapsed = sim.elapsed() - started;
    let stats = sim.stats();
    let sender_metrics = sim.service(0).metrics();
    println!("peers:            {}", transfer.peers);
    println!("tunnel:           {} ({})", tid, if transfer.reliable { "reliable" } else { "unreliable" });
    println!("delivered:        {}/{}", delivered.len(), expected);
    println!("in order:         {}", in_order);
    println!("simulated time:   {:?}", elapsed);
    println!("sends refused:    {}", refused);
    println!("frames written:   {}", stats.written);
    println!("frames lost:      {}", stats.lost);
    println!("retransmissions:  {}", sender_metrics.retransmissions());
    println!("polls:            {}", sender_metrics.polls());
    if transfer.metrics {
        println!();
        print!("{}", sender_metrics.render()?);
    }

    sim.shutdown();
    Ok(())
}
