use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::exit,
    time::Duration,
};

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flowtop::node;

// access logs come from actix-web's Logger middleware
const DEFAULT_LOG_FILTER: &str = "flowtop=info,actix_web=info";

#[derive(Parser)]
#[command(name = "flowtop")]
#[command(version, about = "Live per-flow bandwidth monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture traffic and report per-flow rates on the console and over HTTP
    Monitor(MonitorCommand),
}

#[derive(Args)]
struct MonitorCommand {
    /// Interface to capture on (repeat for several)
    #[arg(short, long = "iface", value_name = "IFACE", required = true)]
    iface: Vec<String>,
    /// BPF capture filter expression
    #[arg(long = "bpf", value_name = "FILTER")]
    filter: Option<String>,
    /// Also report transport-layer (port) flows
    #[arg(long = "l4", action = ArgAction::SetTrue)]
    enable_l4: bool,
    /// HTTP API port
    #[arg(short, long, default_value_t = node::DEFAULT_PORT)]
    port: u16,
    /// HTTP API listen address
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    listen: IpAddr,
    /// Number of worker threads applying frames to the flow tables
    #[arg(long, default_value_t = node::DEFAULT_WORKERS)]
    workers: usize,
    /// Frames buffered between capture and workers
    #[arg(long, value_name = "FRAMES", default_value_t = node::DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,
    /// Behaviour when the frame queue is full
    #[arg(long, value_enum, default_value_t = node::OverflowPolicy::Block)]
    overflow: node::OverflowPolicy,
    /// Seconds without traffic before a flow is forgotten (minimum 61)
    #[arg(long, value_name = "SECS", default_value_t = node::DEFAULT_RETENTION_SECS)]
    retention_secs: u64,
    /// File of CIDRs treated as local, in addition to interface addresses
    #[arg(long, value_name = "PATH")]
    local_nets: Option<PathBuf>,
    /// Do not print the flow table every second
    #[arg(short, long, action = ArgAction::SetTrue)]
    quiet: bool,
    /// Bytes captured per frame
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_SNAPLEN)]
    snaplen: i32,
    /// Leave the interface out of promiscuous mode
    #[arg(long = "no-promisc", action = ArgAction::SetTrue)]
    no_promisc: bool,
}

#[actix_web::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        error!("flowtop error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Monitor(cmd)) => {
            warn_if_unprivileged();
            let opts = node::MonitorOptions {
                ifaces: cmd.iface,
                enable_l4: cmd.enable_l4,
                listen: SocketAddr::new(cmd.listen, cmd.port),
                workers: cmd.workers,
                queue_depth: cmd.queue_depth,
                overflow: cmd.overflow,
                retention: Duration::from_secs(cmd.retention_secs),
                local_nets: cmd.local_nets,
                print: !cmd.quiet,
                capture: node::CaptureConfig {
                    snaplen: cmd.snaplen,
                    promisc: !cmd.no_promisc,
                    filter: cmd.filter,
                },
            };
            node::run_monitor(opts).await?;
            info!("exit");
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn warn_if_unprivileged() {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            warn!("not running as root; opening the capture may fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_enables_access_logs() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
        let shown = filter.to_string();
        assert!(shown.contains("flowtop=info"));
        assert!(shown.contains("actix_web=info"));
    }

    #[test]
    fn monitor_flags_parse() {
        let cli = Cli::try_parse_from([
            "flowtop", "monitor", "-i", "eth0", "-i", "wlan0", "--l4", "--overflow", "drop",
        ])
        .unwrap();
        let Some(Commands::Monitor(cmd)) = cli.command else {
            panic!("monitor subcommand");
        };
        assert_eq!(cmd.iface, ["eth0", "wlan0"]);
        assert!(cmd.enable_l4);
        assert_eq!(cmd.overflow, node::OverflowPolicy::Drop);
        assert_eq!(cmd.port, node::DEFAULT_PORT);
    }
}
