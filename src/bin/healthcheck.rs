//! Container liveness probe for findmy-bridge
//!
//! Exits 0 when the last cycle is recent and both the broker and the remote
//! host are reachable. Otherwise prints the reason and exits 1.
//!
//! Usage:
//!   findmy-healthcheck                 # heartbeat, broker, TCP reachability
//!   findmy-healthcheck --handshake     # also authenticate over SSH

use clap::Parser;
use findmy_bridge::infra::Config;
use findmy_bridge::io::heartbeat::unix_now;
use findmy_bridge::services::liveness::{run_probe, ProbeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "findmy-healthcheck", version, about)]
struct Args {
    /// Path to TOML configuration file (environment variables override it)
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Authenticate to the remote host instead of only opening a TCP connection
    #[arg(long)]
    handshake: bool,

    /// Override the heartbeat staleness threshold
    #[arg(long)]
    max_age_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref());
    let options = ProbeOptions {
        max_age_secs: args.max_age_secs.unwrap_or(config.heartbeat_max_age_secs()),
        handshake: args.handshake,
    };

    match run_probe(&config, options, unix_now()).await {
        Ok(()) => std::process::exit(0),
        Err(reason) => {
            println!("{}", reason);
            std::process::exit(1);
        }
    }
}
