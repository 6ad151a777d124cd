//! # INDI Relay
//!
//! Command line INDI server.
//!
//! ## Overview
//!
//! This binary wraps [`indi_server`](https://docs.rs/indi-server/): it launches the driver
//! executables given on the command line, connects to the given remote INDI servers and
//! relays all of them to every client that connects.
//!
//! ```text
//! indi-relay --port 7624 --remote observatory.local indi_simulator_telescope indi_simulator_ccd
//! ```
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use indi_server::{driver::DriverSpec, server::Builder};

#[derive(Parser)]
#[command(about = "INDI server relaying local drivers and remote INDI servers", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "7624")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Remote INDI server as host[:port], may be repeated
    #[arg(short, long = "remote", value_name = "HOST[:PORT]")]
    remotes: Vec<DriverSpec>,

    /// Driver executables speaking INDI on stdin/stdout
    drivers: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting INDI relay");

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: ip={}, port={}, {} remotes, {} drivers",
        args.ip,
        args.port,
        args.remotes.len(),
        args.drivers.len()
    );

    let addr = SocketAddr::new(args.ip, args.port);
    let mut builder = Builder::new().bind(addr.to_string());
    for remote in args.remotes {
        builder = builder.driver(remote);
    }
    for program in args.drivers {
        builder = builder.driver(DriverSpec::process(program));
    }
    let server = builder.build();

    let addr = server.start().await?;
    log::info!("Relaying {} drivers on {}", server.drivers().len(), addr);
    if server.drivers().is_empty() {
        log::warn!("No driver could be started, clients will not see any device");
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    server.stop();
    Ok(())
}
