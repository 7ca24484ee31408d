use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use dns_reverse_proxy::config::RoutingConfig;
use dns_reverse_proxy::error::ProxyError;
use dns_reverse_proxy::proxy::{self, Proxy, ProxyConfig};

#[derive(Parser)]
#[command(name = "dns-reverse-proxy")]
#[command(about = "DNS reverse proxy routing queries and zone transfers", long_about = None)]
struct Args {
    /// Routing configuration file (YAML)
    #[arg(short, long, default_value = "/usr/local/etc/dns-proxy.yaml")]
    config: PathBuf,

    /// Address to listen on for both UDP and TCP (IP:PORT)
    #[arg(short, long, default_value = "127.0.0.1:53")]
    bind: SocketAddr,

    /// Upstream timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout: u64,

    /// Time in-flight requests get to finish on shutdown, in milliseconds
    #[arg(long, default_value = "5000")]
    shutdown_grace: u64,

    /// Validate the configuration file and exit
    #[arg(long)]
    check: bool,

    /// Enable verbose logging (every request, with timing)
    #[arg(short, long)]
    verbose: bool,
}

async fn run(args: Args) -> Result<(), ProxyError> {
    let server = Proxy::bind(ProxyConfig {
        bind_addr: args.bind,
        config_path: args.config,
        upstream_timeout: Duration::from_millis(args.timeout),
        shutdown_grace: Duration::from_millis(args.shutdown_grace),
    })
    .await?;
    let control = proxy::signal_events()?;

    server.run(control).await
}

fn check(path: &Path) -> Result<(), ProxyError> {
    let config = RoutingConfig::load(path)?;
    println!(
        "{}: {} routes, {} transfer zones, default server {:?}",
        path.display(),
        config.routes_len(),
        config.transfers_len(),
        config.default_server()
    );
    Ok(())
}

fn fail(err: &dyn Error) -> ! {
    let mut message = format!("Failed to run: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    error!("{}", message);
    process::exit(1);
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if args.check {
        if let Err(e) = check(&args.config) {
            fail(&e);
        }
        return;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(&e),
    };

    if let Err(e) = rt.block_on(run(args)) {
        fail(&e);
    }
    info!("Exiting with success");
}
