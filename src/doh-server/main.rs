// The DoH endpoint: answers HTTP(S) queries by asking conventional
// recursive resolvers.

use clap::Parser;
use dohproxy::config::ServerConfig;
use dohproxy::server::Server;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[clap(name = "doh-server", version, about = "DNS-over-HTTPS to DNS proxy")]
struct Args {
    /// Configuration file
    #[clap(short, long, default_value = "doh-server.conf")]
    conf: String,

    /// Enable per-query logging
    #[clap(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut conf = match ServerConfig::load(&args.conf) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("doh-server: {}", e);
            process::exit(1);
        }
    };
    if args.verbose {
        conf.verbose = true;
    }

    let default_filter = if conf.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let server = Arc::new(Server::new(conf));

    if let Err(e) = server.start().await {
        log::error!("{}", e);
        process::exit(1);
    }
}
