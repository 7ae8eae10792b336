// The classical-DNS front end: answers local stub resolvers by querying a
// DoH upstream.

use clap::Parser;
use dohproxy::client::Client;
use dohproxy::config::ClientConfig;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[clap(name = "doh-client", version, about = "DNS to DNS-over-HTTPS proxy")]
struct Args {
    /// Configuration file
    #[clap(short, long, default_value = "doh-client.conf")]
    conf: String,

    /// Enable per-query logging
    #[clap(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut conf = match ClientConfig::load(&args.conf) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("doh-client: {}", e);
            process::exit(1);
        }
    };
    if args.verbose {
        conf.others.verbose = true;
    }

    let default_filter = if conf.others.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let client = match Client::new(conf) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = client.start().await {
        log::error!("{}", e);
        process::exit(1);
    }
}
