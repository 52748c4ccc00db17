//! Tether Agent Binary
//!
//! The connection server started on a remote host over an established
//! stdio link.

use clap::Parser;
use tether::shutdown::EXIT_CONFIG;
use tether_agent::agent;
use tether_agent::config::{Args, ServerConfig};
use tether_agent::logging::init_logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_format, args.log_level);

    let config = match ServerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!("Starting tether agent ({:?})", config.mode);
    let code = agent::run(config).await;

    info!("Agent exiting with code {}", code);
    std::process::exit(code);
}
