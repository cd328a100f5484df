use clap::{Arg, Command};
use std::path::Path;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("sse-hub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A Server-Sent Events broadcasting server")
        .arg(
            Arg::new("config")
                .help("Location of the configuration file")
                .long("config")
                .value_name("path")
                .default_value("./conf/config.json"),
        )
        .get_matches();

    info!(version = env!("CARGO_PKG_VERSION"), "sse-hub starting");

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");
    let config = match sse_hub::config::load_config_from_path(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = sse_hub::run(config).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}
