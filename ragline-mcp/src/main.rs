use anyhow::Result;
use clap::{Arg, Command};
use ragline_mcp::{ServerConfig, run_server};
use ragline_retriever::logging::init_tracing;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ragline-mcp")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ragline Model Context Protocol server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("ragline.toml to load")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("FILE")
                .help("Index database, overriding the configuration")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let server_config = ServerConfig {
        config_path: matches.get_one::<PathBuf>("config").cloned(),
        database: matches.get_one::<PathBuf>("db").cloned(),
    };
    let config = server_config.load()?;

    // Stdout carries the protocol.
    init_tracing(&config.logging)?;

    run_server(config).await
}
