//! mediacache - offline media cache proxy and bulk downloader.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::env;

use offline_media_cache::cli::{self, Parsed};

#[tokio::main]
async fn main() -> offline_media_cache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let parsed = match cli::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!();
            cli::print_usage();
            std::process::exit(2);
        }
    };

    match parsed {
        Parsed::Help => {
            cli::print_usage();
            Ok(())
        }
        Parsed::Run(args) => cli::run(args).await,
    }
}
