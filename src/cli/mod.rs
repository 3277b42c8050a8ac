//! CLI mode for mediacache: install, bulk download and inspect the cache.

mod progress;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::downloader::{BulkDownloader, JobProgress};
use crate::error::{Error, Result};
use crate::fetch::{HttpNetwork, Network};
use crate::lifecycle::ServiceWorker;
use crate::message::{Message, Song};
use crate::store::{CacheStore, DiskStore, Generation};

use progress::{BarProgress, make_job_bar, print_generation, print_summary};

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// A `mediacache` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Install, activate and run the caching proxy.
    Serve,
    /// Install core assets and activate.
    Install,
    /// Bulk-download the songs listed in a JSON file.
    Download(PathBuf),
    /// List generations and their entries.
    List,
    /// Delete every generation but the configured one.
    Evict,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// What to run.
    pub command: Command,
    /// Explicit configuration file.
    pub config_path: Option<PathBuf>,
    /// Origin override.
    pub origin: Option<String>,
    /// Cache directory override.
    pub cache_dir: Option<PathBuf>,
    /// Generation id override.
    pub generation: Option<String>,
    /// Parallel download override.
    pub parallel: Option<usize>,
    /// Proxy listen address.
    pub listen: SocketAddr,
}

/// Outcome of parsing the command line.
#[derive(Debug)]
pub enum Parsed {
    /// Run a command.
    Run(CliArgs),
    /// Help was requested.
    Help,
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown options, missing values or a
/// missing command.
pub fn parse_args(args: &[String]) -> Result<Parsed> {
    let mut command = None;
    let mut positional = Vec::new();
    let mut config_path = None;
    let mut origin = None;
    let mut cache_dir = None;
    let mut generation = None;
    let mut parallel = None;
    let mut listen = DEFAULT_LISTEN.to_string();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                config_path = Some(PathBuf::from(take_value(args, &mut i, "--config")?));
            }
            "--origin" => origin = Some(take_value(args, &mut i, "--origin")?.to_string()),
            "--cache-dir" => {
                cache_dir = Some(PathBuf::from(take_value(args, &mut i, "--cache-dir")?));
            }
            "-g" | "--generation" => {
                generation = Some(take_value(args, &mut i, "--generation")?.to_string());
            }
            "-p" | "--parallel" => {
                let value = take_value(args, &mut i, "--parallel")?;
                parallel = Some(value.parse().map_err(|_| {
                    Error::Config(format!("--parallel expects a number, got {value:?}"))
                })?);
            }
            "-l" | "--listen" => listen = take_value(args, &mut i, "--listen")?.to_string(),
            "-h" | "--help" => return Ok(Parsed::Help),
            arg if !arg.starts_with('-') => {
                if command.is_none() {
                    command = Some(arg.to_string());
                } else {
                    positional.push(arg.to_string());
                }
            }
            other => return Err(Error::Config(format!("Unknown option: {other}"))),
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("serve") => Command::Serve,
        Some("install") => Command::Install,
        Some("download") => {
            let path = positional
                .first()
                .ok_or_else(|| Error::Config("download requires a songs file".to_string()))?;
            Command::Download(PathBuf::from(path))
        }
        Some("list") => Command::List,
        Some("evict") => Command::Evict,
        Some(other) => return Err(Error::Config(format!("Unknown command: {other}"))),
        None => return Ok(Parsed::Help),
    };

    let listen = listen
        .parse()
        .map_err(|_| Error::Config(format!("Invalid listen address {listen:?}")))?;

    Ok(Parsed::Run(CliArgs {
        command,
        config_path,
        origin,
        cache_dir,
        generation,
        parallel,
        listen,
    }))
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: mediacache [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve               Install, activate and run the caching proxy");
    eprintln!("  install             Fetch core assets and activate the generation");
    eprintln!("  download <FILE>     Cache the songs listed in a JSON file");
    eprintln!("  list                Show cached generations and entries");
    eprintln!("  evict               Delete every generation but the configured one");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>      Configuration file (TOML)");
    eprintln!("      --origin <URL>       Origin to cache (default: http://127.0.0.1:8000/)");
    eprintln!("      --cache-dir <PATH>   Cache store directory");
    eprintln!("  -g, --generation <ID>    Cache generation id");
    eprintln!("  -p, --parallel <N>       Concurrent downloads (default: 2)");
    eprintln!("  -l, --listen <ADDR>      Proxy listen address (default: {DEFAULT_LISTEN})");
    eprintln!("  -h, --help               Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG=debug for detailed logs.");
}

/// Resolves the effective configuration from file and overrides.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or is invalid.
pub fn resolve_config(args: &CliArgs) -> Result<CacheConfig> {
    let mut config = CacheConfig::load_or_default(args.config_path.as_deref())?;
    if let Some(origin) = &args.origin {
        config = config.with_origin(origin.clone());
    }
    if let Some(dir) = &args.cache_dir {
        config = config.with_cache_dir(dir.clone());
    }
    if let Some(generation) = &args.generation {
        config = config.with_generation_id(generation.clone());
    }
    if let Some(parallel) = args.parallel {
        config = config.with_concurrent_downloads(parallel);
    }
    config.validate()?;
    Ok(config)
}

/// Reads a songs file: either a JSON array of `{url, title}` or a whole
/// `CACHE_SONGS` message.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn read_songs(path: &Path) -> Result<Vec<Song>> {
    let text = std::fs::read_to_string(path)?;
    if let Ok(songs) = serde_json::from_str::<Vec<Song>>(&text) {
        return Ok(songs);
    }
    match Message::decode(&text)? {
        Message::CacheSongs { songs } => Ok(songs),
        other => Err(Error::Config(format!(
            "{} holds a {other:?} message, expected CACHE_SONGS",
            path.display()
        ))),
    }
}

fn open_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    let store = DiskStore::new(config.cache_dir.clone());
    log::debug!("Cache store at {}", store.root().display());
    Arc::new(store)
}

fn open_network() -> Result<Arc<dyn Network>> {
    Ok(Arc::new(HttpNetwork::with_defaults()?))
}

/// Runs a parsed command.
///
/// # Errors
///
/// Returns the first fatal error of the command.
pub async fn run(args: CliArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    match args.command {
        Command::Serve => run_serve(config, args.listen).await,
        Command::Install => run_install(config).await,
        Command::Download(path) => run_download(config, &path).await,
        Command::List => run_list(&config).await,
        Command::Evict => run_evict(&config).await,
    }
}

async fn install_and_activate(worker: &ServiceWorker) -> Result<()> {
    worker.install().await?;
    let evicted = worker.activate().await?;
    println!(
        "Generation {} active ({} core asset(s))",
        worker.generation_id(),
        worker.config().core_assets.len()
    );
    if !evicted.is_empty() {
        println!("Evicted: {}", evicted.join(", "));
    }
    Ok(())
}

async fn run_install(config: CacheConfig) -> Result<()> {
    let worker = ServiceWorker::new(config.clone(), open_store(&config), open_network()?)?;
    install_and_activate(&worker).await
}

#[cfg(feature = "server")]
async fn run_serve(config: CacheConfig, listen: SocketAddr) -> Result<()> {
    use crate::lifecycle::WorkerHandle;

    let worker = ServiceWorker::new(config.clone(), open_store(&config), open_network()?)?;
    let worker = worker.start().await?;
    log::info!("Serving generation {} ({})", worker.generation_id(), worker.state());
    let (handle, _events) = WorkerHandle::spawn(Arc::new(worker));
    crate::server::serve(listen, handle).await
}

#[cfg(not(feature = "server"))]
async fn run_serve(_config: CacheConfig, _listen: SocketAddr) -> Result<()> {
    Err(Error::Config("server support not compiled in".to_string()))
}

async fn run_download(config: CacheConfig, path: &Path) -> Result<()> {
    let songs = read_songs(path)?;
    if songs.is_empty() {
        println!("No songs listed in {}", path.display());
        return Ok(());
    }

    let generation = Generation::open(open_store(&config), &config.generation_id).await?;
    let downloader = BulkDownloader::new(generation, open_network()?, &config)?;
    println!(
        "Caching {} song(s) into {} ({} at a time)",
        songs.len(),
        config.generation_id,
        downloader.concurrency()
    );

    let token = CancellationToken::new();
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        })
    };

    let bar = make_job_bar(songs.len() as u64);
    bar.enable_steady_tick(Duration::from_millis(250));
    let progress: Arc<dyn JobProgress> = Arc::new(BarProgress::new(bar));
    let report = downloader.run(&songs, &progress, Some(token)).await;
    ctrl_c.abort();

    print_summary(&report);
    if report.cancelled {
        return Err(Error::Cancelled);
    }
    Ok(())
}

async fn run_list(config: &CacheConfig) -> Result<()> {
    let store = open_store(config);
    let generations = store.generations().await?;
    if generations.is_empty() {
        println!("Cache at {} is empty.", config.cache_dir.display());
        return Ok(());
    }
    for id in generations {
        let mut entries = store.list(&id).await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        print_generation(&id, id == config.generation_id, &entries);
    }
    Ok(())
}

async fn run_evict(config: &CacheConfig) -> Result<()> {
    let evicted = open_store(config)
        .evict_all_except(&config.generation_id)
        .await?;
    if evicted.is_empty() {
        println!("Nothing to evict.");
    } else {
        for id in &evicted {
            println!("Evicted {id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn parse(list: &[&str]) -> CliArgs {
        match parse_args(&args(list)).unwrap() {
            Parsed::Run(args) => args,
            Parsed::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn parses_download_with_overrides() {
        let parsed = parse(&[
            "--origin",
            "https://hymns.example/",
            "download",
            "songs.json",
            "-p",
            "4",
            "--cache-dir",
            "/tmp/cache",
        ]);
        assert_eq!(parsed.command, Command::Download(PathBuf::from("songs.json")));
        assert_eq!(parsed.origin.as_deref(), Some("https://hymns.example/"));
        assert_eq!(parsed.parallel, Some(4));
        assert_eq!(parsed.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(parsed.listen, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn parses_serve_listen_address() {
        let parsed = parse(&["serve", "--listen", "0.0.0.0:9000"]);
        assert_eq!(parsed.command, Command::Serve);
        assert_eq!(parsed.listen.port(), 9000);
    }

    #[test]
    fn help_and_errors() {
        assert!(matches!(parse_args(&args(&[])).unwrap(), Parsed::Help));
        assert!(matches!(parse_args(&args(&["-h"])).unwrap(), Parsed::Help));
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["download"])).is_err());
        assert!(parse_args(&args(&["list", "--bogus"])).is_err());
        assert!(parse_args(&args(&["list", "--origin"])).is_err());
        assert!(parse_args(&args(&["list", "-p", "many"])).is_err());
        assert!(parse_args(&args(&["serve", "--listen", "nowhere"])).is_err());
    }

    #[test]
    fn overrides_apply_to_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        CacheConfig::default()
            .with_generation_id("from-file")
            .save(&config_path)
            .unwrap();

        let mut parsed = parse(&["list", "-g", "v7", "-p", "3"]);
        parsed.config_path = Some(config_path.clone());
        let config = resolve_config(&parsed).unwrap();
        assert_eq!(config.generation_id, "v7");
        assert_eq!(config.concurrent_downloads, 3);

        let mut parsed = parse(&["list"]);
        parsed.config_path = Some(config_path);
        assert_eq!(resolve_config(&parsed).unwrap().generation_id, "from-file");
    }

    #[test]
    fn reads_both_song_file_shapes() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"url":"/a.mp3","title":"A"},{"url":"/b.mp3"}]"#).unwrap();
        assert_eq!(read_songs(&list).unwrap().len(), 2);

        let message = dir.path().join("message.json");
        std::fs::write(
            &message,
            r#"{"type":"CACHE_SONGS","songs":[{"url":"/a.mp3","title":"A"}]}"#,
        )
        .unwrap();
        assert_eq!(read_songs(&message).unwrap(), vec![Song::new("/a.mp3", "A")]);

        let wrong = dir.path().join("wrong.json");
        std::fs::write(&wrong, r#"{"type":"CACHE_COMPLETE"}"#).unwrap();
        assert!(read_songs(&wrong).is_err());
    }

    #[tokio::test]
    async fn evict_keeps_configured_generation() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig::default()
            .with_cache_dir(dir.path())
            .with_generation_id("v2");
        let store = open_store(&config);
        store.create_generation("v1").await.unwrap();
        store.create_generation("v2").await.unwrap();

        run_evict(&config).await.unwrap();
        assert_eq!(store.generations().await.unwrap(), vec!["v2".to_string()]);
        run_list(&config).await.unwrap();
    }
}
