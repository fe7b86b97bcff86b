//! CLI entry point for the media optimiser
//!
//! Runs the engine as a local server, optimises files in-process or through a
//! running server, and reports which external tools are installed.

use clap::{Parser, Subcommand};
use media_optimiser_engine::{
    check_tools, optimise_batch, run_server, AssetSnapshot, AssetType, Config, CropSize, Engine,
    ErrorBody, OptimiseRequest, ResponseRecord, RestoreRequest, StopRequest,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Media Optimiser - lossless and lossy compression for images, videos and PDFs
#[derive(Parser, Debug)]
#[command(name = "media-optimiser")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine and its IPC server until Ctrl-C
    Serve,

    /// Optimise files, directories or URLs and wait for the results
    Optimise {
        /// Files, directories (searched recursively) or http(s) URLs
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<String>,

        /// Send the request to a running server instead of optimising in-process
        #[arg(long, value_name = "URL")]
        server: Option<String>,

        /// Print response records as JSON
        #[arg(long)]
        json: bool,

        /// Use the lossy argument profiles
        #[arg(short, long)]
        aggressive: bool,

        /// Keep results even when they are not smaller
        #[arg(long)]
        allow_larger: bool,

        /// Shrink by this factor (0 < factor < 1) before optimising
        #[arg(long, value_name = "FACTOR")]
        downscale: Option<f64>,

        /// Center crop to WIDTHxHEIGHT before optimising
        #[arg(long, value_name = "WxH", value_parser = parse_crop)]
        crop: Option<CropSize>,

        /// Write results here instead of replacing the sources ({dir}, {stem}, {ext}, {name})
        #[arg(short, long, value_name = "TEMPLATE")]
        output: Option<String>,
    },

    /// Stop an asset on a running server
    Stop {
        id: String,

        /// Remove the asset after stopping it
        #[arg(long)]
        remove: bool,

        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Restore an asset's original on a running server
    Restore {
        id: String,

        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Report which external tools are available
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_crop(value: &str) -> Result<CropSize, String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {}", value))?;
    let width: u32 = width.trim().parse().map_err(|_| format!("invalid width in {}", value))?;
    let height: u32 = height.trim().parse().map_err(|_| format!("invalid height in {}", value))?;
    if width == 0 || height == 0 {
        return Err("crop size must be positive".to_string());
    }
    Ok(CropSize { width, height })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Expand directories into the supported files below them.
fn expand_inputs(inputs: &[String]) -> Vec<String> {
    let mut expanded = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if !matches!(AssetType::classify(input), AssetType::RemoteUrl(_)) && path.is_dir() {
            let mut found: Vec<String> = WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| AssetType::from_path(e.path()) != AssetType::Unknown)
                .map(|e| e.path().display().to_string())
                .collect();
            found.sort();
            debug!(dir = %path.display(), count = found.len(), "expanded directory");
            expanded.extend(found);
        } else {
            expanded.push(input.clone());
        }
    }
    expanded
}

fn server_url(server: Option<String>, config: &Config) -> String {
    let url = server.unwrap_or_else(|| format!("http://{}", config.server.bind));
    url.trim_end_matches('/').to_string()
}

/// POST `body` to the server and decode the reply, turning error bodies into messages.
async fn post<B, R>(url: &str, body: &B) -> Result<Option<R>, String>
where
    B: serde::Serialize + ?Sized,
    R: serde::de::DeserializeOwned,
{
    let response = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| format!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(message);
    }
    response
        .json::<R>()
        .await
        .map(Some)
        .map_err(|e| format!("Invalid response from {}: {}", url, e))
}

fn print_records(records: &[ResponseRecord], json: bool) -> Result<(), String> {
    if json {
        let out = serde_json::to_string_pretty(records).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }
    for record in records {
        match &record.error {
            Some(error) => println!("{}: {}", record.path, error),
            None if record.old_bytes > 0 && record.new_bytes >= 0 => {
                let saved = 100.0 * (record.old_bytes - record.new_bytes) as f64 / record.old_bytes as f64;
                println!(
                    "{}: {} -> {} bytes ({:.1}% saved)",
                    record.path, record.old_bytes, record.new_bytes, saved
                );
            }
            None => println!("{}: done", record.path),
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), String> {
    check_tools(&config.tools);
    let engine = Engine::new(&config);
    info!(bind = %config.server.bind, "serving");
    println!("Listening on http://{}", config.server.bind);

    let result = run_server(engine.clone(), &config.server.bind, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;
    engine.shutdown();
    result.map_err(|e| e.to_string())
}

async fn optimise(config: &Config, request: OptimiseRequest, server: Option<String>) -> Result<Vec<ResponseRecord>, String> {
    match server {
        Some(server) => {
            let url = format!("{}/optimise", server.trim_end_matches('/'));
            post::<_, Vec<ResponseRecord>>(&url, &request)
                .await
                .map(Option::unwrap_or_default)
        }
        None => {
            let engine = Engine::new(config);
            let records = optimise_batch(&engine, &request).await.map_err(|e| e.to_string());
            engine.shutdown();
            records
        }
    }
}

async fn run(cli: Cli) -> Result<bool, String> {
    let config = Config::load_or_default(&cli.config).map_err(|e| e.to_string())?;
    debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Serve => serve(config).await.map(|_| true),
        Commands::Optimise {
            paths,
            server,
            json,
            aggressive,
            allow_larger,
            downscale,
            crop,
            output,
        } => {
            let request = OptimiseRequest {
                paths: expand_inputs(&paths),
                aggressive: aggressive.then_some(true),
                downscale_factor: downscale,
                crop,
                allow_larger,
                output_template: output,
            };
            if request.paths.is_empty() {
                return Err("No supported files found".to_string());
            }
            let records = optimise(&config, request, server).await?;
            print_records(&records, json)?;
            Ok(records.iter().all(|r| r.error.is_none()))
        }
        Commands::Stop { id, remove, server } => {
            let url = format!("{}/stop", server_url(server, &config));
            post::<_, serde_json::Value>(&url, &StopRequest { id, remove }).await?;
            Ok(true)
        }
        Commands::Restore { id, server } => {
            let url = format!("{}/restore", server_url(server, &config));
            let snapshot = post::<_, AssetSnapshot>(&url, &RestoreRequest { id }).await?;
            match snapshot.and_then(|s| s.error) {
                Some(error) => {
                    println!("{}", error);
                    Ok(false)
                }
                None => {
                    println!("Restored");
                    Ok(true)
                }
            }
        }
        Commands::Check { json } => {
            let report = check_tools(&config.tools);
            if json {
                println!("{}", serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?);
            } else {
                for tool in &report.tools {
                    let status = match (tool.available, tool.version.as_deref()) {
                        (true, Some(version)) => version.to_string(),
                        (true, None) => "available".to_string(),
                        (false, _) => "MISSING".to_string(),
                    };
                    println!("{:<10} {:<24} {}", tool.name, tool.program, status);
                }
            }
            Ok(report.all_available())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
