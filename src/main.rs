//! Audio Streaming Server
//!
//! Serves audio files from a media library in the format and bitrate each
//! client asks for, transcoding with an external encoder and keeping the
//! results in a disk cache shared by all requests.

mod cli;
mod config;
mod config_file;
mod error;
mod library;
mod state;

use audio_stream_lib::StreamRequest;
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::ServerConfig;
use crate::config_file::{generate_default_config, ConfigFile};
use crate::error::Result;
use crate::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "audio-stream-server";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        generate_default_config(path)?;
        eprintln!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Logging needs the configured level, so config problems are reported
    // once the subscriber is up
    let (config, config_warning) = load_config(&cli.config);
    init_logging(&config);

    tracing::info!("{} v{} starting", APP_NAME, VERSION);
    if let Some(warning) = config_warning {
        tracing::warn!("{}", warning);
    }
    tracing::debug!("Configuration loaded: {:?}", config);

    let state = AppState::new(config)?;

    match cli.command {
        Command::Stream {
            id,
            format,
            bitrate,
            output,
            user,
        } => {
            let mut request = StreamRequest::new(format, bitrate);
            if let Some(user) = user {
                request = request.with_user(user);
            }
            stream_to(&state, &id, &request, output).await?;
        }
        Command::Stats => {
            let stats = state.cache_stats();
            tracing::info!(
                dir = %state.config.cache.dir.display(),
                library_files = state.media.len(),
                "Transcoding cache"
            );
            let json = serde_json::to_string_pretty(&stats)
                .map_err(|e| error::ServerError::Config(e.to_string()))?;
            println!("{}", json);
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

/// Load the configuration file, falling back to defaults.
///
/// Returns a warning to log when the file exists but could not be used.
fn load_config(path: &Path) -> (ServerConfig, Option<String>) {
    if !path.exists() {
        return (ServerConfig::default(), None);
    }
    match ConfigFile::from_file(path) {
        Ok(cf) => (cf.into_server_config(), None),
        Err(e) => (
            ServerConfig::default(),
            Some(format!(
                "Failed to load config file {}: {}. Using defaults.",
                path.display(),
                e
            )),
        ),
    }
}

async fn stream_to(
    state: &AppState,
    id: &str,
    request: &StreamRequest,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut stream = state.streamer.new_stream(id, request).await?;
    tracing::info!(
        name = %stream.name(),
        content_type = %stream.content_type(),
        seekable = stream.seekable(),
        estimated_length = stream.estimated_content_length(),
        "Stream opened"
    );

    let copied = match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(&path).await?;
            let n = tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            n
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let n = tokio::io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
            n
        }
    };

    tracing::info!(bytes = copied, "Stream finished");
    Ok(())
}

/// Initialize logging with tracing. Output goes to stderr so that streamed
/// audio on stdout stays clean.
fn init_logging(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "audio_stream_server={0},audio_stream_lib={0}",
            config.log_level
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
