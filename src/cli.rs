//! Command line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Audio streaming server with on-demand transcoding.
#[derive(Parser, Debug, Clone)]
#[command(name = "audio-stream-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream a media file in the negotiated format.
    Stream {
        /// Media file id.
        id: String,

        /// Requested format; empty lets the server decide, "raw" for the original.
        #[arg(short, long, default_value = "")]
        format: String,

        /// Requested bitrate in kbps, 0 for the default.
        #[arg(short, long, default_value_t = 0)]
        bitrate: u32,

        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// User name recorded in the request log.
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Print transcoding cache statistics as JSON.
    Stats,

    /// Write a default configuration file.
    InitConfig {
        /// Destination path.
        path: PathBuf,
    },
}
