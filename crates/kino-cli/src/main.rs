//! Kino CLI - Headless driver for the fragment pipeline
//!
//! Features:
//! - Synthetic VOD sessions through the full buffering and injection engine
//! - ABR, rampdown and discontinuity behaviour under scripted failures
//! - Pipeline configuration dump and validation

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use kino_pipeline::{PipelineConfig, StreamProtocol};

mod commands;
mod output;
mod simulate;

/// Kino CLI - Fragment pipeline toolkit
#[derive(Parser)]
#[command(name = "kino-cli")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Fragment buffering, injection and ABR toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    Dash,
    Hls,
    Progressive,
}

impl From<Protocol> for StreamProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Dash => StreamProtocol::Dash,
            Protocol::Hls => StreamProtocol::Hls,
            Protocol::Progressive => StreamProtocol::Progressive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic VOD session through the pipeline
    Simulate {
        /// Video profile bandwidths in bps (comma separated)
        #[arg(short, long, value_delimiter = ',', default_value = "400000,1200000,3000000")]
        profiles: Vec<u64>,

        /// Fragments per track
        #[arg(short = 'n', long, default_value = "30")]
        fragments: usize,

        /// Fragment duration in seconds
        #[arg(short = 'd', long, default_value = "2.0")]
        fragment_duration: f64,

        /// Playback rate (values above 1 or below 0 play video only)
        #[arg(short, long, default_value = "1.0", allow_hyphen_values = true)]
        rate: f64,

        /// Simulated network throughput in bps
        #[arg(short, long, default_value = "2500000")]
        bandwidth: u64,

        /// Fail every Nth video download once
        #[arg(long)]
        fail_every: Option<usize>,

        /// Start a new period at this fragment index on every track
        #[arg(long)]
        discontinuity_at: Option<usize>,

        /// Video only, no audio track
        #[arg(long)]
        no_audio: bool,

        /// Audio is muxed into the video fragments
        #[arg(long)]
        muxed: bool,

        /// Streaming protocol
        #[arg(long, value_enum, default_value = "dash")]
        protocol: Protocol,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Print the default pipeline configuration, or validate a file
    Config {
        /// Configuration file to validate
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    kino_pipeline::init();

    match cli.command {
        Commands::Simulate {
            profiles,
            fragments,
            fragment_duration,
            rate,
            bandwidth,
            fail_every,
            discontinuity_at,
            no_audio,
            muxed,
            protocol,
            config,
            timeout,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)?,
                None => PipelineConfig::default(),
            };
            if rate == 0.0 {
                anyhow::bail!("playback rate must be non-zero");
            }
            let options = simulate::SimulationOptions {
                profiles,
                fragments,
                fragment_duration,
                audio: !no_audio,
                muxed,
                rate,
                bandwidth,
                fail_every,
                discontinuity_at,
                protocol: protocol.into(),
                timeout: Duration::from_secs(timeout),
                config,
            };
            commands::simulate(options, &cli.format).await?;
        }
        Commands::Config { path } => {
            commands::config(path, &cli.format).await?;
        }
    }

    Ok(())
}
