//! Reelout CLI: inspect export formats and run smoke renders.
//!
//! Usage:
//!   reelout formats [--json]              List export formats
//!   reelout options <FORMAT> [--set K=V]  Show legal property values around a config
//!   reelout render-test <FORMAT> <OUT>    Render a synthetic test pattern
//!   reelout check                         Check the ffmpeg installation

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "reelout", about = "Render delivery pipeline", version, author)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every export format
    Formats {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the values each property may take around a config
    Options {
        /// Format label, e.g. PNG or h264
        format: String,

        /// Property override, e.g. --set depth=16
        #[arg(long = "set", value_name = "PROPERTY=VALUE")]
        overrides: Vec<String>,
    },

    /// Render a synthetic test pattern through the render queue
    RenderTest {
        /// Format label
        format: String,

        /// Output file, or directory for image sequences
        output: PathBuf,

        /// Property override, e.g. --set channels=alpha
        #[arg(long = "set", value_name = "PROPERTY=VALUE")]
        overrides: Vec<String>,

        #[arg(long, default_value = "1920")]
        width: u32,

        #[arg(long, default_value = "1080")]
        height: u32,

        /// Integral frame rate
        #[arg(long, default_value = "25")]
        fps: u32,

        #[arg(long, default_value = "50")]
        frames: u64,

        /// File name pattern for image sequences, e.g. credits.%04d.png
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Check ffmpeg and the encoders the container formats use
    Check,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = reelout_common::DeliveryConfig::load();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    reelout_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Formats { json } => commands::formats::run(json),
        Commands::Options { format, overrides } => commands::options::run(&format, &overrides),
        Commands::RenderTest {
            format,
            output,
            overrides,
            width,
            height,
            fps,
            frames,
            pattern,
        } => commands::render_test::run(
            &config,
            commands::render_test::TestRender {
                format,
                output,
                overrides,
                width,
                height,
                fps,
                frames,
                pattern,
            },
        ),
        Commands::Check => commands::check::run(&config),
    }
}
