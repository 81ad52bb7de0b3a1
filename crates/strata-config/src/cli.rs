//! Command-line argument parsing for Strata.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strata", about = "Concurrent chunk editing demo")]
pub struct CliArgs {
    /// Lowest section index.
    #[arg(long, allow_negative_numbers = true)]
    pub min_section: Option<i32>,

    /// Highest section index.
    #[arg(long, allow_negative_numbers = true)]
    pub max_section: Option<i32>,

    /// Capture undo snapshots on commit.
    #[arg(long)]
    pub snapshots: Option<bool>,

    /// Remove entities from anywhere in the world when not found in the edited chunk.
    #[arg(long)]
    pub world_entity_fallback: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of chunks the demo edits in parallel.
    #[arg(long, default_value_t = 8)]
    pub chunks: u32,

    /// Seed for the demo's random edits.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(min) = args.min_section {
            self.world.min_section = min;
        }
        if let Some(max) = args.max_section {
            self.world.max_section = max;
        }
        if let Some(snapshots) = args.snapshots {
            self.edit.create_snapshots = snapshots;
        }
        if let Some(fallback) = args.world_entity_fallback {
            self.edit.remove_entity_from_world_on_chunk_fail = fallback;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
