use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "familiar",
    about = "Drives a CLI agent's stream-json mode with durable sessions, resumption, and context compaction",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Prompt to send once; omit to read prompts line by line from stdin.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Directory holding session records, config.toml, and the engine lock.
    /// Default: ~/.familiar.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Continue a stored session instead of starting a new one.
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    /// Working directory for a newly created session. Accepts either the
    /// host form or the agent's mount form (e.g. /mnt/c/...).
    #[arg(long, value_name = "DIR")]
    pub directory: Option<String>,

    /// Model passed through to the agent; overrides config.toml.
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List stored sessions.
    Sessions,
}
