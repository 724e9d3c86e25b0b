use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "wheelwright",
    author,
    version,
    about = "Build a Python wheel from a source archive and publish it",
    disable_help_subcommand = true
)]
pub struct WheelwrightCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(about = "Fetch an archive, build its wheel, and upload it")]
    Build(BuildArgs),
    #[command(about = "Print the storage key for a project and wheel filename")]
    Key(KeyArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(long, help = "Project the wheel is stored under")]
    pub project: String,
    #[arg(long, help = "Wheel filename requested by the index")]
    pub filename: Option<String>,
    #[arg(
        long,
        value_name = "DIR",
        help = "Publish into a local directory instead of S3"
    )]
    pub store_dir: Option<PathBuf>,
    #[arg(value_name = "ARCHIVE_URL", help = "http(s) or file URL of the source archive")]
    pub archive_url: String,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    #[arg(long)]
    pub project: String,
    #[arg(long)]
    pub filename: String,
}
