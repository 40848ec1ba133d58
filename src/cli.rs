use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bulkfetch")]
#[command(version, about = "Resilient bulk fetching from image archives and search APIs", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides BULKFETCH_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve and download the images referenced by a source dataset
    Download(DownloadArgs),
    /// Collect every hit of a paginated search into NDJSON
    Search(SearchArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Source records, one JSON object per line
    pub records: PathBuf,

    /// Archive to resolve images against (defaults to downloads.default_archive)
    #[arg(long)]
    pub archive: Option<String>,

    /// Images to download; 0 means downloads.max_images
    #[arg(long, default_value_t = 0)]
    pub amount: u64,

    /// Dataset identifier written into the manifest
    #[arg(long)]
    pub source_id: Option<String>,

    /// Staging directory (defaults to <staging_root>/<run id>)
    #[arg(long)]
    pub staging: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    #[arg(long)]
    pub collection: String,

    #[arg(long)]
    pub query: String,

    /// Board the query is restricted to (`board:<board> AND <query>`)
    #[arg(long)]
    pub board: String,

    /// Run even when the query matches more than `search.confirm_above` hits
    #[arg(long)]
    pub confirm: bool,

    /// Stop after the page that reaches this many records; 0 = all
    #[arg(long, default_value_t = 0)]
    pub max_records: u64,

    /// NDJSON output file
    #[arg(long)]
    pub output: Option<PathBuf>,
}
