use clap::{Parser, Subcommand};

/// Reconnaissance crawler CLI.
#[derive(Parser)]
#[command(name = "webrecon")]
#[command(about = "Scoped web reconnaissance crawler with content reduction")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl from a configuration file
    Crawl {
        /// Path to the JSON configuration file (or set WEBRECON_CONFIG)
        #[arg(short, long, env = "WEBRECON_CONFIG")]
        config: String,

        /// Override output root directory
        #[arg(short, long)]
        output: Option<String>,

        /// Override the saved-pages budget
        #[arg(long)]
        pages_max: Option<u64>,

        /// Override the request rate limit (requests per second)
        #[arg(long)]
        rate_limit: Option<f64>,

        /// Override the crawl depth limit
        #[arg(long)]
        depth_max: Option<u32>,

        /// Start fresh, ignoring any existing checkpoint
        #[arg(long)]
        no_resume: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
