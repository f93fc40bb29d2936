use tokio_util::sync::CancellationToken;
use webrecon::cli::{Cli, Commands};
use webrecon::config::CrawlConfig;
use webrecon::fetcher::HttpFetcher;
use webrecon::logging;
use webrecon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let exit_code = match cli.command {
        Commands::Crawl {
            config,
            output,
            pages_max,
            rate_limit,
            depth_max,
            no_resume,
        } => run_crawl(config, output, pages_max, rate_limit, depth_max, no_resume).await,
    };

    std::process::exit(exit_code);
}

async fn run_crawl(
    config_path: String,
    output: Option<String>,
    pages_max: Option<u64>,
    rate_limit: Option<f64>,
    depth_max: Option<u32>,
    no_resume: bool,
) -> i32 {
    let mut config = match CrawlConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };

    if let Some(output) = output {
        config.output.root_dir = output;
    }
    if let Some(pages) = pages_max {
        config.crawl.budgets.pages_max = pages;
    }
    if let Some(rps) = rate_limit {
        config.crawl.rate_limit_rps = rps;
    }
    if let Some(depth) = depth_max {
        config.crawl.depth_max = depth;
    }
    if let Err(e) = config.validate() {
        eprintln!("error: {}", e);
        return 1;
    }

    let log_dir = std::path::Path::new(&config.output.root_dir).join("logs");
    if let Err(e) = logging::init_logging(&log_dir) {
        eprintln!("error: could not initialize logging: {}", e);
        return 1;
    }

    let fetcher = match HttpFetcher::from_config(&config) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            tracing::error!(error = %e, "could not build HTTP client");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut orchestrator = match Orchestrator::new(config, cancel) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return 1;
        }
    };

    let resumed = if no_resume {
        false
    } else {
        orchestrator.resume()
    };
    if !resumed {
        orchestrator.seed();
    }

    match orchestrator.run(&fetcher).await {
        Ok(outcome) => {
            println!(
                "done: {} ({} pages, {} js, {} api in {}s)",
                outcome.end.as_str(),
                outcome.budget.pages,
                outcome.budget.js,
                outcome.budget.api,
                outcome.duration_secs
            );
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "crawl failed");
            1
        }
    }
}

/// First Ctrl+C requests a graceful stop; the orchestrator finishes the
/// current iteration, flushes, and checkpoints. A second Ctrl+C exits
/// immediately.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nreceived Ctrl+C, finishing current iteration (press again to force quit)");
            cancel.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nforce quit");
                std::process::exit(1);
            }
        }
    });
}
