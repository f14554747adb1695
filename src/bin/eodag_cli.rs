//! Minimal consumer of `eodag_core`: search a product type and
//! optionally download the results. Not a full reimplementation of the
//! engine's surface, just enough to exercise it the way a real caller
//! would.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use eodag_core::download::DownloadOptions;
use eodag_core::gateway::Gateway;

/// Search and download Earth Observation products across configured providers
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Product type to search for, e.g. S2_MSI_L1C
    product_type: String,

    /// Provider configuration file (YAML); falls back to EODAG_CFG_FILE
    #[arg(short, long, env)]
    config: Option<PathBuf>,

    /// Restrict the search to a single named provider
    #[arg(long, env)]
    provider: Option<String>,

    /// Page size
    #[arg(long, default_value_t = 20)]
    items_per_page: u32,

    /// Fetch every page instead of just the first
    #[arg(long, action)]
    all: bool,

    /// Download matched products instead of only listing them
    #[arg(long, action)]
    download: bool,

    /// Destination directory for downloads
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Number of products to download in parallel
    #[arg(short, long, default_value_t = 5)]
    parallelism: usize,

    /// Logging verbosity level
    #[arg(long, env, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).without_time().init();

    let loader = eodag_core::config::ConfigLoader::new(BTreeMap::new());
    let config = loader.load(cli.config.as_deref(), &BTreeMap::new()).context("failed to load provider configuration")?;

    let gateway = Gateway::new(config, reqwest::Client::new());

    let result = if cli.all {
        gateway
            .search_all(&cli.product_type, cli.items_per_page, BTreeMap::new(), cli.provider.as_deref())
            .await
    } else {
        gateway
            .search(&cli.product_type, 1, cli.items_per_page, true, BTreeMap::new(), cli.provider.as_deref())
            .await
    }
    .context("search failed")?;

    if !cli.download {
        for product in &result.products {
            println!("{} {} {}", product.provider, product.id, product.title);
        }
        return Ok(());
    }

    let options = DownloadOptions { outputs_prefix: cli.output, ..DownloadOptions::default() };
    let paths = gateway.download_many_bounded(result.products, options, cli.parallelism).await;
    for outcome in paths {
        match outcome {
            Ok(path) => println!("downloaded {}", path.display()),
            Err(err) => {
                eprintln!("download failed: {err}");
                std::process::exit(err.exit_code());
            }
        }
    }
    Ok(())
}
