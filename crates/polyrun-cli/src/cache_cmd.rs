//! Cache command implementation.

use clap::Subcommand;
use polyrun_core::{ArtifactCache, EngineConfig};

use crate::colors;

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show entry count and disk usage
    Stats,

    /// Evict least recently used entries until the cache fits a budget
    Clean {
        /// Budget in megabytes (defaults to the configured limit)
        #[arg(long)]
        max_mb: Option<u64>,
    },

    /// Remove every cached artifact
    Clear,
}

pub fn execute(config: &EngineConfig, action: CacheAction) -> anyhow::Result<()> {
    let dirs = config.dirs()?;
    let cache = ArtifactCache::open(&dirs.cache_dir);

    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("{}Cache:{} {}", colors::BOLD, colors::RESET, cache.root().display());
            println!("  entries:      {}", stats.entries);
            println!("  size:         {:.2} MB", stats.total_mb());
            println!("  avg accesses: {:.1}", stats.avg_accesses());
        }
        CacheAction::Clean { max_mb } => {
            let budget = max_mb.unwrap_or(config.cache_max_mb);
            let removed = cache.clean_cache(budget);
            println!(
                "{}Cleaned{} {} entries (budget {} MB)",
                colors::GREEN,
                colors::RESET,
                removed,
                budget
            );
        }
        CacheAction::Clear => {
            let removed = cache.clear();
            println!("{}Cleared{} {} entries", colors::GREEN, colors::RESET, removed);
        }
    }

    cache.save_metadata()?;
    Ok(())
}
