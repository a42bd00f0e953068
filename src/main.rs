//! lowmem-llm: command-line tooling for the paged weight store and
//! training state files.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use lowmem_llm::config::{Cli, Command, Config};
use lowmem_llm::model::weights;
use lowmem_llm::quant::state_file;
use lowmem_llm::store::WeightStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "lowmem_llm=debug"
    } else {
        "lowmem_llm=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("lowmem-llm v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::PackWeights { path } => pack_weights(config, path).await,
        Command::InspectWeights { path } => inspect_weights(&path),
        Command::VerifyState { path } => verify_state(&path),
        Command::ShowConfig => show_config(&config),
    }
}

async fn pack_weights(config: Config, path: PathBuf) -> anyhow::Result<()> {
    info!(
        page_size = config.store.page_size,
        max_active_pages = config.store.max_active_pages,
        swap_dir = %config.store.swap_dir.display(),
        resident_limit = ?config.resident_weight_bytes(),
        "Packing weights"
    );

    // Paging and swap writes are blocking file I/O.
    let (entries, stats, ratio) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut store = WeightStore::open(config.store.clone(), config.codec.clone())?;
        let entries = weights::load_into_store(&path, &mut store)
            .with_context(|| format!("loading {}", path.display()))?;
        store.flush_all()?;
        Ok((entries, store.stats().clone(), store.compression_ratio()))
    })
    .await??;

    let total: usize = entries.iter().map(|e| e.len).sum();
    info!(
        tensors = entries.len(),
        bytes = total,
        faults = stats.faults,
        evictions = stats.evictions,
        flushes = stats.flushes,
        compression_ratio = ratio,
        "Weights packed"
    );
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn inspect_weights(path: &std::path::Path) -> anyhow::Result<()> {
    let tensors = weights::read_weight_file(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut total = 0usize;
    for (i, tensor) in tensors.iter().enumerate() {
        println!("{i:>4}  {:?}  {} elements", tensor.dims, tensor.data.len());
        total += tensor.data.len();
    }
    println!("{} tensors, {} parameters", tensors.len(), total);
    Ok(())
}

fn verify_state(path: &std::path::Path) -> anyhow::Result<()> {
    let header = state_file::verify_state_file(path)
        .with_context(|| format!("verifying {}", path.display()))?;
    info!(
        kind = header.kind_name(),
        version = header.version,
        compressed = header.compressed,
        original_size = header.original_size,
        "State file verified"
    );
    println!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    info!(
        resident_weight_bytes = ?config.resident_weight_bytes(),
        kv_arena_bytes = ?config.kv_arena_bytes(),
        layer_cache_bytes = ?config.layer_cache_bytes(),
        quant = ?config.quant.quant_type,
        state_compression = config.state_file.use_compression,
        "Effective configuration"
    );
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
