//! vecsum - remote vector checksum over the page cache
//!
//! Allocates a class-sized vector in remote memory, fills it from one worker
//! per compute cluster, and sums it back through each worker's page cache.
//! A sanity kernel for the remote memory service, in the shape of the
//! classic NoC benchmark drivers.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use noctua::prelude::*;
use noctua::topology::{NR_COMPUTE_CLUSTERS, NR_IO_NODES};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProblemClass {
    Tiny,
    Small,
    Standard,
    Large,
    Huge,
}

impl ProblemClass {
    /// Vector length, in 32-bit elements.
    fn elements(self) -> usize {
        match self {
            ProblemClass::Tiny => 1024,
            ProblemClass::Small => 4096,
            ProblemClass::Standard => 16384,
            ProblemClass::Large => 65536,
            ProblemClass::Huge => 262144,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vecsum", about = "Remote vector checksum over the NOCTUA page cache")]
struct Args {
    /// Problem size class
    #[arg(long, value_enum, default_value = "small")]
    class: ProblemClass,

    /// Number of worker clusters
    #[arg(long, default_value_t = 1)]
    nclusters: usize,

    /// Enable diagnostics
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.nclusters == 0 || args.nclusters > NR_COMPUTE_CLUSTERS {
        eprintln!(
            "vecsum: --nclusters must be between 1 and {NR_COMPUTE_CLUSTERS}"
        );
        std::process::exit(1);
    }

    match run(&args) {
        Ok(checksum) => {
            println!("vecsum: class={:?} checksum={checksum}", args.class);
        }
        Err(err) => {
            eprintln!("vecsum: {err:#}");
            std::process::exit(2);
        }
    }
}

fn run(args: &Args) -> anyhow::Result<u64> {
    let substrate = Substrate::launch(SubstrateConfig::default()).context("boot substrate")?;

    let elements = args.class.elements();
    let per_worker = elements / args.nclusters;
    log::info!(
        "vecsum: {elements} elements over {} workers",
        args.nclusters
    );

    let (results_tx, results_rx) = std::sync::mpsc::channel();
    let mut workers = Vec::new();
    for worker in 0..args.nclusters {
        let fabric = substrate.fabric().clone();
        let config = substrate.config().clone();
        let results = results_tx.clone();
        let node = NR_IO_NODES + worker;
        // Trailing worker picks up the remainder.
        let count = if worker == args.nclusters - 1 {
            elements - per_worker * (args.nclusters - 1)
        } else {
            per_worker
        };
        let base = (worker * per_worker) as u32;

        workers.push(substrate.fabric().spawn(node, move || {
            let _ = results.send(worker_sum(fabric, config, node, base, count));
        }));
    }
    drop(results_tx);

    let mut checksum = 0u64;
    for result in results_rx {
        checksum += result.context("worker failed")?;
    }
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker panicked"))?;
    }

    // Any free compute node can issue the exit requests.
    let control = NodeRuntime::init(
        substrate.fabric().clone(),
        NR_IO_NODES + NR_COMPUTE_CLUSTERS - 1,
    )?;
    substrate.shutdown(&control)?;
    Ok(checksum)
}

fn worker_sum(
    fabric: std::sync::Arc<Fabric>,
    config: SubstrateConfig,
    node: NodeId,
    base: u32,
    count: usize,
) -> anyhow::Result<u64> {
    let runtime = NodeRuntime::init(fabric, node)?;
    let client = RmemClient::new(runtime, &config)?;
    let mut cache = RemoteCache::new(client, CacheConfig::default());

    let elements_per_page = noctua::services::rmem::RMEM_BLOCK_SIZE / 4;
    let npages = count.div_ceil(elements_per_page);

    // Fill.
    let mut pages = Vec::with_capacity(npages);
    for page_index in 0..npages {
        let page = cache.alloc()?;
        let data = cache.get(page)?;
        for (slot, chunk) in data.chunks_exact_mut(4).enumerate() {
            let value = base + (page_index * elements_per_page + slot) as u32;
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        cache.put(page, 0)?;
        cache.flush(page)?;
        pages.push(page);
    }

    // Sum back through the cache.
    let mut checksum = 0u64;
    let mut remaining = count;
    for &page in &pages {
        let data = cache.get(page)?;
        let take = remaining.min(elements_per_page);
        for chunk in data.chunks_exact(4).take(take) {
            checksum += u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")) as u64;
        }
        remaining -= take;
        cache.put(page, 0)?;
    }

    let stats = cache.stats();
    log::debug!(
        "worker node {node}: {npages} pages, {} hits, {} misses",
        stats.nhits,
        stats.nmisses
    );

    for &page in &pages {
        cache.free(page)?;
    }
    Ok(checksum)
}
