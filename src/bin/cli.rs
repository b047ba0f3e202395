//! logtree admin CLI
//!
//! Offline inspection and maintenance of a logtree directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use logtree::{Config, Environment, LogTreeError, Result};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// logtree admin CLI
#[derive(Parser, Debug)]
#[command(name = "logtree-cli")]
#[command(about = "Inspect and maintain a logtree environment")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./logtree_data")]
    data_dir: PathBuf,

    /// Log file size in bytes (must match the environment)
    #[arg(long, default_value = "8388608")]
    file_size: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print version, stores, files and free space
    Stat,

    /// Print free bytes per file
    Utilization {
        /// Recompute from the live trees instead of the saved profile
        #[arg(long)]
        from_scratch: bool,

        /// Import `<file address> <free bytes>` lines from a report
        #[arg(long, conflicts_with = "from_scratch")]
        report: Option<PathBuf>,
    },

    /// Run one cleaning cycle
    Gc,

    /// Clean every file below the newest and delete the vacated files
    Compact,

    /// Read every loggable and every reachable tree node
    Verify,

    /// Print the entries of a store
    Dump {
        /// Store name
        store: String,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,logtree=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    debug!("logtree-cli v{}", logtree::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .log_file_size(args.file_size)
        .gc_enabled(false)
        .gc_start_in_ms(0)
        .gc_files_deletion_delay_ms(0);

    match &args.command {
        Commands::Stat | Commands::Verify | Commands::Dump { .. } => {
            builder = builder.read_only(true);
        }
        Commands::Utilization { from_scratch, report } => {
            builder = builder.read_only(true).gc_utilization_from_scratch(*from_scratch);
            if let Some(path) = report {
                builder = builder.gc_utilization_from_report(path);
            }
        }
        Commands::Gc | Commands::Compact => {}
    }

    let env = Environment::open(builder.build())?;
    match args.command {
        Commands::Stat => stat(&env)?,
        Commands::Utilization { .. } => utilization(&env)?,
        Commands::Gc => {
            let cleaned = env.gc().run_now()?;
            env.gc().delete_pending_files()?;
            println!("cleaned: {}", cleaned);
            print_gc_stats(&env);
        }
        Commands::Compact => {
            let files = env.gc().compact_log()?;
            println!("files cleaned: {}", files);
            print_gc_stats(&env);
        }
        Commands::Verify => verify(&env)?,
        Commands::Dump { store, limit } => dump(&env, &store, limit)?,
    }
    env.close()
}

// =============================================================================
// Commands
// =============================================================================

fn stat(env: &Environment) -> Result<()> {
    let log = env.log();
    let profile = env.utilization();
    profile.estimate_total_bytes();

    println!("data dir:      {}", log.dir().display());
    println!("version:       {}", env.version());
    println!("files:         {}", log.number_of_files());
    println!("low address:   {:#x}", log.low_address());
    println!("high address:  {:#x}", log.high_address());
    println!("counted bytes: {}", profile.total_bytes());
    println!("free bytes:    {}", profile.total_free_bytes());
    println!("free percent:  {}", profile.total_free_space_percent());

    let txn = env.begin_read();
    println!("stores:");
    for name in txn.store_names() {
        let store = txn.store(&name)?;
        let count = txn.open_cursor(&store)?.count();
        println!("  {:<24} {} entries", name, count);
    }
    Ok(())
}

fn utilization(env: &Environment) -> Result<()> {
    // Recomputation runs on the cleaner thread
    env.gc().wait_idle()?;

    let log = env.log();
    let profile = env.utilization();
    profile.estimate_total_bytes();

    println!("{:<18} {:>12} {:>12} {:>6}", "file", "size", "free", "free%");
    for (file, free) in profile.entries() {
        let size = log.file_size(file);
        let percent = if size == 0 { 0 } else { free * 100 / size };
        let marker = if profile.is_cleaned(file) { " cleaned" } else { "" };
        println!("{:016x}   {:>12} {:>12} {:>5}%{}", file, size, free, percent, marker);
    }
    println!(
        "total free: {} of {} bytes ({}%)",
        profile.total_free_bytes(),
        profile.total_bytes(),
        profile.total_free_space_percent()
    );
    Ok(())
}

fn verify(env: &Environment) -> Result<()> {
    let log = env.log();

    let mut loggables = 0u64;
    for loggable in log.loggable_iterator(log.low_address()) {
        loggable?;
        loggables += 1;
    }
    println!("loggables:  {} ok", loggables);

    let txn = env.begin_read();
    let mut nodes = 0u64;
    for tree in txn.all_trees() {
        for address in tree.address_iterator() {
            let address = address?;
            if !log.has_file(log.file_address_of(address)) {
                return Err(LogTreeError::Integrity(format!(
                    "structure {} references node {:#x} in a deleted file",
                    tree.structure_id(),
                    address
                )));
            }
            nodes += 1;
        }
    }
    println!("tree nodes: {} ok", nodes);

    let (hits, misses) = log.cache().stats();
    debug!(hits, misses, "file cache");
    Ok(())
}

fn dump(env: &Environment, name: &str, limit: Option<usize>) -> Result<()> {
    let txn = env.begin_read();
    let store = txn.store(name)?;
    let cursor = txn.open_cursor(&store)?;
    for entry in cursor.take(limit.unwrap_or(usize::MAX)) {
        let (key, value) = entry?;
        println!(
            "{}\t{}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
    }
    Ok(())
}

fn print_gc_stats(env: &Environment) {
    let stats = env.gc().stats();
    println!("passes:          {}", stats.passes);
    println!("files cleaned:   {}", stats.files_cleaned);
    println!("files deleted:   {}", stats.files_deleted);
    println!("nodes relocated: {}", stats.loggables_reclaimed);
    println!("files pending:   {}", stats.pending_files);
}
