//! sqlite-interop probe
//!
//! Resolves the native SQLite library the way an application would and
//! reports what was found

use anyhow::{bail, Context};
use clap::Parser;
use sqlite_interop::{DirectoryResources, Interop, ResolvedLibrary, ResolverOptions, Setting};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sqlite-interop-probe")]
#[command(about = "Resolve the native SQLite library and report the result")]
struct Args {
    /// Directory searched first (overrides SQLITE_INTEROP_BASE_DIRECTORY)
    #[arg(short = 'b', long)]
    base_directory: Option<PathBuf>,

    /// Package directory holding <platform>/<file>.zst binaries
    #[arg(short = 'r', long)]
    resources: Option<PathBuf>,

    /// Architecture token to resolve for instead of the detected one
    #[arg(short = 'a', long)]
    arch: Option<String>,

    /// Writable cache root for extracted binaries
    #[arg(long)]
    cache_directory: Option<PathBuf>,

    /// Search `<base>/<file>` as well as the arch/platform sub-directories
    #[arg(long)]
    allow_base_only: bool,

    /// Create this database file and a table inside it
    #[arg(short = 'd', long)]
    database: Option<PathBuf>,

    /// Table created inside --database
    #[arg(long, default_value = "probe")]
    table: String,
}

fn print_resolution(resolved: &ResolvedLibrary) {
    println!("outcome:        {:?}", resolved.outcome());
    println!(
        "architecture:   {}",
        resolved.architecture().unwrap_or("unknown")
    );
    println!("platform:       {}", resolved.platform().unwrap_or("unknown"));
    println!(
        "base directory: {}",
        resolved
            .base_directory()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("file:           {}", resolved.file_path().display());
    println!("extracted:      {}", resolved.was_extracted());
    match resolved.fingerprint() {
        Some(fingerprint) => println!(
            "fingerprint:    {} ({})",
            fingerprint.label,
            fingerprint.hash_hex()
        ),
        None => println!("fingerprint:    -"),
    }
}

fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut builder = Interop::builder().options(ResolverOptions {
        allow_base_only: args.allow_base_only.then_some(true),
        ..Default::default()
    });
    if let Some(dir) = &args.base_directory {
        builder = builder.setting(Setting::BaseDirectory, dir.display().to_string());
    }
    if let Some(dir) = &args.cache_directory {
        builder = builder.setting(Setting::CacheDirectory, dir.display().to_string());
    }
    if let Some(arch) = &args.arch {
        builder = builder.setting(Setting::ProcessorArchitecture, arch.clone());
    }
    if let Some(dir) = &args.resources {
        builder = builder.resources(DirectoryResources::new(dir));
    }
    let interop = builder.build();

    info!("Resolving native library");
    let resolved = interop.resolved();
    print_resolution(&resolved);

    let api = interop.api().context("binding the native API")?;
    println!("api:            {}", api.name());
    println!("sqlite version: {}", api.libversion());

    if let Some(path) = &args.database {
        if !is_valid_table_name(&args.table) {
            bail!("invalid table name '{}'", args.table);
        }

        let conn = interop
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, note TEXT)",
            args.table
        ))
        .context("creating table")?;
        let outcome = conn.close();
        info!(?outcome, "Database closed");
        println!("database:       {} (table {})", path.display(), args.table);
    }

    Ok(())
}
