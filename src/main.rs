//! CLF3 VFS command line
//!
//! Thin wrapper over the library: index roots, hash files, stage nested
//! entries, and build or apply binary patches.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use clf3_vfs::archive::Extractors;
use clf3_vfs::config::VfsConfig;
use clf3_vfs::hash::Hash;
use clf3_vfs::patch::apply_patch_file;
use clf3_vfs::progress::{BarSink, ProgressSink};
use clf3_vfs::vfs::{cleanup_stale_temp_dirs, Context, FullPath, Stores};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clf3-vfs")]
#[command(author = "CLF3 Team")]
#[command(version)]
#[command(about = "Content-addressed view over nested archives, with staging and binary patches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file (defaults are used when omitted)
    #[arg(long, global = true, env = "CLF3_VFS_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index files and directories, expanding archives recursively
    Index {
        /// Files or directories to index
        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },

    /// Print the xxHash64 of files (cached by mtime and size)
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Extract one virtual file, e.g. "mods/outer.zip|nested/inner.zip|readme.txt"
    Stage {
        /// Virtual path: physical file, then one entry per archive level, separated by '|'
        path: String,

        /// Roots to index before looking the path up
        #[arg(short, long = "root", required = true)]
        roots: Vec<PathBuf>,

        /// Where to write the staged file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Build (or fetch from the cache) a delta turning SRC into DEST
    Diff {
        src: PathBuf,
        dest: PathBuf,

        /// Patch output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Apply an OctoDiff or BSDIFF40 patch to SRC
    Apply {
        src: PathBuf,
        patch: PathBuf,

        /// Patched output file
        #[arg(short, long)]
        out: PathBuf,

        /// Expected xxHash64 of the output (base64, hex or decimal)
        #[arg(long)]
        expect: Option<String>,
    },

    /// Remove staging directories left behind by interrupted runs
    CleanTemp,
}

fn load_config(path: Option<&Path>) -> Result<VfsConfig> {
    match path {
        Some(path) => VfsConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(VfsConfig::default()),
    }
}

fn open_context(config: VfsConfig, sink: Option<Arc<dyn ProgressSink>>) -> Result<Context> {
    let stores = Stores::sqlite(&config.db_path())
        .with_context(|| format!("Failed to open cache database: {}", config.db_path().display()))?;
    Ok(Context::with_parts(config, stores, Extractors::with_defaults(), sink)?)
}

fn index_roots(ctx: &Context, roots: &[PathBuf]) -> Result<()> {
    let report = ctx.add_roots(roots).context("Indexing failed")?;
    for err in &report.errors {
        warn!("{}", err);
    }
    println!(
        "Roots: {} analyzed, {} reused, {} removed ({} errors)",
        report.analyzed,
        report.reused,
        report.removed,
        report.errors.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "clf3_vfs=debug".parse()? } else { "clf3_vfs=warn".parse()? }),
            )
            .init();
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Index { roots } => {
            let bar = Arc::new(BarSink::new());
            let ctx = open_context(config, Some(bar.clone()))?;
            index_roots(&ctx, &roots)?;
            bar.finish();

            let index = ctx.index();
            let nested = index.all_files().filter(|f| !f.is_native()).count();
            println!("Indexed:  {} files ({} inside archives)", index.len(), nested);
        }

        Commands::Hash { files } => {
            let ctx = open_context(config, None)?;
            for file in &files {
                let hash = ctx
                    .hash_cache()
                    .hash_cached(file)
                    .with_context(|| format!("Failed to hash {}", file.display()))?;
                println!("{}  {}  {}", hash, hash.to_hex(), file.display());
            }
        }

        Commands::Stage { path, roots, out } => {
            let requested: FullPath = path
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let root = std::path::absolute(requested.root())
                .with_context(|| format!("Invalid root path: {}", requested.root().display()))?;
            let requested = FullPath::with_parts(root, requested.parts().to_vec());

            let bar = Arc::new(BarSink::new());
            let ctx = open_context(config, Some(bar.clone()))?;
            index_roots(&ctx, &roots)?;

            let file = ctx
                .index()
                .by_full_path(&requested)
                .ok_or_else(|| anyhow::anyhow!("Not in the index: {}", requested))?;
            let dest = out.clone();
            ctx.extract(vec![file], move |_, staged| staged.copy_to(&dest))
                .with_context(|| format!("Failed to stage {}", requested))?;
            bar.finish();

            println!("Staged {} -> {}", requested, out.display());
        }

        Commands::Diff { src, dest, out } => {
            let ctx = open_context(config, None)?;
            let src_hash = ctx.hash_cache().hash_cached(&src)?;
            let dest_hash = ctx.hash_cache().hash_cached(&dest)?;
            let patch = ctx
                .patch_cache()
                .get_or_create_patch_files(src_hash, dest_hash, &src, &dest)
                .context("Failed to build delta")?;
            std::fs::write(&out, &patch)
                .with_context(|| format!("Failed to write patch: {}", out.display()))?;

            let state = if ctx.patch_cache().computed_count() > 0 { "computed" } else { "cached" };
            println!("Patch {} -> {}: {} bytes ({})", src_hash, dest_hash, patch.len(), state);
        }

        Commands::Apply {
            src,
            patch,
            out,
            expect,
        } => {
            let expected = expect
                .map(|s| s.parse::<Hash>().map_err(|e| anyhow::anyhow!(e)))
                .transpose()?;
            let patch_data = std::fs::read(&patch)
                .with_context(|| format!("Failed to read patch: {}", patch.display()))?;
            let hash = apply_patch_file(&src, &patch_data, &out, expected)
                .with_context(|| format!("Failed to patch {}", src.display()))?;
            println!("Wrote {} ({})", out.display(), hash);
        }

        Commands::CleanTemp => {
            let removed = cleanup_stale_temp_dirs(&config.temp_dir);
            println!("Removed {} stale staging directories from {}", removed, config.temp_dir.display());
        }
    }

    Ok(())
}
