use clap::{Parser, Subcommand};
use ggpk::manifest::{EntryKind, Manifest};
use ggpk::verify::NodeKind;
use ggpk::{
    compact_to_path, pack_directory, verify, ByteSource, CodecId, CompactOptions, ContentResolver,
    ExtractOptions, Extractor, PackOptions, Tree, VerifyMode, VerifyOptions, VerifyReport,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ggpk", about = "Inspect, verify, defragment and extract GGPK containers", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the digest tree of one or more containers
    Check {
        #[arg(required = true, num_args = 1..)]
        containers: Vec<PathBuf>,
        /// Report every mismatch instead of stopping at the first
        #[arg(long)]
        all: bool,
    },
    /// Extract a file or directory
    Extract {
        container: PathBuf,
        /// Absolute path inside the container, e.g. /Art/x.dds
        path: String,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
        #[arg(short = 'd', long, default_value = ".")]
        dest: PathBuf,
        /// Block codec for compressed entries: brotli (default), zstd, lz4, none
        #[arg(long, default_value = "brotli")]
        codec: String,
    },
    /// Rewrite a container without free space
    Defrag {
        container: PathBuf,
        #[arg(short, long, default_value = "result.ggpk")]
        output: PathBuf,
    },
    /// List container contents
    List {
        container: PathBuf,
        /// Print a JSON manifest
        #[arg(long)]
        json: bool,
    },
    /// Build a container from a directory
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Store non-texture files compressed with this codec
        #[arg(short, long)]
        codec: Option<String>,
        #[arg(short, long, default_value = "5")]
        level: i32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    match Cli::parse().command {

        // ── Check ────────────────────────────────────────────────────────────
        Commands::Check { containers, all } => {
            let opts = VerifyOptions {
                mode: if all { VerifyMode::CollectAll } else { VerifyMode::FailFast },
            };
            let results = check_all(&containers, &opts);

            let mut failed = 0;
            for (path, result) in containers.iter().zip(results) {
                match result {
                    Ok(report) if report.is_ok() => println!(
                        "OK        {}  ({} files, {} directories, {} bytes hashed)",
                        path.display(), report.files_checked, report.dirs_checked, report.bytes_hashed
                    ),
                    Ok(report) => {
                        failed += 1;
                        println!("MISMATCH  {}", path.display());
                        for m in &report.mismatches {
                            let kind = match m.kind {
                                NodeKind::File      => "file",
                                NodeKind::Directory => "dir ",
                            };
                            println!("  {kind}  {}  expected {}  got {}",
                                m.path, hex::encode(m.expected), hex::encode(m.actual));
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        println!("ERROR     {}  {e}", path.display());
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} of {} container(s) failed verification", containers.len()).into());
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { container, path, recursive, dest, codec } => {
            let codec = CodecId::from_name(&codec).ok_or_else(|| format!("unknown codec '{codec}'"))?;
            let mut src = ByteSource::open(&container)?;
            let tree = Tree::build(&mut src)?;

            let opts = ExtractOptions { dest_dir: dest.clone(), recursive };
            let mut extractor = Extractor::new(ContentResolver::new(&mut src, codec), opts);
            extractor.extract(&tree, &path)?;
            let stats = extractor.finish(&tree)?;
            println!(
                "Extracted {} file(s), {} link(s), {} bytes to {}",
                stats.files_written, stats.links_resolved, stats.bytes_written, dest.display()
            );
        }

        // ── Defrag ───────────────────────────────────────────────────────────
        Commands::Defrag { container, output } => {
            let mut src = ByteSource::open(&container)?;
            let before = src.len();
            let tree = Tree::build(&mut src)?;
            let stats = compact_to_path(&tree, &mut src, &output, &CompactOptions::default())?;
            println!(
                "Defragmented {} → {}  ({} → {} bytes, {} directories, {} files)",
                container.display(), output.display(),
                before, stats.bytes_written, stats.directories, stats.files
            );
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { container, json } => {
            let mut src = ByteSource::open(&container)?;
            let manifest = Manifest::from_tree(&Tree::build(&mut src)?);
            if json {
                println!("{}", manifest.to_json()?);
            } else {
                println!("Container: {}", container.display());
                println!("{:>12}  {:<16}  Path", "Size", "Digest");
                for entry in &manifest.entries {
                    let size = match entry.kind {
                        EntryKind::File      => entry.size.unwrap_or_default().to_string(),
                        EntryKind::Directory => "<dir>".into(),
                    };
                    println!("{:>12}  {:<16}  {}", size, &entry.digest[..16], entry.path);
                }
                println!("{} directories, {} files, {} bytes",
                    manifest.directories, manifest.files, manifest.content_bytes);
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input, output, codec, level } => {
            let codec = codec
                .map(|name| CodecId::from_name(&name).ok_or_else(|| format!("unknown codec '{name}'")))
                .transpose()?;
            let stats = pack_directory(&input, &output, &PackOptions { codec, level })?;
            println!(
                "Created: {}  ({} directories, {} files, {} bytes)",
                output.display(), stats.directories, stats.files, stats.bytes_written
            );
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn check_one(path: &Path, opts: &VerifyOptions) -> ggpk::Result<VerifyReport> {
    let mut src = ByteSource::open(path)?;
    let tree = Tree::build(&mut src)?;
    verify(&tree, &mut src, opts.clone())
}

#[cfg(feature = "parallel")]
fn check_all(containers: &[PathBuf], opts: &VerifyOptions) -> Vec<ggpk::Result<VerifyReport>> {
    use rayon::prelude::*;
    containers.par_iter().map(|p| check_one(p, opts)).collect()
}

#[cfg(not(feature = "parallel"))]
fn check_all(containers: &[PathBuf], opts: &VerifyOptions) -> Vec<ggpk::Result<VerifyReport>> {
    containers.iter().map(|p| check_one(p, opts)).collect()
}
