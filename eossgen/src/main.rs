// SPDX-License-Identifier: MIT

mod commands;
mod config;
mod utils;

use std::path::PathBuf;

use anyhow::Context;

use clap::{Parser, Subcommand};
use colored::Colorize;
use eossfs::core::meta::DirTarget;

use crate::commands::{inspect, simulate, volume::Volume};
use crate::config::{ByteSize, EossConfig};
use crate::utils::{LogLevel, pretty_bytes, short_id};

#[derive(Parser)]
#[command(name = "eossgen", version, about = "EOSS volume tool", long_about = None)]
struct Cli {
    /// Config path
    #[arg(short, long, global = true, default_value = "config/eoss.toml")]
    config: PathBuf,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print allocator decisions
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chunk geometry of the configured layout
    Geometry,
    /// Print the identifier collision table
    Collision {
        /// Identifier width in bits
        #[arg(long, default_value_t = eossfs::core::id::ID_BITS)]
        bits: u32,
        /// File counts to evaluate (e.g. 1e30)
        counts: Vec<f64>,
    },
    /// Run a random allocation workload against an in-memory volume
    Simulate {
        #[arg(short, long, default_value_t = 10_000)]
        files: u64,
        /// Largest file size (e.g. 16M)
        #[arg(long, default_value = "16M")]
        max_size: ByteSize,
        /// Chance of releasing a live file after each allocation
        #[arg(long, default_value_t = 0.25)]
        release_ratio: f64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Store a file in the volume
    Put {
        /// Source file
        path: PathBuf,
        /// Name in the volume (defaults to the source file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Copy a file out of the volume
    Get {
        name: String,
        /// Destination path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Remove a file from the volume
    Rm {
        name: String,
        /// Also delete shared chunks left without tenants
        #[arg(long)]
        reclaim: bool,
    },
    /// List the files of the volume
    Ls,
    /// Verify bitmaps and placements of the volume
    Check,
}

async fn open_volume(cfg: &EossConfig) -> anyhow::Result<Volume> {
    Volume::open(&cfg.volume_dir(), cfg.layout()?, cfg.options()).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::log::init(LogLevel::from_flags(cli.quiet, cli.verbose));

    let cfg = EossConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Geometry => inspect::print_geometry(&cfg.layout()?),
        Commands::Collision { bits, counts } => inspect::print_collision_table(bits, &counts),
        Commands::Simulate {
            files,
            max_size,
            release_ratio,
            seed,
        } => {
            let layout = cfg.layout()?;
            log_info!(
                "Simulating {files} files up to {max_size} on {} chunks",
                pretty_bytes(layout.chunk_size())
            );
            let args = simulate::SimulateArgs {
                files,
                max_size: max_size.bytes(),
                release_ratio,
                seed,
                progress: utils::log_level() != LogLevel::Quiet,
            };
            let report = simulate::run(layout, cfg.options(), args).await?;
            simulate::print_report(&report);
            if !report.verify.ok() {
                anyhow::bail!("simulated volume failed verification");
            }
        }
        Commands::Put { path, name } => {
            let name = match name {
                Some(n) => n,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        anyhow::anyhow!("cannot derive a name from {}", path.display())
                    })?,
            };
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let size = file.metadata().await?.len();
            let vol = open_volume(&cfg).await?;
            let plan = vol.put_from(&name, file, size).await?;
            log_info!(
                "Stored '{name}' ({}) as {} in {} chunk(s)",
                pretty_bytes(plan.byte_size),
                short_id(&plan.file_id.hex()),
                plan.entries.len()
            );
        }
        Commands::Get { name, output } => {
            let vol = open_volume(&cfg).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            let n = vol.export(&name, &mut file).await?;
            log_info!(
                "Wrote '{name}' ({}) to {}",
                pretty_bytes(n),
                output.display()
            );
        }
        Commands::Rm { name, reclaim } => {
            let vol = open_volume(&cfg).await?;
            vol.remove(&name).await?;
            log_info!("Removed '{name}'");
            if reclaim {
                let n = vol.reclaim().await?;
                log_info!("Reclaimed {n} empty shared chunk(s)");
            }
        }
        Commands::Ls => {
            let vol = open_volume(&cfg).await?;
            for l in vol.list() {
                match (l.target, l.file) {
                    (DirTarget::Subdir(_), _) => {
                        println!("{:>12}  {:>12}  {}/", "-", "-", l.name.blue())
                    }
                    (DirTarget::File(_), Some((size, chunks))) => println!(
                        "{:>12}  {:>3} chunk(s)  {}",
                        pretty_bytes(size),
                        chunks,
                        l.name
                    ),
                    (DirTarget::File(id), None) => println!(
                        "{:>12}  {:>12}  {} {}",
                        "?",
                        "?",
                        l.name.red(),
                        format!("(no placement for {})", short_id(&id.hex())).dimmed()
                    ),
                }
            }
        }
        Commands::Check => {
            let vol = open_volume(&cfg).await?;
            let report = vol.check();
            let stats = vol.allocator().stats();
            log_info!(
                "{} shared chunk(s), {} quarantined, {} placement(s), {} free shared blocks",
                stats.shared_chunks,
                stats.quarantined,
                stats.placements,
                stats.free_shared_blocks
            );
            print!("{}", report.summary());
            if report.ok() {
                log_normal!("{}", "volume is consistent".green());
            } else {
                anyhow::bail!("volume check failed");
            }
        }
    }

    Ok(())
}
