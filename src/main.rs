use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kiln::config::Config;
use kiln::extension::ExtensionRegistry;
use kiln::module::{ModuleScope, ModuleScopeFlags, ModuleSearchPath};
use kiln::mounts::{MountEvent, MountMonitor, MountTable, UnixMountEntry, UnixMountPoint};

/// Kiln - inspect module directories and the mount tables of this system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List active mounts
    Mounts {
        /// Read this table instead of the system one
        #[arg(long)]
        table: Option<PathBuf>,

        /// Include system-internal mounts
        #[arg(short, long)]
        all: bool,
    },

    /// List configured mount points
    MountPoints {
        /// Read this table instead of the system fstab
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Show the mount containing a file
    MountFor { path: PathBuf },

    /// Print mount changes until interrupted
    Watch,

    /// Inspect module directories
    Modules {
        #[command(subcommand)]
        action: ModulesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ModulesCommand {
    /// Scan directories and list the extension points they populate
    Scan {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },

    /// Load every module in a directory
    Load { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_default()?,
    };

    // Logs go to stderr so listings can be piped
    let level = if args.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    let table = Arc::new(MountTable::from_config(&config.mounts));

    match args.command {
        Command::Mounts { table: path, all } => {
            let (entries, _) = match path {
                Some(path) => table.read_entries_from_file(&path),
                None => table.list_mount_entries(),
            };
            for entry in entries.iter().filter(|e| all || !e.is_system_internal()) {
                print_entry(entry);
            }
        }
        Command::MountPoints { table: path } => {
            let (points, _) = match path {
                Some(path) => table.read_points_from_file(&path),
                None => table.list_mount_points(),
            };
            for point in &points {
                print_point(point);
            }
        }
        Command::MountFor { path } => match table.entry_for_file(&path) {
            Some(entry) => print_entry(&entry),
            None => anyhow::bail!("No mount found for {}", path.display()),
        },
        Command::Watch => watch(&table).await?,
        Command::Modules { action } => run_modules(action),
    }

    Ok(())
}

async fn watch(table: &Arc<MountTable>) -> Result<()> {
    let monitor = MountMonitor::for_table(table)?;
    let mut events = monitor.subscribe();

    info!("Watching {}", table.entries_path().display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MountEvent::MountsChanged) => {
                    let (entries, _) = table.list_mount_entries();
                    println!("mounts changed ({} active)", entries.len());
                }
                Ok(MountEvent::MountPointsChanged) => {
                    let (points, _) = table.list_mount_points();
                    println!("mount points changed ({} configured)", points.len());
                }
                Err(RecvError::Lagged(missed)) => {
                    println!("missed {} events", missed);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn run_modules(action: ModulesCommand) {
    let registry = ExtensionRegistry::builder()
        .search_path(ModuleSearchPath::empty())
        .build();

    match action {
        ModulesCommand::Scan { dirs } => {
            let mut scope = ModuleScope::new(ModuleScopeFlags::BLOCK_DUPLICATES);

            for dir in &dirs {
                let summary = registry.scan_directory(dir, Some(&mut scope));
                println!(
                    "{}: {} lazy, {} loaded, {} failed",
                    dir.display(),
                    summary.lazy,
                    summary.loaded,
                    summary.failed
                );
            }

            for name in registry.point_names() {
                let Some(point) = registry.lookup(&name) else {
                    continue;
                };

                println!("{}", name);
                for extension in registry.get_extensions(&point) {
                    println!("  {:<24} {:>6}", extension.name(), extension.priority());
                }
            }
        }
        ModulesCommand::Load { dir } => {
            let modules = registry.load_directory(&dir, None);

            for module in &modules {
                println!("{} ({})", module.name(), module.path().display());
            }

            for module in &modules {
                module.unuse_module(&registry);
            }
        }
    }
}

fn print_entry(entry: &UnixMountEntry) {
    println!(
        "{} on {} type {} ({}){}",
        entry.device_path(),
        entry.mount_path(),
        entry.filesystem_type(),
        entry.options().unwrap_or("-"),
        if entry.is_read_only() { " [ro]" } else { "" }
    );
}

fn print_point(point: &UnixMountPoint) {
    let mut flags = Vec::new();
    if point.is_read_only() {
        flags.push("ro");
    }
    if point.is_user_mountable() {
        flags.push("user");
    }
    if point.is_loopback() {
        flags.push("loop");
    }

    println!(
        "{} -> {} type {} [{}]",
        point.device_path(),
        point.mount_path(),
        point.filesystem_type(),
        flags.join(",")
    );
}
