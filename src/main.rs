//! Micro init binary.
//!
//! Run by the kernel as PID 1 with no arguments it boots the system. The
//! `check` and `plan` subcommands inspect a boot table without touching the
//! machine.

use buckos_microinit::init::require_pid1;
use buckos_microinit::{console, Config, Init, Linux, Task};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "microinit",
    about = "Buckos micro init - minimal PID 1 for appliance images",
    version,
    author
)]
struct Cli {
    /// Boot table (defaults to /etc/microinit.toml, then the built-in table)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Don't require running as PID 1. When the shell exits, shutdown still
    /// sends SIGKILL to every process this user may signal
    #[arg(long)]
    no_pid1: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the system (default)
    Boot,

    /// Validate the boot table and summarise it
    Check,

    /// Print the resolved boot table
    Plan {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    console::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Boot) | None => boot(&cli),

        Some(Commands::Check) => {
            let config = Config::load(cli.config.as_deref())?;
            config.validate()?;
            let registry = config.registry()?;

            let runs = registry
                .tasks()
                .iter()
                .filter(|task| matches!(task, Task::Run(_)))
                .count();

            println!("Boot table OK");
            println!("   Mounts: {}", config.mounts.len());
            println!("   Symlinks: {}", config.symlinks.len());
            println!(
                "   Configuration tasks: {} ({} programs)",
                registry.tasks().len(),
                runs
            );
            println!("   Supervised services: {}", registry.services().len());
            if let Some(ref root) = config.root_image {
                println!("   Root image: {} -> {}", root.image.display(), root.target.display());
            }
            println!("   Shell: {}", config.shell.path.display());
            println!("   Shutdown: {:?}", config.shutdown.action);
            Ok(())
        }

        Some(Commands::Plan { json }) => {
            let config = Config::load(cli.config.as_deref())?;
            if json {
                println!("{}", config.to_json()?);
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
    }
}

/// Run as the init system.
fn boot(cli: &Cli) -> anyhow::Result<()> {
    if cli.no_pid1 {
        tracing::warn!("Not checking for PID 1; shutdown will kill every process this user can signal");
    } else {
        require_pid1()?;
    }

    // Exiting PID 1 panics the kernel; a bad boot table halts visibly instead
    let init = match Config::load(cli.config.as_deref()).and_then(|config| Init::new(config, Linux)) {
        Ok(init) => init,
        Err(e) => console::fatal(&Linux, &e),
    };
    init.run()
}
