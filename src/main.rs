use std::path::PathBuf;
use std::process;

use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use log::info;

use certstore_migrator::config::load_storage_config;
use certstore_migrator::operations::{export_files, import_files_with_options, ImportOptions};
use certstore_migrator::{MigrateError, Registry};

#[derive(Parser, Debug)]
#[command(
    name = "migrator",
    version,
    about = "Copy certificates and keys between a directory and a storage backend",
    long_about = None
)]
struct Args {
    /// Path to a JSON file whose "storage" object configures the backend
    #[arg(short, long, value_name = "FILE", env = "MIGRATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(
        short,
        long,
        global = true,
        env = "MIGRATOR_VERBOSE",
        value_parser = FalseyValueParser::new()
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store every file below SOURCE into the storage STORAGE_NAME
    Import {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        #[arg(value_name = "STORAGE_NAME")]
        storage: String,

        /// Load each key back after storing it and compare checksums
        #[arg(long)]
        verify: bool,
    },
    /// Write every key of the storage STORAGE_NAME below DEST
    Export {
        #[arg(value_name = "STORAGE_NAME")]
        storage: String,

        #[arg(value_name = "DEST")]
        dest: PathBuf,
    },
    /// List the available storage backends
    Backends,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn run(args: &Args, registry: &Registry) -> Result<(), MigrateError> {
    let (name, stats) = match &args.command {
        Command::Backends => {
            for name in registry.names() {
                println!("{}", name);
            }
            return Ok(());
        }
        Command::Import {
            source,
            storage,
            verify,
        } => {
            let config = load_storage_config(args.config.as_deref())?;
            let backend = registry.init_storage(storage, &config)?;
            let opts = ImportOptions { verify: *verify };
            (storage, import_files_with_options(backend.as_ref(), source, &opts)?)
        }
        Command::Export { storage, dest } => {
            let config = load_storage_config(args.config.as_deref())?;
            let backend = registry.init_storage(storage, &config)?;
            (storage, export_files(backend.as_ref(), dest)?)
        }
    };

    info!(
        "Transferred {} files ({} bytes) using storage '{}'",
        stats.files, stats.bytes, name
    );
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let registry = Registry::with_builtin();
    if let Err(e) = run(&args, &registry) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
