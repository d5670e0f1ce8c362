//! MapKV CLI
//!
//! Inspect and edit a store from the command line. Values are read and
//! written as strings.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mapkv::{Config, Registry, StoreMode, SyncMode};
use tracing_subscriber::{fmt, EnvFilter};

/// MapKV CLI
#[derive(Parser, Debug)]
#[command(name = "mapkv-cli")]
#[command(about = "Inspect and edit MapKV stores")]
#[command(version)]
struct Args {
    /// Root directory holding the store files
    #[arg(short, long, default_value = "./mapkv_data")]
    root: PathBuf,

    /// Store ID
    #[arg(short, long, default_value = mapkv::config::DEFAULT_MMAP_ID)]
    id: String,

    /// Access mode
    #[arg(short, long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,

    /// Crypt key (plaintext when omitted)
    #[arg(short, long)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Single,
    Multi,
}

impl From<Mode> for StoreMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => StoreMode::SingleProcess,
            Mode::Multi => StoreMode::MultiProcess,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a string value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a string value
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete keys
    Del {
        /// The keys to delete
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// List all keys
    Keys,

    /// Show key count and file size
    Info,

    /// Compact the store and release unused space
    Trim,

    /// Re-encrypt the store under a new key (empty for plaintext)
    Rekey {
        /// The new crypt key
        new_key: String,
    },

    /// Check the store's files without opening it
    Verify,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mapkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder().root_dir(&args.root).build();
    let registry = Registry::new(config);

    if let Commands::Verify = args.command {
        let valid = registry.is_file_valid(&args.id, None);
        println!("{}", if valid { "valid" } else { "invalid" });
        std::process::exit(if valid { 0 } else { 1 });
    }

    let store = match registry.resolve(&args.id, args.mode.into(), args.key.as_deref(), None) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open '{}': {}", args.id, e);
            std::process::exit(1);
        }
    };

    let ok = match args.command {
        Commands::Get { key } => match store.get::<String>(&key) {
            Some(value) => {
                println!("{}", value);
                true
            }
            None => {
                println!("(nil)");
                true
            }
        },
        Commands::Set { key, value } => store.set_string(&key, &value),
        Commands::Del { keys } => store.remove_many(&keys),
        Commands::Keys => {
            let mut keys = store.all_keys();
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
            true
        }
        Commands::Info => {
            println!("id:         {}", store.mmap_id());
            println!("keys:       {}", store.count());
            println!("file size:  {}", store.total_size());
            println!("encrypted:  {}", store.crypt_key().is_some());
            true
        }
        Commands::Trim => store.trim(),
        Commands::Rekey { new_key } => store.re_key(&new_key),
        Commands::Verify => unreachable!("handled before opening"),
    };

    store.sync(SyncMode::Sync);
    registry.shutdown();

    if !ok {
        tracing::error!("Command failed");
        std::process::exit(1);
    }
}
