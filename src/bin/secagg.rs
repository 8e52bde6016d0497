//! `secagg`: key bootstrap, coordinator server and package tools.
//!
//! `secagg verify` exits 0 when the package signature is valid, 1 when it is
//! not, and 2 on usage errors (missing or unreadable inputs).

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use secure_fl::coordinator::{Coordinator, CoordinatorConfig};
use secure_fl::crypto::keys::public_key_from_pem;
use secure_fl::crypto::{KeyMaterial, KeyPair};
use secure_fl::registry::{export_package, read_bundle, Registry};
use secure_fl::FlError;

/// Secure federated aggregation
#[derive(Parser)]
#[clap(name = "secagg", version, about = "Secure federated aggregation coordinator and tools")]
struct Cli {
    /// Command to run
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create key files that do not exist yet
    Keygen {
        /// Directory for the PEM files
        #[clap(long, default_value = "keys")]
        dir: PathBuf,

        /// Create a client signing pair `<name>_priv.pem` instead of the coordinator pairs
        #[clap(long)]
        client: Option<String>,
    },

    /// Run the coordinator HTTP server
    Serve {
        /// Coordinator TOML configuration
        #[clap(short, long)]
        config: PathBuf,

        /// Address to listen on
        #[clap(short, long, default_value = "127.0.0.1:8000")]
        addr: SocketAddr,

        /// Override `min_clients` from the configuration
        #[clap(long)]
        min_clients: Option<u32>,
    },

    /// Write a signed package bundle for out-of-band transfer
    Export {
        /// Registry directory
        #[clap(long, default_value = "registry")]
        registry: PathBuf,

        /// Version to export (defaults to the head)
        #[clap(long)]
        version: Option<u64>,

        /// Output directory
        #[clap(short, long)]
        out: PathBuf,
    },

    /// Verify an exported package against the package-signing public key
    Verify {
        /// `package.json` or a bundle directory
        #[clap(short, long)]
        package: PathBuf,

        /// Signing public key (SPKI PEM)
        #[clap(short = 'k', long)]
        public_key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Keygen { dir, client } => keygen(dir, client),
        Commands::Serve {
            config,
            addr,
            min_clients,
        } => serve(config, addr, min_clients).await,
        Commands::Export {
            registry,
            version,
            out,
        } => export(registry, version, out),
        Commands::Verify {
            package,
            public_key,
        } => return verify(package, public_key),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn keygen(dir: PathBuf, client: Option<String>) -> Result<(), FlError> {
    match client {
        Some(name) => {
            KeyPair::load_or_generate(&dir, &name)?;
        }
        None => {
            KeyMaterial::load_or_generate(&dir)?;
        }
    }
    info!(dir = %dir.display(), "keys ready");
    Ok(())
}

async fn serve(config: PathBuf, addr: SocketAddr, min_clients: Option<u32>) -> Result<(), FlError> {
    let mut config = CoordinatorConfig::from_toml_file(&config)?;
    if let Some(n) = min_clients {
        config.min_clients = n;
    }
    let coordinator = tokio::task::spawn_blocking(move || Coordinator::open(config))
        .await
        .map_err(|e| FlError::Config(e.to_string()))??;
    secure_fl::server::serve(Arc::new(coordinator), addr).await
}

fn export(registry: PathBuf, version: Option<u64>, out: PathBuf) -> Result<(), FlError> {
    let registry = Registry::open(registry)?;
    let path = export_package(&registry, version, &out)?;
    println!("{}", path.display());
    Ok(())
}

fn verify(package: PathBuf, public_key: PathBuf) -> ExitCode {
    let usage = |e: &dyn std::fmt::Display| {
        eprintln!("error: {}", e);
        ExitCode::from(2)
    };
    let bundle = match read_bundle(&package) {
        Ok(b) => b,
        Err(e) => return usage(&e),
    };
    let key = match fs::read_to_string(&public_key)
        .map_err(FlError::from)
        .and_then(|pem| Ok(public_key_from_pem(&pem)?))
    {
        Ok(k) => k,
        Err(e) => return usage(&e),
    };

    match bundle.verify(&key) {
        Ok(true) => {
            println!("OK: version {} signature valid", bundle.metadata.version);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("INVALID: version {} signature does not verify", bundle.metadata.version);
            ExitCode::from(1)
        }
        Err(e) => {
            println!("INVALID: {}", e);
            ExitCode::from(1)
        }
    }
}
