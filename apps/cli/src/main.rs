//! SignalCraft CLI
//!
//! Runs the signalling relay and manages its long-term keys.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use signalcraft_crypto::{EncryptionKeypair, ServerKeys};
use signalcraft_daemon::RelayDaemon;
use signalcraft_keystore::{
    default_key_path, expand_path, load_keypair, load_or_generate_keypair, save_keypair,
};
use signalcraft_logging::init_logging;
use signalcraft_relay::RelayServer;
use signalcraft_settings::{default_settings_path, Settings};

/// SignalCraft - WebRTC signalling relay
#[derive(Parser)]
#[command(name = "signalcraft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// Settings file (defaults to ~/.signalcraft/settings.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overrides the settings file
        #[arg(short, long)]
        listen: Option<String>,

        /// Long-term key file, repeatable; the first is the default key.
        /// Overrides the settings file.
        #[arg(short, long = "key")]
        keys: Vec<PathBuf>,
    },

    /// Generate a new long-term key file
    Keygen {
        /// Output file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the public key of a key file
    Pubkey {
        /// Key file
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            keys,
        } => serve(cli.verbose, config, listen, keys).await,
        Commands::Keygen { out } => {
            init_logging(cli.verbose);
            keygen(&out.unwrap_or_else(default_key_path))
        }
        Commands::Pubkey { key } => {
            init_logging(cli.verbose);
            pubkey(&key.unwrap_or_else(default_key_path))
        }
    }
}

async fn serve(
    verbose: bool,
    config: Option<PathBuf>,
    listen: Option<String>,
    keys: Vec<PathBuf>,
) -> Result<()> {
    let settings_path = config
        .map(expand_path)
        .unwrap_or_else(default_settings_path);
    let mut settings = Settings::load_from(&settings_path)
        .with_context(|| format!("Failed to load settings from {:?}", settings_path))?;
    init_logging(verbose || settings.server.verbose);

    if let Some(listen) = listen {
        settings.server.listen_addr = listen;
    }
    let key_files: Vec<PathBuf> = if keys.is_empty() {
        settings.server.key_files.iter().map(PathBuf::from).collect()
    } else {
        keys
    };

    let mut keypairs = Vec::with_capacity(key_files.len());
    for (index, file) in key_files.iter().enumerate() {
        let path = expand_path(file);
        // Only the default key is generated on first start
        let keypair = if index == 0 {
            load_or_generate_keypair(&path)
        } else {
            load_keypair(&path)
        }
        .with_context(|| format!("Failed to load key {:?}", path))?;
        info!(
            "Server key {}: {}",
            index,
            hex::encode(keypair.public_key_bytes())
        );
        keypairs.push(keypair);
    }
    let server_keys = ServerKeys::new(keypairs).context("At least one key file is required")?;

    let relay_config = settings
        .relay_config()
        .context("Invalid relay settings")?;
    let relay = Arc::new(RelayServer::new(relay_config, server_keys)?);
    let daemon = RelayDaemon::bind(&settings.server.listen_addr, relay).await?;

    daemon
        .run(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
        })
        .await?;
    Ok(())
}

fn keygen(out: &Path) -> Result<()> {
    let path = expand_path(out);
    let keypair = EncryptionKeypair::generate();
    save_keypair(&path, &keypair).with_context(|| format!("Failed to write {:?}", path))?;

    println!("Key file:   {:?}", path);
    println!("Public key: {}", hex::encode(keypair.public_key_bytes()));
    Ok(())
}

fn pubkey(key: &Path) -> Result<()> {
    let path = expand_path(key);
    let keypair = load_keypair(&path).with_context(|| format!("Failed to read {:?}", path))?;
    println!("{}", hex::encode(keypair.public_key_bytes()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "signalcraft",
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--key",
            "a.key",
            "--key",
            "b.key",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { listen, keys, .. } => {
                assert_eq!(listen.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(keys, vec![PathBuf::from("a.key"), PathBuf::from("b.key")]);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_keygen_then_pubkey() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        keygen(&path).unwrap();
        pubkey(&path).unwrap();
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_missing_subcommand() {
        assert!(Cli::try_parse_from(["signalcraft"]).is_err());
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.key");
        keygen(&path).unwrap();
        assert!(keygen(&path).is_err());
    }
}
